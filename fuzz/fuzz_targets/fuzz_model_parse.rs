#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        // Rejected models are fine; panics are not.
        if let Ok(model) = governed_sql::SemanticModel::from_yaml(s) {
            for name in model.metric_names() {
                assert!(model.metric(&name).is_some());
            }
            assert!(model.security().max_rows > 0);
        }
    }
});
