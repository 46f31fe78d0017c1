#![no_main]
use std::sync::LazyLock;

use libfuzzer_sys::fuzz_target;
use governed_sql::{audit, SemanticModel};

static MODEL: LazyLock<SemanticModel> = LazyLock::new(|| {
    SemanticModel::from_yaml(include_str!("../../tests/fixtures/semantic_model.yml"))
        .expect("fixture model parses")
});

fuzz_target!(|sql: &str| {
    let first = audit(sql, &MODEL);
    // Missing LIMIT alone guarantees a violation on LIMIT-free text.
    if !sql.to_ascii_uppercase().contains("LIMIT") {
        assert!(!first.is_empty());
    }
    assert_eq!(first, audit(sql, &MODEL));
});
