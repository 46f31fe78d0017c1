#![no_main]
use std::sync::LazyLock;

use chrono::NaiveDate;
use governed_sql::generate::{generate_with, GenerateOptions};
use governed_sql::{safety, validate, QuerySpec, SemanticModel};
use libfuzzer_sys::fuzz_target;

static MODEL: LazyLock<SemanticModel> = LazyLock::new(|| {
    SemanticModel::from_yaml(include_str!("../../tests/fixtures/semantic_model.yml"))
        .expect("fixture model parses")
});

fuzz_target!(|spec: QuerySpec| {
    let options = GenerateOptions {
        today: NaiveDate::from_ymd_opt(2024, 3, 15).expect("valid date"),
        strict_joins: true,
    };
    let errors = validate(&spec, &MODEL);
    let generated = generate_with(&spec, &MODEL, &options);
    if !errors.is_empty() {
        return;
    }
    let sql = generated.expect("validated spec failed to generate");
    // Free-text filter values can carry keywords, so only the checks that
    // depend on generated structure are asserted.
    let security = MODEL.security();
    assert!(safety::check_statement_kind(&sql).is_empty(), "{sql}");
    assert!(safety::check_blocked_columns(&sql, security).is_empty(), "{sql}");
    let plain = spec
        .filters
        .values()
        .flatten()
        .all(|v| v.chars().all(|c| c.is_ascii_alphanumeric() || c == ' '));
    if plain {
        assert!(safety::check_no_select_star(&sql).is_empty(), "{sql}");
        assert!(safety::check_single_statement(&sql).is_empty(), "{sql}");
        assert!(safety::check_allowed_tables(&sql, MODEL.allowed_tables()).is_empty(), "{sql}");
    }
});
