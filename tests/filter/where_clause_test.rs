//! Rendering filter mappings into `where` expressions.

use headless_bi::filter::{where_clause, FilterError, FilterStyle, FilterValue, Filters};
use insta::assert_snapshot;
use serde_json::json;

fn bare(value: serde_json::Value) -> String {
    where_clause(&Filters::from_json(value).unwrap(), FilterStyle::Bare).unwrap()
}

#[test]
fn test_store_type_and_status() {
    assert_snapshot!(
        bare(json!({"store_type": "Premium", "status": "completed"})),
        @"store_type = 'Premium' AND status = 'completed'"
    );
}

#[test]
fn test_region_list() {
    assert_snapshot!(bare(json!({"region": ["US", "EU"]})), @"region IN ('US', 'EU')");
}

#[test]
fn test_insertion_order_is_kept() {
    let keys = ["zeta", "alpha", "mid", "beta"];
    let mut filters = Filters::new();
    for key in keys {
        filters.insert(key, FilterValue::Text("x".to_string()));
    }

    let expr = where_clause(&filters, FilterStyle::Bare).unwrap();
    let rendered_keys: Vec<&str> = expr
        .split(" AND ")
        .map(|clause| clause.split(' ').next().unwrap())
        .collect();
    assert_eq!(rendered_keys, keys);
}

#[test]
fn test_every_text_value_is_a_quoted_equality() {
    let expr = bare(json!({"a": "1", "b": "two", "c": ""}));
    for clause in expr.split(" AND ") {
        let (_, rhs) = clause.split_once(" = ").unwrap();
        assert!(rhs.starts_with('\'') && rhs.ends_with('\''), "{}", clause);
    }
    assert_eq!(expr.matches(" AND ").count(), 2);
}

#[test]
fn test_list_keeps_every_element_in_order() {
    let expr = bare(json!({"status": ["placed", "shipped", "completed", "returned"]}));
    assert_eq!(
        expr,
        "status IN ('placed', 'shipped', 'completed', 'returned')"
    );
}

#[test]
fn test_numbers_are_unquoted() {
    assert_snapshot!(
        bare(json!({"store_id": 42, "discount": 0.5})),
        @"store_id = 42 AND discount = 0.5"
    );
}

#[test]
fn test_templated_style() {
    let filters = Filters::parse_str(r#"{"order__status": "completed", "customer__region": ["US", "EU"]}"#).unwrap();
    assert_snapshot!(
        where_clause(&filters, FilterStyle::Templated).unwrap(),
        @"{{ Dimension('order__status') }} = 'completed' AND {{ Dimension('customer__region') }} IN ('US', 'EU')"
    );
}

#[test]
fn test_later_insert_replaces_in_place() {
    let mut filters = Filters::new();
    filters.insert("a", FilterValue::Text("1".to_string()));
    filters.insert("b", FilterValue::Text("2".to_string()));
    filters.insert("a", FilterValue::Text("3".to_string()));

    assert_eq!(
        where_clause(&filters, FilterStyle::Bare).unwrap(),
        "a = '3' AND b = '2'"
    );
}

#[test]
fn test_malformed_filter_text() {
    let err = Filters::parse_str("[1, 2]").unwrap_err();
    assert_eq!(
        err,
        FilterError::Malformed("expected an object, got a list".to_string())
    );
    assert!(Filters::parse_str("store_type=Premium").is_err());
}
