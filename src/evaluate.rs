//! Local query evaluation: applies a [`QueryDescriptor`]'s filters, ordering,
//! and limit to a set of candidate documents.
//!
//! Used by the in-memory driver (which has no server to evaluate for it) and
//! by the Firestore watch aggregator (to impose the descriptor's deterministic
//! order and limit on the accumulated target document set).

use std::cmp::Ordering;

use crate::query::{Filter, Operator, QueryDescriptor};
use crate::value::{Document, Value};

/// Filters, orders, and truncates `documents` per `descriptor`.
///
/// Filters apply conjunctively. Results are ordered by the `order_by` field
/// ascending when present, ties (and the no-`order_by` case) broken by
/// document id ascending, then truncated to `limit`.
pub fn apply_query(mut documents: Vec<Document>, descriptor: &QueryDescriptor) -> Vec<Document> {
    documents.retain(|doc| matches_filters(doc, &descriptor.filters));
    documents.sort_by(|a, b| compare_documents(a, b, descriptor.order_by.as_deref()));
    if let Some(limit) = descriptor.limit {
        documents.truncate(limit as usize);
    }
    documents
}

pub fn matches_filters(document: &Document, filters: &[Filter]) -> bool {
    filters.iter().all(|filter| matches_filter(document, filter))
}

fn matches_filter(document: &Document, filter: &Filter) -> bool {
    let value = match document.field(&filter.field) {
        Some(value) => value,
        // A missing field never satisfies a predicate, inequalities included:
        // the field has to exist to be compared, as in the vendor SDKs.
        None => return false,
    };
    evaluate(filter.operator, value, &filter.value)
}

fn evaluate(operator: Operator, value: &Value, operand: &Value) -> bool {
    match operator {
        Operator::Eq => value == operand,
        Operator::NotEq => value != operand,
        Operator::Lt => value.compare(operand) == Some(Ordering::Less),
        Operator::LtEq => matches!(
            value.compare(operand),
            Some(Ordering::Less | Ordering::Equal)
        ),
        Operator::Gt => value.compare(operand) == Some(Ordering::Greater),
        Operator::GtEq => matches!(
            value.compare(operand),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Operator::ArrayContains => match value {
            Value::Sequence(items) => items.contains(operand),
            _ => false,
        },
        Operator::ArrayContainsAny => match (value, operand) {
            (Value::Sequence(items), Value::Sequence(needles)) => {
                needles.iter().any(|needle| items.contains(needle))
            }
            _ => false,
        },
        Operator::In => match operand {
            Value::Sequence(candidates) => candidates.contains(value),
            _ => false,
        },
        Operator::NotIn => match operand {
            Value::Sequence(candidates) => !candidates.contains(value),
            _ => false,
        },
    }
}

fn compare_documents(a: &Document, b: &Document, order_by: Option<&str>) -> Ordering {
    if let Some(field) = order_by {
        let ordering = match (a.field(field), b.field(field)) {
            (Some(left), Some(right)) => left.compare(right).unwrap_or(Ordering::Equal),
            // Documents missing the ordering field sort first, together.
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    a.id.cmp(&b.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryBuilder;
    use crate::value::fields_from_json;
    use serde_json::json;

    fn doc(id: &str, fields: serde_json::Value) -> Document {
        Document::new(id, fields_from_json(fields).unwrap())
    }

    fn people() -> Vec<Document> {
        vec![
            doc("alice", json!({ "age": 30, "tags": ["admin", "eng"] })),
            doc("bob", json!({ "age": 17, "tags": ["eng"] })),
            doc("carol", json!({ "age": 25, "tags": [] })),
            doc("dave", json!({ "age": 30 })),
        ]
    }

    #[test]
    fn conjunctive_filters() {
        let descriptor = QueryBuilder::new("people")
            .filter("age", Operator::GtEq, 18i64)
            .unwrap()
            .filter("tags", Operator::ArrayContains, "eng")
            .unwrap()
            .build()
            .unwrap();

        let out = apply_query(people(), &descriptor);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, "alice");
    }

    #[test]
    fn order_by_with_id_tie_break() {
        let descriptor = QueryBuilder::new("people").order_by("age").build().unwrap();
        let ids: Vec<_> = apply_query(people(), &descriptor)
            .into_iter()
            .map(|d| d.id)
            .collect();
        // alice and dave tie on age 30; alice wins on id.
        assert_eq!(ids, vec!["bob", "carol", "alice", "dave"]);
    }

    #[test]
    fn limit_truncates_after_ordering() {
        let descriptor = QueryBuilder::new("people")
            .order_by("age")
            .limit(2)
            .build()
            .unwrap();
        let ids: Vec<_> = apply_query(people(), &descriptor)
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec!["bob", "carol"]);
    }

    #[test]
    fn missing_field_never_matches() {
        let descriptor = QueryBuilder::new("people")
            .filter("tags", Operator::ArrayContains, "eng")
            .unwrap()
            .build()
            .unwrap();
        let out = apply_query(people(), &descriptor);
        assert!(out.iter().all(|d| d.id != "dave"));
    }

    #[test]
    fn membership_operators() {
        let in_query = QueryBuilder::new("people")
            .filter("age", Operator::In, vec![17i64, 25])
            .unwrap()
            .build()
            .unwrap();
        let ids: Vec<_> = apply_query(people(), &in_query)
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec!["bob", "carol"]);

        let not_in = QueryBuilder::new("people")
            .filter("age", Operator::NotIn, vec![30i64])
            .unwrap()
            .build()
            .unwrap();
        let ids: Vec<_> = apply_query(people(), &not_in)
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec!["bob", "carol"]);

        let any = QueryBuilder::new("people")
            .filter("tags", Operator::ArrayContainsAny, vec!["admin", "ops"])
            .unwrap()
            .build()
            .unwrap();
        let ids: Vec<_> = apply_query(people(), &any)
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec!["alice"]);
    }

    #[test]
    fn mixed_numeric_comparison() {
        let docs = vec![doc("x", json!({ "score": 1.5 }))];
        let descriptor = QueryBuilder::new("c")
            .filter("score", Operator::Gt, 1i64)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(apply_query(docs, &descriptor).len(), 1);
    }
}
