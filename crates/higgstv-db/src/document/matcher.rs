//! Native filter evaluation against JSON documents.

use std::cmp::Ordering;

use serde_json::Value;

use crate::dsl::{Clause, Condition, Document, Sort, SortOrder};

pub fn matches(doc: &Document, clauses: &[Clause]) -> bool {
    clauses.iter().all(|clause| matches_clause(doc, clause))
}

fn matches_clause(doc: &Document, clause: &Clause) -> bool {
    match clause {
        Clause::Field { path, conditions } => {
            let found = resolve(doc, path);
            conditions.iter().all(|cond| matches_condition(&found, cond))
        }
        Clause::Or(branches) => branches.iter().any(|b| matches(doc, b)),
        Clause::And(branches) => branches.iter().all(|b| matches(doc, b)),
    }
}

/// Evaluate one condition against the values a path resolved to.
pub fn matches_condition(found: &[&Value], cond: &Condition) -> bool {
    match cond {
        Condition::Eq(expected) => equals_any(found, expected),
        Condition::Ne(expected) => !equals_any(found, expected),
        Condition::In(list) => list.iter().any(|expected| equals_any(found, expected)),
        Condition::Nin(list) => !list.iter().any(|expected| equals_any(found, expected)),
        Condition::Exists(present) => found.is_empty() != *present,
        Condition::Regex(pattern) => candidates(found).any(|v| v.as_str().is_some_and(|s| pattern.matches(s))),
    }
}

fn equals_any(found: &[&Value], expected: &Value) -> bool {
    if expected.is_null() && found.iter().all(|v| v.is_null()) {
        return true;
    }
    // An array equals a literal array, or contains a scalar
    found.iter().any(|v| values_equal(v, expected)) || candidates(found).any(|v| values_equal(v, expected))
}

/// Resolved values with arrays flattened one level.
fn candidates<'a>(found: &'a [&'a Value]) -> impl Iterator<Item = &'a Value> {
    found.iter().flat_map(|v| match v {
        Value::Array(items) => items.iter().collect::<Vec<_>>(),
        other => vec![*other],
    })
}

/// Collect every value reachable through a dotted path. Non-numeric
/// segments fan out across array elements; numeric ones index them.
pub fn resolve<'a>(doc: &'a Document, path: &str) -> Vec<&'a Value> {
    let mut segments = path.split('.');
    let Some(first) = segments.next() else {
        return Vec::new();
    };
    let mut current: Vec<&Value> = doc.get(first).into_iter().collect();

    for seg in segments {
        let mut next = Vec::new();
        for value in current {
            match value {
                Value::Object(map) => next.extend(map.get(seg)),
                Value::Array(items) => match seg.parse::<usize>() {
                    Ok(idx) => next.extend(items.get(idx)),
                    Err(_) => {
                        for item in items {
                            if let Value::Object(map) = item {
                                next.extend(map.get(seg));
                            }
                        }
                    }
                },
                _ => {}
            }
        }
        current = next;
    }
    current
}

pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| values_equal(x, y)))
        }
        _ => a == b,
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

/// Total order over JSON values: null < numbers < strings < objects <
/// arrays < booleans.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x
                .as_f64()
                .unwrap_or(0.0)
                .partial_cmp(&y.as_f64().unwrap_or(0.0))
                .unwrap_or(Ordering::Equal),
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(xs), Value::Array(ys)) => {
            for (x, y) in xs.iter().zip(ys) {
                let ord = compare_values(x, y);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            xs.len().cmp(&ys.len())
        }
        (Value::Object(xs), Value::Object(ys)) => {
            // Compare as key/value sequences
            for ((kx, vx), (ky, vy)) in xs.iter().zip(ys) {
                let ord = kx.cmp(ky).then_with(|| compare_values(vx, vy));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            xs.len().cmp(&ys.len())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

pub fn sort_documents(docs: &mut [Document], sort: &Sort) {
    if sort.is_empty() {
        return;
    }
    docs.sort_by(|a, b| {
        for (field, order) in &sort.0 {
            let va = resolve(a, field).first().copied().unwrap_or(&Value::Null);
            let vb = resolve(b, field).first().copied().unwrap_or(&Value::Null);
            let ord = compare_values(va, vb);
            let ord = match order {
                SortOrder::Ascending => ord,
                SortOrder::Descending => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::Filter;
    use serde_json::json;

    fn channel() -> Document {
        json!({
            "_id": "C1",
            "type": "default",
            "name": "Morning News",
            "tags": [1, 3],
            "owners": ["U1", "U2"],
            "permission": [
                {"user_id": "U3", "admin": true, "read": true, "write": true},
                {"user_id": "U4", "admin": false, "read": true, "write": false}
            ],
            "contents": [{"_id": 5, "name": "a"}, {"_id": 9, "name": "b"}]
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    fn check(filter: serde_json::Value) -> bool {
        let f = Filter::from_json(filter).unwrap();
        matches(&channel(), &f.clauses().unwrap())
    }

    #[test]
    fn test_array_membership() {
        assert!(check(json!({"owners": "U1"})));
        assert!(!check(json!({"owners": "U9"})));
        assert!(check(json!({"tags": {"$in": [2, 3]}})));
        assert!(check(json!({"tags": [1, 3]})));
    }

    #[test]
    fn test_nested_array_fields() {
        assert!(check(json!({"permission.user_id": "U3", "permission.admin": true})));
        assert!(check(json!({"contents._id": 9})));
        assert!(!check(json!({"contents._id": 7})));
    }

    #[test]
    fn test_exists_and_positions() {
        assert!(check(json!({"contents.0": {"$exists": true}})));
        assert!(!check(json!({"contents.2": {"$exists": true}})));
        assert!(check(json!({"cover": {"$exists": false}})));
    }

    #[test]
    fn test_nin_regex_or() {
        assert!(check(json!({"type": {"$nin": ["unclassified"]}})));
        assert!(!check(json!({"owners": {"$nin": ["U2"]}})));
        assert!(check(json!({"name": {"$regex": "news", "$options": "i"}})));
        assert!(!check(json!({"name": {"$regex": "news"}})));
        assert!(check(json!({"$or": [{"owners": "U9"}, {"permission.user_id": "U4"}]})));
    }

    #[test]
    fn test_numeric_equality_ignores_representation() {
        assert!(values_equal(&json!(5), &json!(5.0)));
        assert!(check(json!({"contents._id": 5.0})));
    }

    #[test]
    fn test_sort_documents() {
        let mut docs: Vec<Document> = vec![
            json!({"name": "b", "n": 2}).as_object().cloned().unwrap(),
            json!({"name": "a", "n": 2}).as_object().cloned().unwrap(),
            json!({"name": "c", "n": 1}).as_object().cloned().unwrap(),
        ];
        sort_documents(&mut docs, &Sort::default().desc("n").asc("name"));
        let names: Vec<_> = docs.iter().map(|d| d["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
