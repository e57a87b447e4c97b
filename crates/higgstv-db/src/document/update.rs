//! Native application of update operators to a JSON document.

use std::cmp::Ordering;

use serde_json::{Map, Value};

use super::matcher::{compare_values, matches, matches_condition, resolve, values_equal};
use crate::dsl::{Clause, Condition, Document, Filter, Update, each_values, is_operator_object};
use crate::error::{Result, StoreError};

/// Apply `update` in place. `clauses` is the filter that selected the
/// document; positional `$` segments resolve against it. Returns whether the
/// document changed.
pub fn apply(doc: &mut Document, update: &Update, clauses: &[Clause]) -> Result<bool> {
    let before = doc.clone();

    for (path, value) in &update.set {
        let path = resolve_positional(doc, path, clauses)?;
        set_path(doc, &path, value.clone())?;
    }

    for (path, arg) in &update.add_to_set {
        let path = resolve_positional(doc, path, clauses)?;
        let items = array_at(doc, &path)?;
        for value in each_values(arg) {
            if !items.iter().any(|existing| values_equal(existing, &value)) {
                items.push(value);
            }
        }
    }

    for (path, arg) in &update.pull {
        let path = resolve_positional(doc, path, clauses)?;
        let predicate = PullPredicate::parse(arg)?;
        if let Some(Value::Array(items)) = get_path_mut(doc, &path) {
            items.retain(|item| !predicate.matches(item));
        }
    }

    for (path, arg) in &update.push {
        let path = resolve_positional(doc, path, clauses)?;
        let items = array_at(doc, &path)?;
        match arg {
            Value::Object(map) if map.contains_key("$each") => items.extend(each_values(arg)),
            other => items.push(other.clone()),
        }
    }

    for (path, by) in &update.inc {
        let current = resolve(doc, path).first().copied().cloned().unwrap_or(Value::from(0));
        set_path(doc, path, add_numbers(&current, by)?)?;
    }

    for (path, candidate) in &update.max {
        let current = resolve(doc, path).first().copied().cloned();
        let replace = match &current {
            None | Some(Value::Null) => true,
            Some(existing) => compare_values(candidate, existing) == Ordering::Greater,
        };
        if replace {
            set_path(doc, path, candidate.clone())?;
        }
    }

    for path in update.unset.keys() {
        remove_path(doc, path);
    }

    Ok(*doc != before)
}

fn remove_path(doc: &mut Document, path: &str) {
    match path.rsplit_once('.') {
        None => {
            doc.remove(path);
        }
        Some((parent, last)) => {
            if let Some(Value::Object(map)) = get_path_mut(doc, parent) {
                map.remove(last);
            }
        }
    }
}

/// Build the document an upsert inserts: equality fields of the filter,
/// then the update applied on top.
pub fn upsert_seed(filter: &Filter) -> Result<Document> {
    let mut seed = Map::new();
    for (path, value) in filter.equality_fields() {
        set_path(&mut seed, path, value.clone())?;
    }
    Ok(seed)
}

enum PullPredicate {
    Equals(Value),
    Condition(Vec<Condition>),
    Filter(Vec<Clause>),
}

impl PullPredicate {
    fn parse(arg: &Value) -> Result<Self> {
        if is_operator_object(arg) {
            let f = Filter::new().eq("v", arg.clone());
            let conds = match f.clauses()?.into_iter().next() {
                Some(Clause::Field { conditions, .. }) => conditions,
                _ => Vec::new(),
            };
            return Ok(PullPredicate::Condition(conds));
        }
        match arg {
            Value::Object(map) => Ok(PullPredicate::Filter(Filter::from_json(Value::Object(map.clone()))?.clauses()?)),
            other => Ok(PullPredicate::Equals(other.clone())),
        }
    }

    fn matches(&self, item: &Value) -> bool {
        match self {
            PullPredicate::Equals(expected) => values_equal(item, expected),
            PullPredicate::Condition(conds) => conds.iter().all(|c| matches_condition(&[item], c)),
            PullPredicate::Filter(clauses) => match item {
                Value::Object(map) => matches(map, clauses),
                _ => false,
            },
        }
    }
}

// `contents.$.name` -> `contents.3.name`, picking the first element that
// satisfies every filter clause on `contents.*`.
fn resolve_positional(doc: &Document, path: &str, clauses: &[Clause]) -> Result<String> {
    let Some(pos) = path.find(".$") else {
        return Ok(path.to_string());
    };
    let array_path = &path[..pos];
    let rest = &path[pos + 2..];
    let prefix = format!("{}.", array_path);

    let element_clauses: Vec<Clause> = clauses
        .iter()
        .filter_map(|c| match c {
            Clause::Field { path, conditions } if path.starts_with(&prefix) => Some(Clause::Field {
                path: path[prefix.len()..].to_string(),
                conditions: conditions.clone(),
            }),
            _ => None,
        })
        .collect();

    let found = resolve(doc, array_path);
    let items = match found.first().copied() {
        Some(Value::Array(items)) => items,
        _ => return Err(positional_error(path)),
    };
    if element_clauses.is_empty() {
        return Err(positional_error(path));
    }

    let idx = items
        .iter()
        .position(|item| matches!(item, Value::Object(map) if matches(map, &element_clauses)))
        .ok_or_else(|| positional_error(path))?;

    Ok(format!("{}.{}{}", array_path, idx, rest))
}

fn positional_error(path: &str) -> StoreError {
    StoreError::InvalidQuery(format!("positional update {} has no matching array element in the filter", path))
}

pub fn set_path(doc: &mut Document, path: &str, value: Value) -> Result<()> {
    let segments: Vec<&str> = path.split('.').collect();
    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| StoreError::InvalidQuery("empty update path".into()))?;

    let mut current = doc
        .entry(parents.first().copied().unwrap_or(*last).to_string())
        .or_insert(Value::Null);
    if parents.is_empty() {
        *current = value;
        return Ok(());
    }

    for seg in &parents[1..] {
        current = step_mut(current, seg, path)?;
    }
    assign(current, last, value, path)
}

fn step_mut<'a>(value: &'a mut Value, seg: &str, path: &str) -> Result<&'a mut Value> {
    if value.is_null() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => Ok(map.entry(seg.to_string()).or_insert(Value::Null)),
        Value::Array(items) => {
            let idx = seg
                .parse::<usize>()
                .map_err(|_| StoreError::InvalidQuery(format!("cannot traverse array with {} in {}", seg, path)))?;
            while items.len() <= idx {
                items.push(Value::Null);
            }
            Ok(&mut items[idx])
        }
        _ => Err(StoreError::InvalidQuery(format!("cannot set {} on a scalar", path))),
    }
}

fn assign(target: &mut Value, last: &str, value: Value, path: &str) -> Result<()> {
    if target.is_null() {
        *target = Value::Object(Map::new());
    }
    match target {
        Value::Object(map) => {
            map.insert(last.to_string(), value);
            Ok(())
        }
        Value::Array(items) => {
            let idx = last
                .parse::<usize>()
                .map_err(|_| StoreError::InvalidQuery(format!("cannot index array with {} in {}", last, path)))?;
            while items.len() <= idx {
                items.push(Value::Null);
            }
            items[idx] = value;
            Ok(())
        }
        _ => Err(StoreError::InvalidQuery(format!("cannot set {} on a scalar", path))),
    }
}

fn get_path_mut<'a>(doc: &'a mut Document, path: &str) -> Option<&'a mut Value> {
    let mut segments = path.split('.');
    let mut current = doc.get_mut(segments.next()?)?;
    for seg in segments {
        current = match current {
            Value::Object(map) => map.get_mut(seg)?,
            Value::Array(items) => items.get_mut(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// The array at `path`, created empty when absent.
fn array_at<'a>(doc: &'a mut Document, path: &str) -> Result<&'a mut Vec<Value>> {
    if get_path_mut(doc, path).is_none_or(|v| v.is_null()) {
        set_path(doc, path, Value::Array(Vec::new()))?;
    }
    match get_path_mut(doc, path) {
        Some(Value::Array(items)) => Ok(items),
        _ => Err(StoreError::InvalidQuery(format!("{} is not an array", path))),
    }
}

fn add_numbers(current: &Value, by: &Value) -> Result<Value> {
    match (current, by) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => Ok(Value::from(a + b)),
            _ => Ok(Value::from(a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0))),
        },
        (Value::Null, Value::Number(_)) => Ok(by.clone()),
        _ => Err(StoreError::InvalidQuery("$inc applies to numeric fields only".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> Document {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_set_nested_creates_objects() {
        let mut d = doc(json!({"_id": "C1"}));
        let changed = apply(&mut d, &Update::new().set("cover.default", "x.png"), &[]).unwrap();
        assert!(changed);
        assert_eq!(d["cover"], json!({"default": "x.png"}));
    }

    #[test]
    fn test_positional_set() {
        let mut d = doc(json!({"_id": "C1", "contents": [{"_id": 5, "name": "a"}, {"_id": 9, "name": "b"}]}));
        let filter = Filter::by_id("C1").eq("contents._id", 9);
        apply(&mut d, &Update::new().set("contents.$.name", "renamed"), &filter.clauses().unwrap()).unwrap();
        assert_eq!(d["contents"][1]["name"], "renamed");
        assert_eq!(d["contents"][0]["name"], "a");
    }

    #[test]
    fn test_positional_without_match_fails() {
        let mut d = doc(json!({"_id": "C1", "contents": [{"_id": 5}]}));
        let filter = Filter::by_id("C1").eq("contents._id", 6);
        let err = apply(&mut d, &Update::new().set("contents.$.name", "x"), &filter.clauses().unwrap());
        assert!(err.is_err());
    }

    #[test]
    fn test_add_to_set_pull_push() {
        let mut d = doc(json!({"owners": ["U1"], "contents": [{"_id": 1}, {"_id": 2}, {"_id": 3}]}));
        let update = Update::new()
            .add_each_to_set("owners", ["U1", "U2"])
            .pull_where_in("contents", "_id", [1, 3])
            .push("contents_order", 2);
        apply(&mut d, &update, &[]).unwrap();
        assert_eq!(d["owners"], json!(["U1", "U2"]));
        assert_eq!(d["contents"], json!([{"_id": 2}]));
        assert_eq!(d["contents_order"], json!([2]));
    }

    #[test]
    fn test_pull_scalars() {
        let mut d = doc(json!({"tags": [1, 2, 3, 2]}));
        apply(&mut d, &Update::new().pull("tags", 2), &[]).unwrap();
        assert_eq!(d["tags"], json!([1, 3]));
        apply(&mut d, &Update::new().pull("tags", json!({"$in": [1]})), &[]).unwrap();
        assert_eq!(d["tags"], json!([3]));
    }

    #[test]
    fn test_inc_and_max() {
        let mut d = doc(json!({"_id": "program_id"}));
        apply(&mut d, &Update::new().inc("seq", 1), &[]).unwrap();
        assert_eq!(d["seq"], 1);
        apply(&mut d, &Update::new().max("seq", 9), &[]).unwrap();
        assert_eq!(d["seq"], 9);
        let changed = apply(&mut d, &Update::new().max("seq", 4), &[]).unwrap();
        assert!(!changed);
        assert_eq!(d["seq"], 9);
    }

    #[test]
    fn test_unset() {
        let mut d = doc(json!({"_id": "U1", "access_key": "k", "cover": {"default": "a"}}));
        apply(&mut d, &Update::new().unset("access_key").unset("cover.default"), &[]).unwrap();
        assert_eq!(Value::Object(d), json!({"_id": "U1", "cover": {}}));
    }

    #[test]
    fn test_upsert_seed() {
        let filter = Filter::by_id("program_id").exists("seq", true);
        let seed = upsert_seed(&filter).unwrap();
        assert_eq!(Value::Object(seed), json!({"_id": "program_id"}));
    }
}
