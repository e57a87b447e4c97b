//! Backend-neutral query and mutation vocabulary.
//!
//! Filters and updates use the familiar document-database shape (`$in`,
//! `$set`, dotted paths) so callers never see which engine is underneath.
//! Both adapters consume the parsed form produced here.

use serde_json::{Map, Value};

use crate::error::{Result, StoreError};

pub type Document = Map<String, Value>;

// -- Filters --

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter(Document);

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_id(id: impl Into<Value>) -> Self {
        Self::new().eq("_id", id)
    }

    pub fn from_json(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(StoreError::InvalidQuery(format!("filter must be an object, got {}", other))),
        }
    }

    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.0.insert(field.to_string(), value.into());
        self
    }

    pub fn ne(self, field: &str, value: impl Into<Value>) -> Self {
        self.op(field, "$ne", value.into())
    }

    pub fn is_in<V: Into<Value>>(self, field: &str, values: impl IntoIterator<Item = V>) -> Self {
        let list = values.into_iter().map(Into::into).collect();
        self.op(field, "$in", Value::Array(list))
    }

    pub fn not_in<V: Into<Value>>(self, field: &str, values: impl IntoIterator<Item = V>) -> Self {
        let list = values.into_iter().map(Into::into).collect();
        self.op(field, "$nin", Value::Array(list))
    }

    pub fn exists(self, field: &str, present: bool) -> Self {
        self.op(field, "$exists", Value::Bool(present))
    }

    pub fn regex(self, field: &str, pattern: &str, options: &str) -> Self {
        self.op(field, "$regex", Value::String(pattern.to_string()))
            .op(field, "$options", Value::String(options.to_string()))
    }

    pub fn or(mut self, branches: Vec<Filter>) -> Self {
        let list = branches.into_iter().map(|f| Value::Object(f.0)).collect();
        self.0.insert("$or".to_string(), Value::Array(list));
        self
    }

    fn op(mut self, field: &str, op: &str, arg: Value) -> Self {
        let entry = self
            .0
            .entry(field.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !is_operator_object(entry) {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(ops) = entry {
            ops.insert(op.to_string(), arg);
        }
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_document(&self) -> &Document {
        &self.0
    }

    pub fn clauses(&self) -> Result<Vec<Clause>> {
        parse_clauses(&self.0)
    }

    /// Top-level literal equality predicates. An upsert seeds the new
    /// document from these.
    pub fn equality_fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0
            .iter()
            .filter(|(k, v)| !k.starts_with('$') && !is_operator_object(v))
            .map(|(k, v)| (k.as_str(), v))
    }
}

/// An object whose keys are all `$` operators, as opposed to a literal
/// sub-document compared by equality.
pub fn is_operator_object(value: &Value) -> bool {
    match value {
        Value::Object(map) => !map.is_empty() && map.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    Field { path: String, conditions: Vec<Condition> },
    Or(Vec<Vec<Clause>>),
    And(Vec<Vec<Clause>>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(Value),
    Ne(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Regex(Pattern),
}

fn parse_clauses(map: &Document) -> Result<Vec<Clause>> {
    map.iter()
        .map(|(key, value)| match key.as_str() {
            "$or" | "$and" => {
                let branches = value
                    .as_array()
                    .ok_or_else(|| StoreError::InvalidQuery(format!("{} expects an array", key)))?
                    .iter()
                    .map(|branch| match branch {
                        Value::Object(m) => parse_clauses(m),
                        _ => Err(StoreError::InvalidQuery(format!("{} branches must be objects", key))),
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(if key == "$or" { Clause::Or(branches) } else { Clause::And(branches) })
            }
            op if op.starts_with('$') => Err(StoreError::InvalidQuery(format!("unsupported operator {}", op))),
            path => Ok(Clause::Field {
                path: path.to_string(),
                conditions: parse_conditions(value)?,
            }),
        })
        .collect()
}

fn parse_conditions(value: &Value) -> Result<Vec<Condition>> {
    let ops = match value {
        Value::Object(map) if is_operator_object(value) => map,
        literal => return Ok(vec![Condition::Eq(literal.clone())]),
    };
    let options = ops.get("$options").and_then(Value::as_str).unwrap_or("");

    let mut conditions = Vec::with_capacity(ops.len());
    for (op, arg) in ops {
        match op.as_str() {
            "$eq" => conditions.push(Condition::Eq(arg.clone())),
            "$ne" => conditions.push(Condition::Ne(arg.clone())),
            "$in" => conditions.push(Condition::In(list_arg(op, arg)?)),
            "$nin" => conditions.push(Condition::Nin(list_arg(op, arg)?)),
            "$exists" => conditions.push(Condition::Exists(truthy(arg))),
            "$regex" => {
                let raw = arg
                    .as_str()
                    .ok_or_else(|| StoreError::InvalidQuery("$regex expects a string".into()))?;
                conditions.push(Condition::Regex(Pattern::parse(raw, options)));
            }
            "$options" => {}
            other => return Err(StoreError::InvalidQuery(format!("unsupported operator {}", other))),
        }
    }
    Ok(conditions)
}

fn list_arg(op: &str, arg: &Value) -> Result<Vec<Value>> {
    arg.as_array()
        .cloned()
        .ok_or_else(|| StoreError::InvalidQuery(format!("{} expects an array", op)))
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::Null => false,
        _ => true,
    }
}

/// Substring pattern with optional `^`/`$` anchors.
///
/// Both adapters implement exactly this subset so a `$regex` filter returns
/// the same entities on either engine. Case folding is ASCII-only, which is
/// what SQLite's `LIKE` does.
#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    pub text: String,
    pub anchor_start: bool,
    pub anchor_end: bool,
    pub case_insensitive: bool,
}

impl Pattern {
    pub fn parse(raw: &str, options: &str) -> Self {
        let mut s = raw;
        let anchor_start = s.starts_with('^');
        if anchor_start {
            s = &s[1..];
        }
        let anchor_end = s.ends_with('$') && !s.ends_with("\\$");
        if anchor_end {
            s = &s[..s.len() - 1];
        }

        let mut text = String::with_capacity(s.len());
        let mut chars = s.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                if let Some(escaped) = chars.next() {
                    text.push(escaped);
                }
            } else {
                text.push(c);
            }
        }

        Self {
            text,
            anchor_start,
            anchor_end,
            case_insensitive: options.contains('i'),
        }
    }

    pub fn matches(&self, candidate: &str) -> bool {
        let (hay, needle) = if self.case_insensitive {
            (candidate.to_ascii_lowercase(), self.text.to_ascii_lowercase())
        } else {
            (candidate.to_string(), self.text.clone())
        };
        match (self.anchor_start, self.anchor_end) {
            (true, true) => hay == needle,
            (true, false) => hay.starts_with(&needle),
            (false, true) => hay.ends_with(&needle),
            (false, false) => hay.contains(&needle),
        }
    }

    /// `LIKE` operand, to be used with `ESCAPE '\'`.
    pub fn to_like(&self) -> String {
        let mut out = String::with_capacity(self.text.len() + 2);
        if !self.anchor_start {
            out.push('%');
        }
        for c in self.text.chars() {
            if matches!(c, '%' | '_' | '\\') {
                out.push('\\');
            }
            out.push(c);
        }
        if !self.anchor_end {
            out.push('%');
        }
        out
    }

    /// `GLOB` operand for case-sensitive matching.
    pub fn to_glob(&self) -> String {
        let mut out = String::with_capacity(self.text.len() + 2);
        if !self.anchor_start {
            out.push('*');
        }
        for c in self.text.chars() {
            match c {
                '*' | '?' | '[' => {
                    out.push('[');
                    out.push(c);
                    out.push(']');
                }
                _ => out.push(c),
            }
        }
        if !self.anchor_end {
            out.push('*');
        }
        out
    }
}

// -- Updates --

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    pub set: Document,
    pub add_to_set: Document,
    pub pull: Document,
    pub push: Document,
    pub inc: Document,
    pub max: Document,
    pub unset: Document,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.set.insert(field.to_string(), value.into());
        self
    }

    pub fn add_to_set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.add_to_set.insert(field.to_string(), value.into());
        self
    }

    pub fn add_each_to_set<V: Into<Value>>(mut self, field: &str, values: impl IntoIterator<Item = V>) -> Self {
        let list: Vec<Value> = values.into_iter().map(Into::into).collect();
        let mut each = Map::new();
        each.insert("$each".to_string(), Value::Array(list));
        self.add_to_set.insert(field.to_string(), Value::Object(each));
        self
    }

    pub fn pull(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.pull.insert(field.to_string(), value.into());
        self
    }

    /// Remove every element of `field` whose `key` is one of `values`.
    pub fn pull_where_in<V: Into<Value>>(mut self, field: &str, key: &str, values: impl IntoIterator<Item = V>) -> Self {
        let list: Vec<Value> = values.into_iter().map(Into::into).collect();
        let cond = Filter::new().is_in(key, list);
        self.pull.insert(field.to_string(), Value::Object(cond.0));
        self
    }

    pub fn push(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.push.insert(field.to_string(), value.into());
        self
    }

    pub fn inc(mut self, field: &str, by: i64) -> Self {
        self.inc.insert(field.to_string(), Value::from(by));
        self
    }

    pub fn max(mut self, field: &str, value: i64) -> Self {
        self.max.insert(field.to_string(), Value::from(value));
        self
    }

    /// Remove a field entirely (a relational column becomes NULL).
    pub fn unset(mut self, field: &str) -> Self {
        self.unset.insert(field.to_string(), Value::String(String::new()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.unset.is_empty()
            && self.set.is_empty()
            && self.add_to_set.is_empty()
            && self.pull.is_empty()
            && self.push.is_empty()
            && self.inc.is_empty()
            && self.max.is_empty()
    }

    /// Parse the `{"$set": {..}, "$push": {..}}` form.
    pub fn from_json(value: Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(StoreError::InvalidQuery("update must be an object".into()));
        };
        let mut update = Self::new();
        for (op, fields) in map {
            let Value::Object(fields) = fields else {
                return Err(StoreError::InvalidQuery(format!("{} expects an object", op)));
            };
            let target = match op.as_str() {
                "$set" => &mut update.set,
                "$addToSet" => &mut update.add_to_set,
                "$pull" => &mut update.pull,
                "$push" => &mut update.push,
                "$inc" => &mut update.inc,
                "$max" => &mut update.max,
                "$unset" => &mut update.unset,
                other => return Err(StoreError::InvalidQuery(format!("unsupported update operator {}", other))),
            };
            target.extend(fields);
        }
        Ok(update)
    }
}

/// Expand an `$addToSet` argument into the values to add.
pub fn each_values(arg: &Value) -> Vec<Value> {
    match arg {
        Value::Object(map) if map.contains_key("$each") => map
            .get("$each")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
        other => vec![other.clone()],
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateResult {
    pub matched: u64,
    pub modified: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FindOneAndUpdateOptions {
    pub return_after: bool,
    pub upsert: bool,
}

impl Default for FindOneAndUpdateOptions {
    fn default() -> Self {
        Self {
            return_after: true,
            upsert: true,
        }
    }
}

// -- Sorting and paging --

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    pub fn as_i32(self) -> i32 {
        match self {
            SortOrder::Ascending => 1,
            SortOrder::Descending => -1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sort(pub Vec<(String, SortOrder)>);

impl Sort {
    pub fn asc(mut self, field: &str) -> Self {
        self.0.push((field.to_string(), SortOrder::Ascending));
        self
    }

    pub fn desc(mut self, field: &str) -> Self {
        self.0.push((field.to_string(), SortOrder::Descending));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub sort: Sort,
    pub limit: Option<usize>,
    pub skip: Option<usize>,
}

impl FindOptions {
    pub fn sorted(sort: Sort) -> Self {
        Self {
            sort,
            ..Self::default()
        }
    }
}

// -- Indexes --

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexKeys(pub Vec<(String, SortOrder)>);

impl IndexKeys {
    pub fn asc(field: &str) -> Self {
        Self(vec![(field.to_string(), SortOrder::Ascending)])
    }

    pub fn desc(field: &str) -> Self {
        Self(vec![(field.to_string(), SortOrder::Descending)])
    }

    /// `username_1`, `last_modified_-1`.
    pub fn default_name(&self) -> String {
        self.0
            .iter()
            .map(|(field, order)| format!("{}_{}", field, order.as_i32()))
            .collect::<Vec<_>>()
            .join("_")
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexOptions {
    pub name: Option<String>,
    pub unique: bool,
    pub sparse: bool,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub keys: Vec<(String, i32)>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub sparse: bool,
}
