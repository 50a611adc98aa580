//! Declarative pipeline stages and their document-level semantics.
//!
//! A [`Pipeline`] is a base collection plus an ordered list of [`Stage`]s.
//! Join stages ([`Lookup`]) carry their own sub-pipeline, so nested joins
//! form a tree of stage sequences rather than database-specific syntax.
//!
//! Field paths are dotted (`avatar.url`). Resolving a path through an array
//! of documents yields the array of the resolved values, so
//! `likes.likedBy` over joined like records is the list of actors.

use std::cmp::Ordering;

use chrono::{DateTime, FixedOffset};
use serde_json::{Map, Value, json};

use crate::error::{CoreError, CoreResult};
use crate::store::{Collection, ScanFilter};

#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    collection: Collection,
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(collection: Collection, stages: Vec<Stage>) -> Self {
        Self { collection, stages }
    }

    pub fn collection(&self) -> Collection {
        self.collection
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    /// Free-text match over the collection's indexed text fields. Only valid
    /// as the first stage of a top-level pipeline.
    Search { fields: Vec<String>, query: String },
    Match(Filter),
    Lookup(Lookup),
    /// One output document per element of the array at `path`. Documents
    /// with a missing or empty array are dropped unless `preserve_empty`.
    Unwind { path: String, preserve_empty: bool },
    /// Derived fields; every expression sees the input document.
    AddFields(Vec<(String, Expr)>),
    Sort(Vec<SortSpec>),
    Limit(usize),
    Project(Projection),
}

impl Stage {
    pub fn match_eq(field: &str, value: impl Into<Value>) -> Self {
        Stage::Match(Filter::Eq {
            field: field.to_owned(),
            value: value.into(),
        })
    }

    pub fn match_exists(field: &str) -> Self {
        Stage::Match(Filter::Exists {
            field: field.to_owned(),
        })
    }

    pub fn lookup(
        from: Collection,
        local_field: &str,
        foreign_field: &str,
        as_field: &str,
        pipeline: Vec<Stage>,
    ) -> Self {
        Stage::Lookup(Lookup {
            from,
            local_field: local_field.to_owned(),
            foreign_field: foreign_field.to_owned(),
            as_field: as_field.to_owned(),
            pipeline,
        })
    }

    pub fn unwind(path: &str) -> Self {
        Stage::Unwind {
            path: path.to_owned(),
            preserve_empty: false,
        }
    }

    pub fn add_fields(fields: Vec<(&str, Expr)>) -> Self {
        Stage::AddFields(
            fields
                .into_iter()
                .map(|(name, expr)| (name.to_owned(), expr))
                .collect(),
        )
    }

    pub fn sort(field: &str, direction: SortDirection) -> Self {
        Stage::Sort(vec![SortSpec {
            field: field.to_owned(),
            direction,
        }])
    }

    pub fn project(paths: &[&str]) -> Self {
        Stage::Project(Projection::fields(paths))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq { field: String, value: Value },
    In { field: String, values: Vec<Value> },
    Exists { field: String },
}

impl Filter {
    pub fn field(&self) -> &str {
        match self {
            Filter::Eq { field, .. } | Filter::In { field, .. } | Filter::Exists { field } => field,
        }
    }

    /// An equality against an array matches when any element is equal.
    pub fn matches(&self, doc: &Value) -> bool {
        let found = resolve_path(doc, self.field());
        match self {
            Filter::Eq { value, .. } => found.is_some_and(|found| value_matches(&found, value)),
            Filter::In { values, .. } => found
                .is_some_and(|found| values.iter().any(|value| value_matches(&found, value))),
            Filter::Exists { .. } => found.is_some_and(|found| !found.is_null()),
        }
    }

    pub(crate) fn to_scan(&self) -> ScanFilter {
        match self {
            Filter::Eq { field, value } => ScanFilter::Eq {
                field: field.clone(),
                value: value.clone(),
            },
            Filter::In { field, values } => ScanFilter::In {
                field: field.clone(),
                values: values.clone(),
            },
            Filter::Exists { field } => ScanFilter::Exists {
                field: field.clone(),
            },
        }
    }
}

fn value_matches(found: &Value, expected: &Value) -> bool {
    found == expected || matches!(found, Value::Array(items) if items.contains(expected))
}

/// Left outer join of `from` on `local_field == foreign_field`. The joined
/// documents run through `pipeline` before landing in `as_field` as an
/// array.
#[derive(Debug, Clone, PartialEq)]
pub struct Lookup {
    pub from: Collection,
    pub local_field: String,
    pub foreign_field: String,
    pub as_field: String,
    pub pipeline: Vec<Stage>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Field(String),
    /// Length of the array at the path. Anything else is a query error.
    Size(String),
    /// First element of the array at the path, `null` when empty.
    First(String),
    /// Sum of the numbers found at the path.
    Sum(String),
    /// Membership test; `value: None` (no viewer) is always false.
    Contains { array: String, value: Option<Value> },
    Literal(Value),
}

impl Expr {
    pub fn evaluate(&self, doc: &Value) -> CoreResult<Value> {
        match self {
            Expr::Field(path) => Ok(resolve_path(doc, path).unwrap_or(Value::Null)),
            Expr::Size(path) => match resolve_path(doc, path) {
                Some(Value::Array(items)) => Ok(json!(items.len())),
                other => Err(CoreError::query(format!(
                    "size expects an array at `{path}`, found {}",
                    describe(other.as_ref())
                ))),
            },
            Expr::First(path) => match resolve_path(doc, path) {
                Some(Value::Array(items)) => Ok(items.into_iter().next().unwrap_or(Value::Null)),
                None | Some(Value::Null) => Ok(Value::Null),
                Some(other) => Err(CoreError::query(format!(
                    "first expects an array at `{path}`, found {}",
                    describe(Some(&other))
                ))),
            },
            Expr::Sum(path) => Ok(sum_numbers(resolve_path(doc, path).as_ref())),
            Expr::Contains { array, value } => {
                let Some(value) = value else {
                    return Ok(Value::Bool(false));
                };
                match resolve_path(doc, array) {
                    Some(Value::Array(items)) => Ok(Value::Bool(items.contains(value))),
                    None | Some(Value::Null) => Ok(Value::Bool(false)),
                    Some(other) => Err(CoreError::query(format!(
                        "membership test expects an array at `{array}`, found {}",
                        describe(Some(&other))
                    ))),
                }
            }
            Expr::Literal(value) => Ok(value.clone()),
        }
    }
}

fn describe(value: Option<&Value>) -> &'static str {
    match value {
        None => "a missing field",
        Some(Value::Null) => "null",
        Some(Value::Bool(_)) => "a boolean",
        Some(Value::Number(_)) => "a number",
        Some(Value::String(_)) => "a string",
        Some(Value::Array(_)) => "an array",
        Some(Value::Object(_)) => "an object",
    }
}

fn sum_numbers(value: Option<&Value>) -> Value {
    let mut int_total: i64 = 0;
    let mut float_total: f64 = 0.0;
    let mut saw_float = false;
    let mut visit = |number: &serde_json::Number| {
        if let Some(int) = number.as_i64() {
            int_total = int_total.saturating_add(int);
        } else if let Some(float) = number.as_f64() {
            float_total += float;
            saw_float = true;
        }
    };
    match value {
        Some(Value::Number(number)) => visit(number),
        Some(Value::Array(items)) => {
            for item in items {
                if let Value::Number(number) = item {
                    visit(number);
                }
            }
        }
        _ => {}
    }
    if saw_float {
        json!(int_total as f64 + float_total)
    } else {
        json!(int_total)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    /// Only an exact `asc` sorts ascending.
    pub fn parse(raw: &str) -> Self {
        if raw == "asc" {
            SortDirection::Asc
        } else {
            SortDirection::Desc
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortSpec {
    pub field: String,
    pub direction: SortDirection,
}

/// Documents ordered by each spec in turn; ties keep their input order.
pub fn compare_docs(a: &Value, b: &Value, specs: &[SortSpec]) -> Ordering {
    for spec in specs {
        let left = resolve_path(a, &spec.field);
        let right = resolve_path(b, &spec.field);
        let ordering = compare_values(left.as_ref(), right.as_ref());
        let ordering = match spec.direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Missing and null sort lowest, then numbers, strings, objects, arrays and
/// booleans. Two RFC 3339 strings compare as instants.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let (a, b) = match (a, b) {
        (Some(a), Some(b)) => (a, b),
        (a, b) => return type_rank(a).cmp(&type_rank(b)),
    };
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => match (parse_instant(x), parse_instant(y)) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x.cmp(y),
        },
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => type_rank(Some(a)).cmp(&type_rank(Some(b))),
    }
}

fn parse_instant(raw: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(raw).ok()
}

fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Number(_)) => 1,
        Some(Value::String(_)) => 2,
        Some(Value::Object(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Bool(_)) => 5,
    }
}

/// Inclusion projection. `_id` is kept unless `exclude_id` is set.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub include: Vec<String>,
    pub exclude_id: bool,
}

impl Projection {
    pub fn fields(paths: &[&str]) -> Self {
        Self {
            include: paths.iter().map(|path| (*path).to_owned()).collect(),
            exclude_id: false,
        }
    }

    pub fn without_id(mut self) -> Self {
        self.exclude_id = true;
        self
    }

    pub fn apply(&self, doc: &Value) -> Value {
        let mut out = Map::new();
        if !self.exclude_id {
            if let Some(id) = doc.get("_id") {
                out.insert("_id".to_owned(), id.clone());
            }
        }
        for path in &self.include {
            let segments: Vec<&str> = path.split('.').collect();
            copy_path(doc, &segments, &mut out);
        }
        Value::Object(out)
    }
}

impl From<Projection> for Stage {
    fn from(projection: Projection) -> Self {
        Stage::Project(projection)
    }
}

fn copy_path(src: &Value, segments: &[&str], dst: &mut Map<String, Value>) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };
    let Some(value) = src.get(*head) else {
        return;
    };
    if rest.is_empty() {
        dst.insert((*head).to_owned(), value.clone());
        return;
    }
    match value {
        Value::Object(_) => {
            let entry = dst
                .entry((*head).to_owned())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(child) = entry {
                copy_path(value, rest, child);
            }
        }
        Value::Array(items) => {
            let entry = dst.entry((*head).to_owned()).or_insert_with(|| {
                Value::Array(items.iter().map(|_| Value::Object(Map::new())).collect())
            });
            if let Value::Array(targets) = entry {
                for (item, target) in items.iter().zip(targets.iter_mut()) {
                    if let Value::Object(child) = target {
                        copy_path(item, rest, child);
                    }
                }
            }
        }
        _ => {}
    }
}

pub fn resolve_path(doc: &Value, path: &str) -> Option<Value> {
    let segments: Vec<&str> = path.split('.').collect();
    resolve_segments(doc, &segments)
}

fn resolve_segments(value: &Value, segments: &[&str]) -> Option<Value> {
    let Some((head, rest)) = segments.split_first() else {
        return Some(value.clone());
    };
    match value {
        Value::Object(map) => map
            .get(*head)
            .and_then(|next| resolve_segments(next, rest)),
        Value::Array(items) => Some(Value::Array(
            items
                .iter()
                .filter(|item| item.is_object())
                .filter_map(|item| resolve_segments(item, segments))
                .collect(),
        )),
        _ => None,
    }
}

/// Writes `value` at a dotted path, creating intermediate objects.
pub fn set_path(doc: &mut Value, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    set_segments(doc, &segments, value);
}

fn set_segments(target: &mut Value, segments: &[&str], value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        *target = value;
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(map) = target {
        let slot = map.entry((*head).to_owned()).or_insert(Value::Null);
        set_segments(slot, rest, value);
    }
}

pub fn remove_path(doc: &mut Value, path: &str) {
    match path.split_once('.') {
        None => {
            if let Value::Object(map) = doc {
                map.remove(path);
            }
        }
        Some((head, rest)) => {
            if let Some(child) = doc.get_mut(head) {
                remove_path(child, rest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_exact_asc_sorts_ascending() {
        assert_eq!(SortDirection::parse("asc"), SortDirection::Asc);
        for raw in ["ASC", "Asc", " asc", "desc", ""] {
            assert_eq!(SortDirection::parse(raw), SortDirection::Desc);
        }
    }

    #[test]
    fn resolve_path_maps_over_arrays() {
        let doc = json!({
            "likes": [{"likedBy": "a"}, {"likedBy": "b"}, {"other": 1}],
        });
        assert_eq!(resolve_path(&doc, "likes.likedBy"), Some(json!(["a", "b"])));
        assert_eq!(resolve_path(&doc, "missing.field"), None);
    }

    #[test]
    fn contains_is_false_without_viewer() {
        let doc = json!({"likes": [{"likedBy": "a"}]});
        let with_viewer = Expr::Contains {
            array: "likes.likedBy".into(),
            value: Some(json!("a")),
        };
        let without = Expr::Contains {
            array: "likes.likedBy".into(),
            value: None,
        };
        assert_eq!(with_viewer.evaluate(&doc).unwrap(), json!(true));
        assert_eq!(without.evaluate(&doc).unwrap(), json!(false));
    }

    #[test]
    fn size_rejects_non_arrays() {
        let doc = json!({"likes": 3});
        let err = Expr::Size("likes".into()).evaluate(&doc).unwrap_err();
        assert!(matches!(err, CoreError::Query(_)));
    }

    #[test]
    fn sum_keeps_integers_integral() {
        let doc = json!({"videos": [{"views": 3}, {"views": 4}]});
        assert_eq!(Expr::Sum("videos.views".into()).evaluate(&doc).unwrap(), json!(7));
        assert_eq!(Expr::Sum("nothing".into()).evaluate(&doc).unwrap(), json!(0));
    }

    #[test]
    fn projection_keeps_nested_paths_only() {
        let doc = json!({
            "_id": "v1",
            "title": "t",
            "videoFile": {"url": "u", "storageId": "secret"},
            "owner": null,
            "videos": [{"title": "a", "views": 1}, {"title": "b", "views": 2}],
        });
        let projected = Projection::fields(&[
            "title",
            "videoFile.url",
            "owner.username",
            "videos.title",
            "videos.views",
        ])
        .apply(&doc);
        assert_eq!(
            projected,
            json!({
                "_id": "v1",
                "title": "t",
                "videoFile": {"url": "u"},
                "videos": [{"title": "a", "views": 1}, {"title": "b", "views": 2}],
            })
        );

        let anonymous = Projection::fields(&["title"]).without_id().apply(&doc);
        assert_eq!(anonymous, json!({"title": "t"}));
    }

    #[test]
    fn timestamps_compare_as_instants() {
        let earlier = json!("2024-01-01T00:00:00Z");
        let later = json!("2024-01-01T00:00:00.500Z");
        assert_eq!(
            compare_values(Some(&earlier), Some(&later)),
            Ordering::Less
        );
        assert_eq!(compare_values(None, Some(&earlier)), Ordering::Less);
    }

    #[test]
    fn set_and_remove_nested_paths() {
        let mut doc = json!({"a": 1});
        set_path(&mut doc, "b.c", json!(2));
        assert_eq!(doc, json!({"a": 1, "b": {"c": 2}}));
        remove_path(&mut doc, "b.c");
        assert_eq!(doc, json!({"a": 1, "b": {}}));
        remove_path(&mut doc, "a");
        assert_eq!(doc, json!({"b": {}}));
    }

    #[test]
    fn filters_match_array_members() {
        let doc = json!({"tags": ["x", "y"], "owner": "u1"});
        assert!(Filter::Eq { field: "tags".into(), value: json!("y") }.matches(&doc));
        assert!(
            Filter::In {
                field: "owner".into(),
                values: vec![json!("u0"), json!("u1")]
            }
            .matches(&doc)
        );
        assert!(!Filter::Exists { field: "missing".into() }.matches(&doc));
    }
}
