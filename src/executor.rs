//! Runs a [`Pipeline`] against the [`EntityStore`].
//!
//! Leading search and match stages become predicates of the base collection
//! scan. Everything after the first stage SQLite cannot answer is evaluated
//! over the scanned JSON documents, in order. Lookups fetch the foreign
//! collection once per stage with an `IN (...)` scan, then run their
//! sub-pipeline per joined group.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::stage::{
    Expr, Lookup, Pipeline, Projection, SortSpec, Stage, compare_docs, remove_path, resolve_path,
    set_path,
};
use crate::store::{Collection, EntityStore, ScanFilter};

/// SQLite caps bound parameters per statement; larger key sets are split.
const IN_CHUNK: usize = 500;

type StageFuture<'a> = Pin<Box<dyn Future<Output = CoreResult<Vec<Value>>> + Send + 'a>>;

#[derive(Clone)]
pub struct Executor {
    store: EntityStore,
}

impl Executor {
    pub fn new(store: EntityStore) -> Self {
        Self { store }
    }

    pub async fn execute(&self, pipeline: &Pipeline) -> CoreResult<ViewCursor> {
        let collection = pipeline.collection();
        let (filters, rest) = pushdown(collection, pipeline.stages(), true)?;
        let docs = self.store.scan(collection, filters).await?;
        debug!(
            table = collection.table(),
            scanned = docs.len(),
            stages = rest.len(),
            "evaluating view pipeline"
        );
        let docs = self.run_stages(docs, rest).await?;
        Ok(ViewCursor::new(docs))
    }

    fn run_stages<'a>(&'a self, docs: Vec<Value>, stages: &'a [Stage]) -> StageFuture<'a> {
        Box::pin(async move {
            let mut docs = docs;
            for stage in stages {
                docs = self.apply(docs, stage).await?;
            }
            Ok(docs)
        })
    }

    async fn apply(&self, docs: Vec<Value>, stage: &Stage) -> CoreResult<Vec<Value>> {
        match stage {
            Stage::Search { .. } => Err(CoreError::query(
                "text search must be the first stage of a pipeline",
            )),
            Stage::Match(filter) => Ok(docs.into_iter().filter(|doc| filter.matches(doc)).collect()),
            Stage::Lookup(lookup) => self.lookup(docs, lookup).await,
            Stage::Unwind {
                path,
                preserve_empty,
            } => Ok(unwind(docs, path, *preserve_empty)),
            Stage::AddFields(fields) => add_fields(docs, fields),
            Stage::Sort(specs) => sort(docs, specs),
            Stage::Limit(limit) => {
                let mut docs = docs;
                docs.truncate(*limit);
                Ok(docs)
            }
            Stage::Project(projection) => Ok(project(docs, projection)),
        }
    }

    async fn lookup(&self, docs: Vec<Value>, lookup: &Lookup) -> CoreResult<Vec<Value>> {
        if docs.is_empty() {
            return Ok(docs);
        }

        let local_keys: Vec<Vec<Value>> = docs
            .iter()
            .map(|doc| join_keys(resolve_path(doc, &lookup.local_field)))
            .collect();
        let mut distinct: Vec<Value> = Vec::new();
        for key in local_keys.iter().flatten() {
            if !distinct.contains(key) {
                distinct.push(key.clone());
            }
        }

        let (sub_filters, sub_rest) = pushdown(lookup.from, &lookup.pipeline, false)?;
        let foreign = self
            .fetch_foreign(lookup.from, &lookup.foreign_field, distinct, sub_filters)
            .await?;

        let mut by_key: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, doc) in foreign.iter().enumerate() {
            for key in join_keys(resolve_path(doc, &lookup.foreign_field)) {
                by_key.entry(key.to_string()).or_default().push(index);
            }
        }

        let mut cache: HashMap<Vec<String>, Vec<Value>> = HashMap::new();
        let mut out = Vec::with_capacity(docs.len());
        for (mut doc, keys) in docs.into_iter().zip(local_keys) {
            // Order matters: array keys join in local array order.
            let cache_key: Vec<String> = keys.iter().map(Value::to_string).collect();

            let joined = match cache.get(&cache_key) {
                Some(joined) => joined.clone(),
                None => {
                    let group = group_for(&keys, &by_key, &foreign);
                    let joined = self.run_stages(group, sub_rest).await?;
                    cache.insert(cache_key, joined.clone());
                    joined
                }
            };
            set_path(&mut doc, &lookup.as_field, Value::Array(joined));
            out.push(doc);
        }
        Ok(out)
    }

    async fn fetch_foreign(
        &self,
        collection: Collection,
        foreign_field: &str,
        keys: Vec<Value>,
        filters: Vec<ScanFilter>,
    ) -> CoreResult<Vec<Value>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        if !collection.can_filter(foreign_field) {
            return self.store.scan(collection, filters).await;
        }

        let mut docs = Vec::new();
        for chunk in keys.chunks(IN_CHUNK) {
            let mut chunk_filters = filters.clone();
            chunk_filters.push(ScanFilter::In {
                field: foreign_field.to_owned(),
                values: chunk.to_vec(),
            });
            docs.extend(self.store.scan(collection, chunk_filters).await?);
        }
        Ok(docs)
    }
}

/// Splits off the leading stages that can run as scan predicates. Search is
/// only accepted as the very first stage of a top-level pipeline.
fn pushdown(
    collection: Collection,
    stages: &[Stage],
    allow_search: bool,
) -> CoreResult<(Vec<ScanFilter>, &[Stage])> {
    let mut filters = Vec::new();
    let mut consumed = 0;
    for (index, stage) in stages.iter().enumerate() {
        match stage {
            Stage::Search { fields, query } => {
                if !allow_search || index != 0 {
                    return Err(CoreError::query(
                        "text search must be the first stage of a pipeline",
                    ));
                }
                if fields.is_empty() || collection.search_fields().is_empty() {
                    return Err(CoreError::query(format!(
                        "no text index on {}",
                        collection.table()
                    )));
                }
                let terms: Vec<String> = query.split_whitespace().map(str::to_owned).collect();
                filters.push(ScanFilter::Text {
                    fields: fields.clone(),
                    terms,
                });
            }
            Stage::Match(filter) if collection.can_filter(filter.field()) => {
                filters.push(filter.to_scan());
            }
            _ => break,
        }
        consumed = index + 1;
    }
    Ok((filters, &stages[consumed..]))
}

/// Scalar join keys of a resolved field; arrays contribute each element.
fn join_keys(value: Option<Value>) -> Vec<Value> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .into_iter()
            .filter(|item| !item.is_null() && !item.is_array() && !item.is_object())
            .collect(),
        Some(Value::Object(_)) => Vec::new(),
        Some(scalar) => vec![scalar],
    }
}

/// Foreign documents matching any of `keys`, ordered by the position of the
/// first key they match, then by scan order.
fn group_for(keys: &[Value], by_key: &HashMap<String, Vec<usize>>, foreign: &[Value]) -> Vec<Value> {
    let mut picked: Vec<usize> = Vec::new();
    for key in keys {
        if let Some(indexes) = by_key.get(&key.to_string()) {
            for index in indexes {
                if !picked.contains(index) {
                    picked.push(*index);
                }
            }
        }
    }
    picked.into_iter().map(|index| foreign[index].clone()).collect()
}

fn unwind(docs: Vec<Value>, path: &str, preserve_empty: bool) -> Vec<Value> {
    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        match resolve_path(&doc, path) {
            Some(Value::Array(items)) if !items.is_empty() => {
                for item in items {
                    let mut copy = doc.clone();
                    set_path(&mut copy, path, item);
                    out.push(copy);
                }
            }
            Some(Value::Array(_)) | Some(Value::Null) | None => {
                if preserve_empty {
                    let mut copy = doc;
                    remove_path(&mut copy, path);
                    out.push(copy);
                }
            }
            Some(_) => out.push(doc),
        }
    }
    out
}

fn add_fields(docs: Vec<Value>, fields: &[(String, Expr)]) -> CoreResult<Vec<Value>> {
    docs.into_iter()
        .map(|mut doc| {
            let values = fields
                .iter()
                .map(|(name, expr)| expr.evaluate(&doc).map(|value| (name, value)))
                .collect::<CoreResult<Vec<_>>>()?;
            for (name, value) in values {
                set_path(&mut doc, name, value);
            }
            Ok(doc)
        })
        .collect()
}

fn sort(mut docs: Vec<Value>, specs: &[SortSpec]) -> CoreResult<Vec<Value>> {
    if specs.is_empty() {
        return Err(CoreError::query("sort stage has no keys"));
    }
    if let Some(spec) = specs
        .iter()
        .find(|spec| spec.field.is_empty() || spec.field.split('.').any(str::is_empty))
    {
        return Err(CoreError::query(format!(
            "malformed sort key `{}`",
            spec.field
        )));
    }
    docs.sort_by(|a, b| compare_docs(a, b, specs));
    Ok(docs)
}

fn project(docs: Vec<Value>, projection: &Projection) -> Vec<Value> {
    docs.iter().map(|doc| projection.apply(doc)).collect()
}

/// Materialized result of one execution. Iterates documents in pipeline
/// order and knows its length up front.
#[derive(Debug)]
pub struct ViewCursor {
    docs: std::vec::IntoIter<Value>,
}

impl ViewCursor {
    pub fn new(docs: Vec<Value>) -> Self {
        Self {
            docs: docs.into_iter(),
        }
    }

    /// Decodes every remaining document into a typed view.
    pub fn collect_as<T: DeserializeOwned>(self) -> CoreResult<Vec<T>> {
        self.map(|doc| serde_json::from_value(doc).map_err(CoreError::from))
            .collect()
    }

    pub fn first_as<T: DeserializeOwned>(mut self) -> CoreResult<Option<T>> {
        self.next()
            .map(|doc| serde_json::from_value(doc).map_err(CoreError::from))
            .transpose()
    }
}

impl Iterator for ViewCursor {
    type Item = Value;

    fn next(&mut self) -> Option<Self::Item> {
        self.docs.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.docs.size_hint()
    }

    fn nth(&mut self, n: usize) -> Option<Self::Item> {
        self.docs.nth(n)
    }
}

impl ExactSizeIterator for ViewCursor {}
