//! In-process engine. Collections are vectors behind one lock; cursors read
//! from a snapshot taken when the find starts.

use super::query::{compare_docs, matches, project, sort_docs};
use super::update::{apply_update, upsert_seed};
use super::{Backend, Cursor, FindAndModifySpec, FindSpec, WriteOutcome};
use crate::error::{Error, Result};
use crate::write_concern::WriteConcern;
use async_trait::async_trait;
use bson::{Bson, Document, doc};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

pub struct MemoryBackend {
    db_name: String,
    collections: RwLock<BTreeMap<String, Vec<Document>>>,
    calls: AtomicUsize,
    open_cursors: Arc<AtomicUsize>,
}

impl MemoryBackend {
    pub fn new(db_name: &str) -> Self {
        Self {
            db_name: db_name.to_string(),
            collections: RwLock::new(BTreeMap::new()),
            calls: AtomicUsize::new(0),
            open_cursors: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of backend operations invoked so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Cursors handed out by `find` and not yet closed or dropped.
    pub fn open_cursors(&self) -> usize {
        self.open_cursors.load(Ordering::SeqCst)
    }

    fn record(&self, op: &str, coll: &str) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(op, coll, "memory backend call");
    }
}

fn ensure_id(doc: &mut Document) -> Bson {
    match doc.get("_id") {
        Some(id) => id.clone(),
        None => {
            let id = Bson::String(uuid::Uuid::new_v4().to_string());
            doc.insert("_id", id.clone());
            id
        }
    }
}

fn filter_indices(docs: &[Document], matcher: &Document) -> Result<Vec<usize>> {
    let mut out = Vec::new();
    for (i, d) in docs.iter().enumerate() {
        if matches(d, matcher)? {
            out.push(i);
        }
    }
    Ok(out)
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn save(&self, coll: &str, mut doc: Document, _wc: WriteConcern) -> Result<WriteOutcome> {
        self.record("save", coll);
        let id = ensure_id(&mut doc);
        let mut guard = self.collections.write().await;
        let docs = guard.entry(coll.to_string()).or_default();
        match docs.iter_mut().find(|d| d.get("_id") == Some(&id)) {
            Some(existing) => *existing = doc,
            None => docs.push(doc),
        }
        Ok(WriteOutcome::applied(1))
    }

    async fn update(
        &self,
        coll: &str,
        criteria: &Document,
        obj_new: &Document,
        upsert: bool,
        multi: bool,
        _wc: WriteConcern,
    ) -> Result<WriteOutcome> {
        self.record("update", coll);
        let mut guard = self.collections.write().await;
        let docs = guard.entry(coll.to_string()).or_default();
        let mut hits = filter_indices(docs, criteria)?;
        if !multi {
            hits.truncate(1);
        }
        if hits.is_empty() {
            if !upsert {
                return Ok(WriteOutcome::applied(0));
            }
            let mut fresh = upsert_seed(criteria);
            apply_update(&mut fresh, obj_new)?;
            ensure_id(&mut fresh);
            docs.push(fresh);
            return Ok(WriteOutcome::applied(1));
        }
        // Apply to copies first so a failing operator leaves the collection untouched.
        let mut staged = Vec::with_capacity(hits.len());
        for &i in &hits {
            let mut d = docs[i].clone();
            apply_update(&mut d, obj_new)?;
            staged.push((i, d));
        }
        for (i, d) in staged {
            docs[i] = d;
        }
        Ok(WriteOutcome::applied(hits.len() as u64))
    }

    async fn delete(&self, coll: &str, matcher: &Document, _wc: WriteConcern) -> Result<WriteOutcome> {
        self.record("delete", coll);
        let mut guard = self.collections.write().await;
        let Some(docs) = guard.get_mut(coll) else {
            return Ok(WriteOutcome::applied(0));
        };
        let hits = filter_indices(docs, matcher)?;
        let mut idx = 0usize;
        docs.retain(|_| {
            let keep = hits.binary_search(&idx).is_err();
            idx += 1;
            keep
        });
        Ok(WriteOutcome::applied(hits.len() as u64))
    }

    async fn find(&self, coll: &str, spec: &FindSpec) -> Result<Box<dyn Cursor>> {
        self.record("find", coll);
        let guard = self.collections.read().await;
        let mut docs: Vec<Document> = Vec::new();
        if let Some(all) = guard.get(coll) {
            for d in all {
                if matches(d, &spec.matcher)? {
                    docs.push(d.clone());
                }
            }
        }
        drop(guard);
        if let Some(sort) = &spec.sort {
            sort_docs(&mut docs, sort);
        }
        let skip = spec.skip.unwrap_or(0) as usize;
        let limit = spec.limit.map(|n| n as usize).unwrap_or(usize::MAX);
        let snapshot: VecDeque<Document> = docs
            .into_iter()
            .skip(skip)
            .take(limit)
            .map(|d| match &spec.keys {
                Some(keys) => project(&d, keys),
                None => d,
            })
            .collect();
        Ok(Box::new(MemoryCursor::new(snapshot, self.open_cursors.clone())))
    }

    async fn find_one(&self, coll: &str, matcher: Option<&Document>, keys: Option<&Document>) -> Result<Option<Document>> {
        self.record("find_one", coll);
        let guard = self.collections.read().await;
        let Some(docs) = guard.get(coll) else {
            return Ok(None);
        };
        for d in docs {
            let hit = match matcher {
                Some(m) => matches(d, m)?,
                None => true,
            };
            if hit {
                return Ok(Some(match keys {
                    Some(k) => project(d, k),
                    None => d.clone(),
                }));
            }
        }
        Ok(None)
    }

    async fn find_and_modify(&self, coll: &str, spec: &FindAndModifySpec) -> Result<Option<Document>> {
        self.record("find_and_modify", coll);
        let mut guard = self.collections.write().await;
        let docs = guard.entry(coll.to_string()).or_default();
        let mut hits = filter_indices(docs, &spec.matcher)?;
        if let Some(sort) = &spec.sort {
            hits.sort_by(|a, b| compare_docs(&docs[*a], &docs[*b], sort));
        }
        let shape = |d: Document| match &spec.fields {
            Some(f) => project(&d, f),
            None => d,
        };

        let Some(&target) = hits.first() else {
            if spec.remove || !spec.upsert {
                return Ok(None);
            }
            let update = spec.update.as_ref().ok_or_else(|| Error::missing("update"))?;
            let mut fresh = upsert_seed(&spec.matcher);
            apply_update(&mut fresh, update)?;
            ensure_id(&mut fresh);
            docs.push(fresh.clone());
            return Ok(spec.return_new.then(|| shape(fresh)));
        };

        if spec.remove {
            let old = docs.remove(target);
            return Ok(Some(shape(old)));
        }
        let update = spec.update.as_ref().ok_or_else(|| Error::missing("update"))?;
        let old = docs[target].clone();
        let mut new = old.clone();
        apply_update(&mut new, update)?;
        docs[target] = new.clone();
        Ok(Some(shape(if spec.return_new { new } else { old })))
    }

    async fn count(&self, coll: &str, matcher: Option<&Document>) -> Result<u64> {
        self.record("count", coll);
        let guard = self.collections.read().await;
        let Some(docs) = guard.get(coll) else {
            return Ok(0);
        };
        match matcher {
            None => Ok(docs.len() as u64),
            Some(m) => Ok(filter_indices(docs, m)?.len() as u64),
        }
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        self.record("list_collections", "");
        Ok(self.collections.read().await.keys().cloned().collect())
    }

    async fn drop_collection(&self, coll: &str) -> Result<()> {
        self.record("drop_collection", coll);
        self.collections.write().await.remove(coll);
        Ok(())
    }

    async fn collection_stats(&self, coll: &str) -> Result<Document> {
        self.record("collection_stats", coll);
        let guard = self.collections.read().await;
        let docs = guard.get(coll).map(Vec::as_slice).unwrap_or(&[]);
        let mut size = 0i64;
        for d in docs {
            let mut buf = Vec::new();
            d.to_writer(&mut buf).map_err(|e| Error::Codec(e.to_string()))?;
            size += buf.len() as i64;
        }
        let count = docs.len() as i64;
        let avg = if count > 0 { size / count } else { 0 };
        Ok(doc! {
            "ns": format!("{}.{}", self.db_name, coll),
            "count": count,
            "size": size,
            "avgObjSize": avg,
            "storageSize": size,
            "nindexes": (if guard.contains_key(coll) { 1i32 } else { 0i32 }),
            "ok": 1.0,
        })
    }

    fn default_write_concern(&self) -> WriteConcern {
        WriteConcern::Acknowledged
    }

    fn db_name(&self) -> &str {
        &self.db_name
    }

    async fn close(&self) {
        tracing::debug!(db = %self.db_name, "memory backend closed");
    }
}

/// Iterator over a find snapshot.
pub struct MemoryCursor {
    docs: VecDeque<Document>,
    closed: bool,
    open: Arc<AtomicUsize>,
}

impl MemoryCursor {
    fn new(docs: VecDeque<Document>, open: Arc<AtomicUsize>) -> Self {
        open.fetch_add(1, Ordering::SeqCst);
        Self { docs, closed: false, open }
    }

    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.docs.clear();
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Cursor for MemoryCursor {
    async fn has_next(&mut self) -> Result<bool> {
        Ok(!self.closed && !self.docs.is_empty())
    }

    async fn next(&mut self) -> Result<Option<Document>> {
        if self.closed {
            return Err(Error::Backend("cursor is closed".into()));
        }
        Ok(self.docs.pop_front())
    }

    async fn close(&mut self) -> Result<()> {
        self.release();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for MemoryCursor {
    fn drop(&mut self) {
        self.release();
    }
}
