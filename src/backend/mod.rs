//! The document database as seen by the gateway.
//!
//! [`Backend`] is the capability the operation handlers call into; a
//! [`Cursor`] is the stateful, non-reentrant iterator `find` hands to a
//! streaming session. Two engines implement it: [`memory::MemoryBackend`]
//! and [`postgres::PgBackend`].

pub mod memory;
pub mod postgres;
pub mod query;
pub mod tls;
pub mod translate;
pub mod update;

use crate::config::{BackendConfig, BackendKind};
use crate::error::{Error, Result};
use crate::write_concern::WriteConcern;
use async_trait::async_trait;
use bson::{Bson, Document, doc};
use std::sync::Arc;

/// Index hint attached to a find. Engines without hint support ignore it.
#[derive(Debug, Clone, PartialEq)]
pub enum Hint {
    Name(String),
    Keys(Document),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindSpec {
    pub matcher: Document,
    pub keys: Option<Document>,
    pub sort: Option<Document>,
    pub hint: Option<Hint>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindAndModifySpec {
    pub matcher: Document,
    pub update: Option<Document>,
    pub sort: Option<Document>,
    pub fields: Option<Document>,
    pub remove: bool,
    pub return_new: bool,
    pub upsert: bool,
}

/// What a write reported back. A present `error` means the backend refused it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteOutcome {
    pub n: u64,
    pub error: Option<String>,
}

impl WriteOutcome {
    pub fn applied(n: u64) -> Self {
        Self { n, error: None }
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self { n: 0, error: Some(msg.into()) }
    }
}

#[async_trait]
pub trait Cursor: Send {
    /// Whether another document can be read without blocking on the client.
    async fn has_next(&mut self) -> Result<bool>;

    async fn next(&mut self) -> Result<Option<Document>>;

    /// Release the server-side cursor. Calling it again is a no-op.
    async fn close(&mut self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Insert `doc`, or replace the stored document with the same `_id`.
    async fn save(&self, coll: &str, doc: Document, wc: WriteConcern) -> Result<WriteOutcome>;

    async fn update(
        &self,
        coll: &str,
        criteria: &Document,
        obj_new: &Document,
        upsert: bool,
        multi: bool,
        wc: WriteConcern,
    ) -> Result<WriteOutcome>;

    async fn delete(&self, coll: &str, matcher: &Document, wc: WriteConcern) -> Result<WriteOutcome>;

    async fn find(&self, coll: &str, spec: &FindSpec) -> Result<Box<dyn Cursor>>;

    async fn find_one(&self, coll: &str, matcher: Option<&Document>, keys: Option<&Document>) -> Result<Option<Document>>;

    async fn find_and_modify(&self, coll: &str, spec: &FindAndModifySpec) -> Result<Option<Document>>;

    async fn count(&self, coll: &str, matcher: Option<&Document>) -> Result<u64>;

    async fn list_collections(&self) -> Result<Vec<String>>;

    async fn drop_collection(&self, coll: &str) -> Result<()>;

    async fn collection_stats(&self, coll: &str) -> Result<Document>;

    fn default_write_concern(&self) -> WriteConcern;

    fn db_name(&self) -> &str;

    /// Run an administrative command document and return the reply verbatim.
    async fn run_command(&self, command: &Document) -> Result<Document> {
        let name = command.keys().next().map(|k| k.as_str()).unwrap_or("");
        let reply = match name {
            "ping" => doc! { "ok": 1.0 },
            "buildInfo" | "buildinfo" => doc! {
                "version": env!("CARGO_PKG_VERSION"),
                "sysInfo": "docbus",
                "bits": 64i32,
                "ok": 1.0,
            },
            "listCollections" => {
                let names = self.list_collections().await?;
                let batch: Vec<Document> = names
                    .into_iter()
                    .map(|n| doc! { "name": n, "type": "collection", "options": {} })
                    .collect();
                let ns = format!("{}.$cmd.listCollections", self.db_name());
                doc! { "cursor": { "id": 0i64, "ns": ns, "firstBatch": batch }, "ok": 1.0 }
            }
            "count" => {
                let coll = command_collection(command, name)?;
                let query = command.get_document("query").ok();
                let n = self.count(&coll, query).await?;
                doc! { "n": (n as i64), "ok": 1.0 }
            }
            "drop" => {
                let coll = command_collection(command, name)?;
                self.drop_collection(&coll).await?;
                doc! { "ns": format!("{}.{}", self.db_name(), coll), "nIndexesWas": 1i32, "ok": 1.0 }
            }
            "collStats" | "collstats" => {
                let coll = command_collection(command, name)?;
                self.collection_stats(&coll).await?
            }
            "dbStats" | "dbstats" => {
                let names = self.list_collections().await?;
                let mut objects = 0i64;
                for n in &names {
                    objects += self.count(n, None).await? as i64;
                }
                doc! { "db": self.db_name(), "collections": (names.len() as i64), "objects": objects, "ok": 1.0 }
            }
            _ => doc! { "ok": 0.0, "errmsg": format!("no such command: '{}'", name), "code": 59i32 },
        };
        Ok(reply)
    }

    /// Release pooled resources. Further calls may fail.
    async fn close(&self);
}

fn command_collection(command: &Document, name: &str) -> Result<String> {
    match command.get(name) {
        Some(Bson::String(s)) => Ok(s.clone()),
        _ => Err(Error::Backend(format!("{} requires a collection name", name))),
    }
}

/// Build the backend described by the configuration.
pub async fn connect(cfg: &BackendConfig) -> Result<Arc<dyn Backend>> {
    match cfg.kind {
        BackendKind::Memory => {
            tracing::info!(db = %cfg.db_name, "using in-memory backend");
            Ok(Arc::new(memory::MemoryBackend::new(&cfg.db_name)))
        }
        BackendKind::Postgres => {
            let pg = postgres::PgBackend::connect(cfg).await?;
            pg.bootstrap().await?;
            tracing::info!(db = %cfg.db_name, "connected postgres backend");
            Ok(Arc::new(pg))
        }
    }
}
