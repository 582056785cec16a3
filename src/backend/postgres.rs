//! PostgreSQL engine.
//!
//! Each logical database is a schema `mdb_<db_name>`; each collection is a
//! table `(id bytea primary key, doc jsonb, doc_bson bytea)` registered in
//! `mdb_meta.collections`. `doc_bson` is authoritative, `doc` exists for
//! filtering and ordering. Find cursors are `DECLARE`d portals held on a
//! dedicated pooled connection until they are closed.

use super::query::project;
use super::tls::MakeRustlsConnect;
use super::translate::{build_order_by, build_where, escape_single, id_bytes};
use super::update::{apply_update, upsert_seed};
use super::{Backend, Cursor, FindAndModifySpec, FindSpec, Hint, WriteOutcome};
use crate::codec;
use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::write_concern::WriteConcern;
use async_trait::async_trait;
use bson::{Bson, Document, doc};
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod, Runtime};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_postgres::NoTls;
use tokio_postgres::config::TargetSessionAttrs;

/// Rows pulled from a portal per `FETCH`.
const FETCH_ROWS: usize = 100;

static CURSOR_SEQ: AtomicU64 = AtomicU64::new(1);

pub struct PgBackend {
    pool: Pool,
    db_name: String,
    schema: String,
}

fn err_msg<E: std::fmt::Display>(e: E) -> Error {
    Error::Backend(e.to_string())
}

fn q_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Connection settings for the pool: a URL verbatim, or assembled from the
/// host/seed list, credentials and timeouts.
pub fn pg_config(cfg: &BackendConfig) -> Result<tokio_postgres::Config> {
    if let Some(url) = &cfg.url {
        return url.parse::<tokio_postgres::Config>().map_err(err_msg);
    }
    let mut pc = tokio_postgres::Config::new();
    match &cfg.seeds {
        Some(seeds) if !seeds.is_empty() => {
            for seed in seeds {
                pc.host(&seed.host);
                pc.port(seed.port);
            }
        }
        _ => {
            pc.host(&cfg.host);
            pc.port(cfg.port);
        }
    }
    if let Some(user) = &cfg.username {
        pc.user(user);
    }
    if let Some(password) = &cfg.password {
        pc.password(password);
    }
    if cfg.socket_timeout_ms > 0 {
        pc.connect_timeout(Duration::from_millis(cfg.socket_timeout_ms));
        pc.options(&format!("-c statement_timeout={}", cfg.socket_timeout_ms));
    }
    let attrs = if cfg.read_preference.eq_ignore_ascii_case("primary") {
        TargetSessionAttrs::ReadWrite
    } else {
        TargetSessionAttrs::Any
    };
    pc.target_session_attrs(attrs);
    pc.application_name("docbus");
    Ok(pc)
}

fn pool_wait_timeout(cfg: &BackendConfig) -> Duration {
    Duration::from_millis(cfg.pool_wait_timeout_ms.max(1))
}

fn synchronous_commit(wc: WriteConcern) -> &'static str {
    match wc {
        WriteConcern::ErrorsIgnored | WriteConcern::Unacknowledged => "off",
        WriteConcern::Acknowledged => "local",
        WriteConcern::Fsynced | WriteConcern::Journaled => "on",
        WriteConcern::ReplicaAcknowledged | WriteConcern::ThreeReplicas => "remote_write",
        WriteConcern::Majority => "remote_apply",
    }
}

fn decode_row(row: &tokio_postgres::Row) -> Result<Document> {
    let bytes: Vec<u8> = row.try_get("doc_bson").map_err(err_msg)?;
    Document::from_reader(&mut std::io::Cursor::new(bytes)).map_err(|e| Error::Codec(e.to_string()))
}

fn encode_doc(doc: &Document) -> Result<(Vec<u8>, Vec<u8>, serde_json::Value)> {
    let id = doc.get("_id").ok_or_else(|| Error::Backend("document has no _id".into()))?;
    let id = id_bytes(id)?;
    let mut bson_bytes = Vec::new();
    doc.to_writer(&mut bson_bytes).map_err(|e| Error::Codec(e.to_string()))?;
    let json = codec::to_json_value(doc.clone());
    Ok((id, bson_bytes, json))
}

fn ensure_id(doc: &mut Document) {
    if !doc.contains_key("_id") {
        doc.insert("_id", Bson::String(uuid::Uuid::new_v4().to_string()));
    }
}

impl PgBackend {
    pub async fn connect(cfg: &BackendConfig) -> Result<Self> {
        let pc = pg_config(cfg)?;
        let mgr_cfg = ManagerConfig { recycling_method: RecyclingMethod::Fast };
        let mgr = if cfg.use_ssl {
            let tls = MakeRustlsConnect::from_ca_file(cfg.tls_ca_file.as_deref()).map_err(err_msg)?;
            Manager::from_config(pc, tls, mgr_cfg)
        } else {
            Manager::from_config(pc, NoTls, mgr_cfg)
        };
        // Open cursors pin connections; a bounded wait turns exhaustion into an error reply.
        let pool = Pool::builder(mgr)
            .max_size(cfg.pool_size.max(1))
            .wait_timeout(Some(pool_wait_timeout(cfg)))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(err_msg)?;
        // Fail fast on bad credentials rather than on the first request.
        drop(pool.get().await.map_err(err_msg)?);
        Ok(Self { pool, db_name: cfg.db_name.clone(), schema: format!("mdb_{}", cfg.db_name) })
    }

    async fn client(&self) -> Result<Object> {
        self.pool.get().await.map_err(err_msg)
    }

    pub async fn bootstrap(&self) -> Result<()> {
        let client = self.client().await?;
        client
            .batch_execute(&format!(
                r#"
                CREATE SCHEMA IF NOT EXISTS mdb_meta;
                CREATE TABLE IF NOT EXISTS mdb_meta.collections (
                    db TEXT NOT NULL,
                    coll TEXT NOT NULL,
                    PRIMARY KEY (db, coll)
                );
                CREATE SCHEMA IF NOT EXISTS {};
                "#,
                q_ident(&self.schema)
            ))
            .await
            .map_err(err_msg)?;
        Ok(())
    }

    fn table(&self, coll: &str) -> String {
        format!("{}.{}", q_ident(&self.schema), q_ident(coll))
    }

    async fn collection_exists(&self, client: &Object, coll: &str) -> Result<bool> {
        let row = client
            .query_opt(
                "SELECT 1 FROM mdb_meta.collections WHERE db = $1 AND coll = $2",
                &[&self.db_name, &coll],
            )
            .await
            .map_err(err_msg)?;
        Ok(row.is_some())
    }

    async fn ensure_collection(&self, client: &Object, coll: &str) -> Result<()> {
        if self.collection_exists(client, coll).await? {
            return Ok(());
        }
        let idx = q_ident(&format!("idx_{}_doc_gin", coll));
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {t} (id bytea PRIMARY KEY, doc jsonb NOT NULL, doc_bson bytea NOT NULL);\nCREATE INDEX IF NOT EXISTS {idx} ON {t} USING GIN (doc jsonb_path_ops)",
            t = self.table(coll),
            idx = idx
        );
        client.batch_execute(&ddl).await.map_err(err_msg)?;
        client
            .execute(
                "INSERT INTO mdb_meta.collections(db, coll) VALUES($1,$2) ON CONFLICT (db, coll) DO NOTHING",
                &[&self.db_name, &coll],
            )
            .await
            .map_err(err_msg)?;
        Ok(())
    }

    async fn begin_write(&self, client: &Object, wc: WriteConcern) -> Result<()> {
        client
            .batch_execute(&format!("BEGIN; SET LOCAL synchronous_commit = {}", synchronous_commit(wc)))
            .await
            .map_err(err_msg)
    }

    async fn upsert_row(&self, client: &Object, coll: &str, doc: &Document) -> Result<u64> {
        let (id, bson_bytes, json) = encode_doc(doc)?;
        let sql = format!(
            "INSERT INTO {} (id, doc_bson, doc) VALUES ($1, $2, $3) ON CONFLICT (id) DO UPDATE SET doc_bson = EXCLUDED.doc_bson, doc = EXCLUDED.doc",
            self.table(coll)
        );
        client.execute(&sql, &[&id, &bson_bytes, &json]).await.map_err(err_msg)
    }

    async fn rewrite_row(&self, client: &Object, coll: &str, old_id: &[u8], doc: &Document) -> Result<()> {
        let (_, bson_bytes, json) = encode_doc(doc)?;
        let sql = format!("UPDATE {} SET doc_bson = $2, doc = $3 WHERE id = $1", self.table(coll));
        client.execute(&sql, &[&old_id, &bson_bytes, &json]).await.map_err(err_msg)?;
        Ok(())
    }

    /// Run `body` inside a write transaction, rolling back on failure.
    async fn in_write<T, F>(&self, client: &Object, wc: WriteConcern, body: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        self.begin_write(client, wc).await?;
        match body.await {
            Ok(v) => {
                client.batch_execute("COMMIT").await.map_err(err_msg)?;
                Ok(v)
            }
            Err(e) => {
                if let Err(rb) = client.batch_execute("ROLLBACK").await {
                    tracing::warn!(error = %rb, "rollback failed");
                }
                Err(e)
            }
        }
    }

    fn write_result(wc: WriteConcern, r: Result<u64>) -> Result<WriteOutcome> {
        match r {
            Ok(n) => Ok(WriteOutcome::applied(n)),
            Err(e) if wc == WriteConcern::ErrorsIgnored => {
                tracing::debug!(error = %e, "write error ignored");
                Ok(WriteOutcome::applied(0))
            }
            Err(Error::Backend(msg)) => Ok(WriteOutcome::failed(msg)),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Backend for PgBackend {
    async fn save(&self, coll: &str, mut doc: Document, wc: WriteConcern) -> Result<WriteOutcome> {
        ensure_id(&mut doc);
        let client = self.client().await?;
        self.ensure_collection(&client, coll).await?;
        let r = self.in_write(&client, wc, self.upsert_row(&client, coll, &doc)).await.map(|_| 1);
        Self::write_result(wc, r)
    }

    async fn update(
        &self,
        coll: &str,
        criteria: &Document,
        obj_new: &Document,
        upsert: bool,
        multi: bool,
        wc: WriteConcern,
    ) -> Result<WriteOutcome> {
        let where_sql = build_where(criteria)?;
        let client = self.client().await?;
        if upsert {
            self.ensure_collection(&client, coll).await?;
        } else if !self.collection_exists(&client, coll).await? {
            return Ok(WriteOutcome::applied(0));
        }
        let work = async {
            let sql = format!(
                "SELECT id, doc_bson FROM {} WHERE {} ORDER BY id{} FOR UPDATE",
                self.table(coll),
                where_sql,
                if multi { "" } else { " LIMIT 1" }
            );
            let rows = client.query(&sql, &[]).await.map_err(err_msg)?;
            if rows.is_empty() {
                if !upsert {
                    return Ok(0);
                }
                let mut fresh = upsert_seed(criteria);
                apply_update(&mut fresh, obj_new).map_err(|e| Error::Backend(e.to_string()))?;
                ensure_id(&mut fresh);
                self.upsert_row(&client, coll, &fresh).await?;
                return Ok(1);
            }
            for row in &rows {
                let id: Vec<u8> = row.try_get("id").map_err(err_msg)?;
                let mut d = decode_row(row)?;
                apply_update(&mut d, obj_new).map_err(|e| Error::Backend(e.to_string()))?;
                self.rewrite_row(&client, coll, &id, &d).await?;
            }
            Ok(rows.len() as u64)
        };
        let r = self.in_write(&client, wc, work).await;
        Self::write_result(wc, r)
    }

    async fn delete(&self, coll: &str, matcher: &Document, wc: WriteConcern) -> Result<WriteOutcome> {
        let where_sql = build_where(matcher)?;
        let client = self.client().await?;
        if !self.collection_exists(&client, coll).await? {
            return Ok(WriteOutcome::applied(0));
        }
        let sql = format!("DELETE FROM {} WHERE {}", self.table(coll), where_sql);
        let r = self
            .in_write(&client, wc, async { client.execute(&sql, &[]).await.map_err(err_msg) })
            .await;
        Self::write_result(wc, r)
    }

    async fn find(&self, coll: &str, spec: &FindSpec) -> Result<Box<dyn Cursor>> {
        let where_sql = build_where(&spec.matcher)?;
        if let Some(hint) = &spec.hint {
            let hint = match hint {
                Hint::Name(n) => n.clone(),
                Hint::Keys(k) => k.to_string(),
            };
            tracing::debug!(%hint, "index hints are left to the planner");
        }
        let client = self.client().await?;
        if !self.collection_exists(&client, coll).await? {
            return Ok(Box::new(PgCursor::empty(spec.keys.clone())));
        }
        let mut sql = format!(
            "SELECT doc_bson FROM {} WHERE {} {}",
            self.table(coll),
            where_sql,
            build_order_by(spec.sort.as_ref())
        );
        if let Some(limit) = spec.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        if let Some(skip) = spec.skip {
            sql.push_str(&format!(" OFFSET {}", skip));
        }
        let name = format!("docbus_cur_{}", CURSOR_SEQ.fetch_add(1, Ordering::Relaxed));
        let declare = format!("BEGIN READ ONLY; DECLARE {} NO SCROLL CURSOR FOR {}", q_ident(&name), sql);
        if let Err(e) = client.batch_execute(&declare).await {
            if let Err(rb) = client.batch_execute("ROLLBACK").await {
                tracing::warn!(error = %rb, "rollback failed");
            }
            return Err(err_msg(e));
        }
        tracing::debug!(cursor = %name, coll, "declared cursor");
        Ok(Box::new(PgCursor::open(client, name, spec.keys.clone())))
    }

    async fn find_one(&self, coll: &str, matcher: Option<&Document>, keys: Option<&Document>) -> Result<Option<Document>> {
        let where_sql = match matcher {
            Some(m) => build_where(m)?,
            None => "TRUE".to_string(),
        };
        let client = self.client().await?;
        if !self.collection_exists(&client, coll).await? {
            return Ok(None);
        }
        let sql = format!("SELECT doc_bson FROM {} WHERE {} ORDER BY id ASC LIMIT 1", self.table(coll), where_sql);
        let row = client.query_opt(&sql, &[]).await.map_err(err_msg)?;
        match row {
            None => Ok(None),
            Some(r) => {
                let d = decode_row(&r)?;
                Ok(Some(match keys {
                    Some(k) => project(&d, k),
                    None => d,
                }))
            }
        }
    }

    async fn find_and_modify(&self, coll: &str, spec: &FindAndModifySpec) -> Result<Option<Document>> {
        let where_sql = build_where(&spec.matcher)?;
        let client = self.client().await?;
        if spec.upsert && !spec.remove {
            self.ensure_collection(&client, coll).await?;
        } else if !self.collection_exists(&client, coll).await? {
            return Ok(None);
        }
        let shape = |d: Document| match &spec.fields {
            Some(f) => project(&d, f),
            None => d,
        };
        let work = async {
            let sql = format!(
                "SELECT id, doc_bson FROM {} WHERE {} {} LIMIT 1 FOR UPDATE",
                self.table(coll),
                where_sql,
                build_order_by(spec.sort.as_ref())
            );
            let row = client.query_opt(&sql, &[]).await.map_err(err_msg)?;
            let Some(row) = row else {
                if spec.remove || !spec.upsert {
                    return Ok(None);
                }
                let update = spec.update.as_ref().ok_or_else(|| Error::missing("update"))?;
                let mut fresh = upsert_seed(&spec.matcher);
                apply_update(&mut fresh, update)?;
                ensure_id(&mut fresh);
                self.upsert_row(&client, coll, &fresh).await?;
                return Ok(spec.return_new.then(|| shape(fresh)));
            };
            let id: Vec<u8> = row.try_get("id").map_err(err_msg)?;
            let old = decode_row(&row)?;
            if spec.remove {
                let sql = format!("DELETE FROM {} WHERE id = $1", self.table(coll));
                client.execute(&sql, &[&id]).await.map_err(err_msg)?;
                return Ok(Some(shape(old)));
            }
            let update = spec.update.as_ref().ok_or_else(|| Error::missing("update"))?;
            let mut new = old.clone();
            apply_update(&mut new, update)?;
            self.rewrite_row(&client, coll, &id, &new).await?;
            Ok(Some(shape(if spec.return_new { new } else { old })))
        };
        self.in_write(&client, self.default_write_concern(), work).await
    }

    async fn count(&self, coll: &str, matcher: Option<&Document>) -> Result<u64> {
        let where_sql = match matcher {
            Some(m) => build_where(m)?,
            None => "TRUE".to_string(),
        };
        let client = self.client().await?;
        if !self.collection_exists(&client, coll).await? {
            return Ok(0);
        }
        let sql = format!("SELECT count(*) FROM {} WHERE {}", self.table(coll), where_sql);
        let row = client.query_one(&sql, &[]).await.map_err(err_msg)?;
        let n: i64 = row.get(0);
        Ok(n as u64)
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let client = self.client().await?;
        let rows = client
            .query("SELECT coll FROM mdb_meta.collections WHERE db = $1 ORDER BY coll", &[&self.db_name])
            .await
            .map_err(err_msg)?;
        Ok(rows.into_iter().map(|r| r.get::<_, String>(0)).collect())
    }

    async fn drop_collection(&self, coll: &str) -> Result<()> {
        let client = self.client().await?;
        let ddl = format!("DROP TABLE IF EXISTS {}", self.table(coll));
        client.batch_execute(&ddl).await.map_err(err_msg)?;
        client
            .execute("DELETE FROM mdb_meta.collections WHERE db = $1 AND coll = $2", &[&self.db_name, &coll])
            .await
            .map_err(err_msg)?;
        Ok(())
    }

    async fn collection_stats(&self, coll: &str) -> Result<Document> {
        let client = self.client().await?;
        let ns = format!("{}.{}", self.db_name, coll);
        if !self.collection_exists(&client, coll).await? {
            return Ok(doc! {
                "ns": ns, "count": 0i64, "size": 0i64, "avgObjSize": 0i64,
                "storageSize": 0i64, "nindexes": 0i32, "ok": 1.0,
            });
        }
        let sql = format!(
            "SELECT count(*), coalesce(sum(octet_length(doc_bson)), 0)::bigint, pg_total_relation_size('{}'::regclass) FROM {}",
            escape_single(&self.table(coll)),
            self.table(coll)
        );
        let row = client.query_one(&sql, &[]).await.map_err(err_msg)?;
        let count: i64 = row.get(0);
        let size: i64 = row.get(1);
        let storage: i64 = row.get(2);
        let idx = client
            .query_one(
                "SELECT count(*) FROM pg_indexes WHERE schemaname = $1 AND tablename = $2",
                &[&self.schema, &coll],
            )
            .await
            .map_err(err_msg)?;
        let nindexes: i64 = idx.get(0);
        Ok(doc! {
            "ns": ns,
            "count": count,
            "size": size,
            "avgObjSize": (if count > 0 { size / count } else { 0 }),
            "storageSize": storage,
            "nindexes": (nindexes as i32),
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
        self.pool.close();
        tracing::info!(db = %self.db_name, "postgres pool closed");
    }
}

/// A server-side portal. Owns its connection until closed; the transaction
/// holding the portal stays open for that long.
pub struct PgCursor {
    client: Option<Object>,
    name: String,
    keys: Option<Document>,
    buffer: VecDeque<Document>,
    exhausted: bool,
    closed: bool,
}

impl PgCursor {
    fn open(client: Object, name: String, keys: Option<Document>) -> Self {
        Self { client: Some(client), name, keys, buffer: VecDeque::new(), exhausted: false, closed: false }
    }

    fn empty(keys: Option<Document>) -> Self {
        Self { client: None, name: String::new(), keys, buffer: VecDeque::new(), exhausted: true, closed: false }
    }

    async fn fetch(&mut self) -> Result<()> {
        let Some(client) = &self.client else {
            self.exhausted = true;
            return Ok(());
        };
        let sql = format!("FETCH FORWARD {} FROM {}", FETCH_ROWS, q_ident(&self.name));
        let rows = client.query(&sql, &[]).await.map_err(err_msg)?;
        if rows.len() < FETCH_ROWS {
            self.exhausted = true;
        }
        for row in &rows {
            let d = decode_row(row)?;
            self.buffer.push_back(match &self.keys {
                Some(k) => project(&d, k),
                None => d,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Cursor for PgCursor {
    async fn has_next(&mut self) -> Result<bool> {
        if self.closed {
            return Ok(false);
        }
        if self.buffer.is_empty() && !self.exhausted {
            self.fetch().await?;
        }
        Ok(!self.buffer.is_empty())
    }

    async fn next(&mut self) -> Result<Option<Document>> {
        if self.closed {
            return Err(Error::Backend("cursor is closed".into()));
        }
        if !self.has_next().await? {
            return Ok(None);
        }
        Ok(self.buffer.pop_front())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.buffer.clear();
        let Some(client) = self.client.take() else {
            return Ok(());
        };
        let sql = format!("CLOSE {}; COMMIT", q_ident(&self.name));
        if let Err(e) = client.batch_execute(&sql).await {
            // Never hand a connection with an open transaction back to the pool.
            drop(Object::take(client));
            return Err(err_msg(e));
        }
        tracing::debug!(cursor = %self.name, "closed cursor");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for PgCursor {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            tracing::debug!(cursor = %self.name, "cursor dropped while open; discarding its connection");
            drop(Object::take(client));
        }
    }
}
