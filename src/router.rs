//! Routes request envelopes to the backend and shapes their replies.

use crate::backend::Backend;
use crate::codec;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::reply::Reply;
use crate::request::Request;
use crate::stream::{Outcome, StreamSession};
use crate::write_concern::WriteConcernResolver;
use bson::Bson;
use serde_json::Value;
use std::sync::Arc;

pub struct Persistor {
    backend: Arc<dyn Backend>,
    address: String,
    resolver: WriteConcernResolver,
}

impl Persistor {
    pub fn new(backend: Arc<dyn Backend>, address: impl Into<String>, resolver: WriteConcernResolver) -> Self {
        Self { backend, address: address.into(), resolver }
    }

    pub fn from_config(cfg: &Config, backend: Arc<dyn Backend>) -> Self {
        Self::new(backend, cfg.address.clone(), WriteConcernResolver::from_config(cfg))
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Handle one request envelope. Failures come back as error replies.
    pub async fn handle(&self, envelope: &Value) -> Outcome {
        let Some(body) = envelope.as_object() else {
            return Outcome::Done(Reply::error("Malformed request body"));
        };
        let request = match Request::parse(body) {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(error = %e, "rejected request");
                return Outcome::Done(e.into());
            }
        };
        let action = request.action();
        tracing::debug!(action = action.as_str(), "handling request");
        match self.dispatch(request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::debug!(action = action.as_str(), error = %e, "request failed");
                Outcome::Done(e.into())
            }
        }
    }

    /// Run the next batch step of a session after a continuation.
    pub async fn resume(&self, session: StreamSession) -> Outcome {
        match session.next_batch().await {
            Ok(outcome) => outcome,
            Err(e) => Outcome::Done(e.into()),
        }
    }

    pub async fn abandon(&self, session: StreamSession) {
        session.abandon().await;
    }

    pub async fn shutdown(&self) {
        tracing::info!(address = %self.address, "persistor shutting down");
        self.backend.close().await;
    }

    async fn dispatch(&self, request: Request) -> Result<Outcome> {
        let db_default = self.backend.default_write_concern();
        let reply = match request {
            Request::Save { collection, mut document, write_concern } => {
                let generated = if document.contains_key("_id") {
                    None
                } else {
                    let id = uuid::Uuid::new_v4().to_string();
                    document.insert("_id", Bson::String(id.clone()));
                    Some(id)
                };
                let wc = self.resolver.resolve(&write_concern, db_default);
                let outcome = self.backend.save(&collection, document, wc).await?;
                if let Some(msg) = outcome.error {
                    return Ok(Outcome::Done(Reply::error(msg)));
                }
                match generated {
                    Some(id) => Reply::ok().with("_id", id),
                    None => Reply::ok(),
                }
            }
            Request::Update { collection, criteria, obj_new, upsert, multi, write_concern } => {
                let wc = self.resolver.resolve(&write_concern, db_default);
                let outcome = self.backend.update(&collection, &criteria, &obj_new, upsert, multi, wc).await?;
                match outcome.error {
                    Some(msg) => Reply::error(msg),
                    None => Reply::ok().with("number", outcome.n),
                }
            }
            Request::Delete { collection, matcher, write_concern } => {
                let wc = self.resolver.resolve(&write_concern, db_default);
                let outcome = self.backend.delete(&collection, &matcher, wc).await?;
                match outcome.error {
                    Some(msg) => Reply::error(msg),
                    None => Reply::ok().with("number", outcome.n),
                }
            }
            Request::Find(find) => {
                let cursor = self.backend.find(&find.collection, &find.spec).await?;
                let session = StreamSession::new(cursor, find.collection, find.batch_size, find.timeout);
                return session.next_batch().await;
            }
            Request::FindOne { collection, matcher, keys } => {
                let found = self.backend.find_one(&collection, matcher.as_ref(), keys.as_ref()).await?;
                with_result(Reply::ok(), found)
            }
            Request::FindAndModify { collection, spec } => {
                let found = self.backend.find_and_modify(&collection, &spec).await?;
                with_result(Reply::ok(), found)
            }
            Request::Count { collection, matcher } => {
                let n = self.backend.count(&collection, matcher.as_ref()).await?;
                Reply::ok().with("count", n)
            }
            Request::GetCollections => {
                let mut names = self.backend.list_collections().await?;
                names.sort();
                Reply::ok().with("collections", names)
            }
            Request::DropCollection { collection } => match self.backend.drop_collection(&collection).await {
                Ok(()) => Reply::ok(),
                Err(e) => Reply::error(drop_failure(&collection, &e)),
            },
            Request::CollectionStats { collection } => {
                let stats = self.backend.collection_stats(&collection).await?;
                Reply::ok().with("stats", codec::to_json_value(stats))
            }
            Request::Command { command } => {
                let result = self.backend.run_command(&command).await?;
                Reply::ok().with("result", codec::to_json_value(result))
            }
        };
        Ok(Outcome::Done(reply))
    }
}

fn with_result(reply: Reply, found: Option<bson::Document>) -> Reply {
    match found {
        Some(doc) => reply.with("result", codec::to_json_value(doc)),
        None => reply,
    }
}

fn drop_failure(collection: &str, e: &Error) -> String {
    format!("exception thrown when attempting to drop collection: {} \n{}", collection, e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::reply::Status;
    use serde_json::json;

    fn persistor() -> (Persistor, Arc<MemoryBackend>) {
        let mem = Arc::new(MemoryBackend::new("test"));
        let p = Persistor::new(mem.clone(), "docbus.persistor", WriteConcernResolver::default());
        (p, mem)
    }

    async fn done(p: &Persistor, v: Value) -> Reply {
        match p.handle(&v).await {
            Outcome::Done(r) => r,
            Outcome::MoreExist(..) => panic!("unexpected more-exist"),
        }
    }

    #[tokio::test]
    async fn validation_errors_never_reach_the_backend() {
        let (p, mem) = persistor();
        for bad in [
            json!({}),
            json!({"action": "nope"}),
            json!({"action": "save", "collection": "c"}),
            json!({"action": "update", "collection": "c", "criteria": {}}),
            json!({"action": "delete", "collection": "c"}),
            json!({"action": "find"}),
            json!({"action": "command"}),
            json!("not an object"),
        ] {
            let r = done(&p, bad).await;
            assert_eq!(r.status(), Some(Status::Error));
        }
        assert_eq!(mem.calls(), 0);
    }

    #[tokio::test]
    async fn save_injects_id_only_when_missing() {
        let (p, _) = persistor();
        let r = done(&p, json!({"action": "save", "collection": "c", "document": {"a": 1}})).await;
        let id = r.get("_id").and_then(Value::as_str).unwrap().to_string();
        assert_eq!(id.len(), 36);

        let r = done(&p, json!({"action": "save", "collection": "c", "document": {"_id": "x", "a": 2}})).await;
        assert_eq!(r.status(), Some(Status::Ok));
        assert!(r.get("_id").is_none());

        let r = done(&p, json!({"action": "findone", "collection": "c", "matcher": {"_id": id}})).await;
        assert_eq!(r.get("result"), Some(&json!({"a": 1, "_id": id})));
    }

    #[tokio::test]
    async fn update_delete_and_count_report_numbers() {
        let (p, _) = persistor();
        for n in 0..3 {
            done(&p, json!({"action": "save", "collection": "c", "document": {"_id": n, "g": "x"}})).await;
        }
        let r = done(&p, json!({"action": "update", "collection": "c", "criteria": {"g": "x"}, "objNew": {"$set": {"g": "y"}}, "multi": true})).await;
        assert_eq!(r.get("number"), Some(&json!(3)));
        let r = done(&p, json!({"action": "count", "collection": "c", "matcher": {"g": "y"}})).await;
        assert_eq!(r.get("count"), Some(&json!(3)));
        let r = done(&p, json!({"action": "delete", "collection": "c", "matcher": {"_id": 0}})).await;
        assert_eq!(r.get("number"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn backend_failures_become_error_replies() {
        let (p, _) = persistor();
        done(&p, json!({"action": "save", "collection": "c", "document": {"_id": 1, "s": "text"}})).await;
        let r = done(&p, json!({"action": "update", "collection": "c", "criteria": {}, "objNew": {"$inc": {"s": 1}}})).await;
        assert_eq!(r.status(), Some(Status::Error));
        assert!(r.get("message").and_then(Value::as_str).unwrap().contains("$inc"));
    }

    #[tokio::test]
    async fn inc_overflow_is_an_error_reply() {
        let (p, _) = persistor();
        done(&p, json!({"action": "save", "collection": "c", "document": {"_id": 1, "n": i64::MAX}})).await;
        let r = done(&p, json!({"action": "update", "collection": "c", "criteria": {"_id": 1}, "objNew": {"$inc": {"n": 1}}})).await;
        assert_eq!(r.status(), Some(Status::Error));
        let r = done(&p, json!({"action": "findone", "collection": "c", "matcher": {"_id": 1}})).await;
        assert_eq!(r.get("result"), Some(&json!({"_id": 1, "n": i64::MAX})));
    }

    #[tokio::test]
    async fn find_streams_when_more_remain() {
        let (p, mem) = persistor();
        for n in 0..5 {
            done(&p, json!({"action": "save", "collection": "c", "document": {"_id": n}})).await;
        }
        let out = p.handle(&json!({"action": "find", "collection": "c", "batch_size": 3, "sort": {"_id": 1}})).await;
        let Outcome::MoreExist(first, session) = out else {
            panic!("expected more-exist");
        };
        assert_eq!(first.get("results"), Some(&json!([{"_id": 0}, {"_id": 1}, {"_id": 2}])));
        let Outcome::Done(last) = p.resume(session).await else {
            panic!("expected done");
        };
        assert_eq!(last.get("results"), Some(&json!([{"_id": 3}, {"_id": 4}])));
        assert_eq!(mem.open_cursors(), 0);
    }

    #[tokio::test]
    async fn admin_actions() {
        let (p, _) = persistor();
        done(&p, json!({"action": "save", "collection": "b", "document": {"_id": 1}})).await;
        done(&p, json!({"action": "save", "collection": "a", "document": {"_id": 1}})).await;
        let r = done(&p, json!({"action": "get_collections"})).await;
        assert_eq!(r.get("collections"), Some(&json!(["a", "b"])));

        let r = done(&p, json!({"action": "collectionStats", "collection": "a"})).await;
        assert_eq!(r.get("stats").and_then(|s| s.get("ns")), Some(&json!("test.a")));

        let r = done(&p, json!({"action": "command", "command": "{\"ping\": 1}"})).await;
        assert_eq!(r.get("result"), Some(&json!({"ok": 1.0})));

        let r = done(&p, json!({"action": "dropCollection", "collection": "a"})).await;
        assert_eq!(r.status(), Some(Status::Ok));
        let r = done(&p, json!({"action": "getCollections"})).await;
        assert_eq!(r.get("collections"), Some(&json!(["b"])));
    }

    #[test]
    fn drop_failure_message_names_the_collection() {
        let e = Error::Backend("permission denied".into());
        assert_eq!(drop_failure("c", &e), "exception thrown when attempting to drop collection: c \npermission denied");
    }
}
