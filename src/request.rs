//! Request envelopes and their validation.
//!
//! An inbound envelope is parsed into a typed [`Request`] before any handler
//! runs. Parsing is the whole of validation: a request that fails here never
//! reaches the backend.

use crate::backend::{FindAndModifySpec, FindSpec, Hint};
use crate::codec;
use crate::error::{Error, Result};
use crate::write_concern::request_candidates;
use bson::Document;
use serde_json::{Map, Value};
use std::time::Duration;

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Save,
    Update,
    Delete,
    Find,
    FindOne,
    FindAndModify,
    Count,
    GetCollections,
    DropCollection,
    CollectionStats,
    Command,
}

impl Action {
    /// Both spellings listed for an action are accepted indefinitely.
    pub fn parse(name: &str) -> Option<Self> {
        let action = match name {
            "save" => Action::Save,
            "update" => Action::Update,
            "delete" => Action::Delete,
            "find" => Action::Find,
            "findone" => Action::FindOne,
            "find_and_modify" | "findAndModify" => Action::FindAndModify,
            "count" => Action::Count,
            "getCollections" | "get_collections" => Action::GetCollections,
            "dropCollection" | "drop_collection" => Action::DropCollection,
            "collectionStats" | "collection_stats" => Action::CollectionStats,
            "command" => Action::Command,
            _ => return None,
        };
        Some(action)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Save => "save",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Find => "find",
            Action::FindOne => "findone",
            Action::FindAndModify => "find_and_modify",
            Action::Count => "count",
            Action::GetCollections => "getCollections",
            Action::DropCollection => "dropCollection",
            Action::CollectionStats => "collectionStats",
            Action::Command => "command",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FindRequest {
    pub collection: String,
    pub spec: FindSpec,
    pub batch_size: usize,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Save {
        collection: String,
        document: Document,
        write_concern: Vec<String>,
    },
    Update {
        collection: String,
        criteria: Document,
        obj_new: Document,
        upsert: bool,
        multi: bool,
        write_concern: Vec<String>,
    },
    Delete {
        collection: String,
        matcher: Document,
        write_concern: Vec<String>,
    },
    Find(FindRequest),
    FindOne {
        collection: String,
        matcher: Option<Document>,
        keys: Option<Document>,
    },
    FindAndModify {
        collection: String,
        spec: FindAndModifySpec,
    },
    Count {
        collection: String,
        matcher: Option<Document>,
    },
    GetCollections,
    DropCollection {
        collection: String,
    },
    CollectionStats {
        collection: String,
    },
    Command {
        command: Document,
    },
}

impl Request {
    pub fn parse(body: &Map<String, Value>) -> Result<Self> {
        let action = match body.get("action") {
            None | Some(Value::Null) => return Err(Error::Validation("action must be specified".into())),
            Some(Value::String(name)) => {
                Action::parse(name).ok_or_else(|| Error::Validation(format!("Invalid action: {}", name)))?
            }
            Some(other) => return Err(Error::Validation(format!("Invalid action: {}", other))),
        };
        let f = Fields(body);
        let req = match action {
            Action::Save => Request::Save {
                collection: f.mandatory_str("collection")?,
                document: f.mandatory_object("document")?,
                write_concern: request_candidates(body),
            },
            Action::Update => Request::Update {
                collection: f.mandatory_str("collection")?,
                criteria: f.mandatory_object("criteria")?,
                obj_new: f.mandatory_object("objNew")?,
                upsert: f.bool_or("upsert", false)?,
                multi: f.bool_or("multi", false)?,
                write_concern: request_candidates(body),
            },
            Action::Delete => Request::Delete {
                collection: f.mandatory_str("collection")?,
                matcher: f.mandatory_object("matcher")?,
                write_concern: request_candidates(body),
            },
            Action::Find => Request::Find(parse_find(&f)?),
            Action::FindOne => Request::FindOne {
                collection: f.mandatory_str("collection")?,
                matcher: f.optional_object("matcher")?,
                keys: f.optional_object("keys")?,
            },
            Action::FindAndModify => {
                let collection = f.mandatory_str("collection")?;
                let spec = FindAndModifySpec {
                    matcher: f.optional_object("matcher")?.unwrap_or_default(),
                    update: f.optional_object("update")?,
                    sort: f.sort("sort")?,
                    fields: f.optional_object("fields")?,
                    remove: f.bool_or("remove", false)?,
                    return_new: f.bool_or("new", false)?,
                    upsert: f.bool_or("upsert", false)?,
                };
                if !spec.remove && spec.update.is_none() {
                    return Err(Error::missing("update"));
                }
                Request::FindAndModify { collection, spec }
            }
            Action::Count => Request::Count {
                collection: f.mandatory_str("collection")?,
                matcher: f.optional_object("matcher")?,
            },
            Action::GetCollections => Request::GetCollections,
            Action::DropCollection => Request::DropCollection {
                collection: f.mandatory_str("collection")?,
            },
            Action::CollectionStats => Request::CollectionStats {
                collection: f.mandatory_str("collection")?,
            },
            Action::Command => Request::Command { command: f.command("command")? },
        };
        Ok(req)
    }

    pub fn action(&self) -> Action {
        match self {
            Request::Save { .. } => Action::Save,
            Request::Update { .. } => Action::Update,
            Request::Delete { .. } => Action::Delete,
            Request::Find(_) => Action::Find,
            Request::FindOne { .. } => Action::FindOne,
            Request::FindAndModify { .. } => Action::FindAndModify,
            Request::Count { .. } => Action::Count,
            Request::GetCollections => Action::GetCollections,
            Request::DropCollection { .. } => Action::DropCollection,
            Request::CollectionStats { .. } => Action::CollectionStats,
            Request::Command { .. } => Action::Command,
        }
    }
}

fn parse_find(f: &Fields<'_>) -> Result<FindRequest> {
    let collection = f.mandatory_str("collection")?;
    let limit = f.optional_int("limit")?.filter(|n| *n > 0).map(|n| n as u64);
    let skip = f.optional_int("skip")?.filter(|n| *n > 0).map(|n| n as u64);
    let batch_size = match f.optional_int("batch_size")? {
        Some(n) if n > 0 => n as usize,
        _ => DEFAULT_BATCH_SIZE,
    };
    let timeout = match f.optional_int("timeout")? {
        Some(ms) if ms >= 0 => Duration::from_millis(ms as u64),
        _ => DEFAULT_TIMEOUT,
    };
    let spec = FindSpec {
        matcher: f.optional_object("matcher")?.unwrap_or_default(),
        keys: f.optional_object("keys")?,
        sort: f.sort("sort")?,
        hint: f.hint("hint")?,
        skip,
        limit,
    };
    Ok(FindRequest { collection, spec, batch_size, timeout })
}

fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Typed readers over an envelope; `null` counts as absent everywhere.
struct Fields<'a>(&'a Map<String, Value>);

impl Fields<'_> {
    fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field).filter(|v| !v.is_null())
    }

    fn mandatory_str(&self, field: &str) -> Result<String> {
        match self.get(field) {
            None => Err(Error::missing(field)),
            Some(Value::String(s)) => Ok(s.clone()),
            Some(_) => Err(Error::invalid(field, "a string")),
        }
    }

    fn mandatory_object(&self, field: &str) -> Result<Document> {
        self.optional_object(field)?.ok_or_else(|| Error::missing(field))
    }

    fn optional_object(&self, field: &str) -> Result<Option<Document>> {
        match self.get(field) {
            None => Ok(None),
            Some(Value::Object(map)) => codec::to_document(map).map(Some),
            Some(_) => Err(Error::invalid(field, "a JSON object")),
        }
    }

    fn bool_or(&self, field: &str, default: bool) -> Result<bool> {
        match self.get(field) {
            None => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(_) => Err(Error::invalid(field, "a boolean")),
        }
    }

    fn optional_int(&self, field: &str) -> Result<Option<i64>> {
        match self.get(field) {
            None => Ok(None),
            Some(Value::Number(n)) => {
                if let Some(i) = n.as_i64() {
                    Ok(Some(i))
                } else {
                    match n.as_f64() {
                        Some(x) if x.fract() == 0.0 && x.abs() < i64::MAX as f64 => Ok(Some(x as i64)),
                        _ => Err(Error::invalid(field, "an integer")),
                    }
                }
            }
            Some(_) => Err(Error::invalid(field, "an integer")),
        }
    }

    /// A single mapping, or an ordered array of mappings merged key by key.
    fn sort(&self, field: &str) -> Result<Option<Document>> {
        match self.get(field) {
            None => Ok(None),
            Some(Value::Object(map)) => codec::to_document(map).map(Some),
            Some(Value::Array(items)) => {
                let mut merged = Document::new();
                for item in items {
                    match item {
                        Value::Object(map) => {
                            for (k, v) in codec::to_document(map)? {
                                merged.insert(k, v);
                            }
                        }
                        other => {
                            return Err(Error::Validation(format!("Cannot handle type {}", json_type_name(other))));
                        }
                    }
                }
                Ok(Some(merged))
            }
            Some(other) => Err(Error::Validation(format!("Cannot handle type {}", json_type_name(other)))),
        }
    }

    fn hint(&self, field: &str) -> Result<Option<Hint>> {
        match self.get(field) {
            None => Ok(None),
            Some(Value::String(name)) => Ok(Some(Hint::Name(name.clone()))),
            Some(Value::Object(map)) => Ok(Some(Hint::Keys(codec::to_document(map)?))),
            Some(_) => Err(Error::invalid(field, "an index name or an index specification")),
        }
    }

    fn command(&self, field: &str) -> Result<Document> {
        match self.get(field) {
            None => Err(Error::missing(field)),
            Some(Value::String(text)) => codec::parse_command(text).map_err(|e| match e {
                Error::Json(e) => Error::Validation(format!("{} is not valid JSON: {}", field, e)),
                other => other,
            }),
            Some(Value::Object(map)) => codec::to_document(map),
            Some(_) => Err(Error::invalid(field, "a JSON string or object")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use serde_json::json;

    fn parse(v: Value) -> Result<Request> {
        Request::parse(v.as_object().unwrap())
    }

    fn message(r: Result<Request>) -> String {
        match r {
            Err(Error::Validation(m)) => m,
            other => panic!("expected a validation error, got {:?}", other),
        }
    }

    #[test]
    fn action_is_required_and_must_be_known() {
        assert_eq!(message(parse(json!({"collection": "c"}))), "action must be specified");
        assert_eq!(message(parse(json!({"action": "frobnicate"}))), "Invalid action: frobnicate");
    }

    #[test]
    fn mandatory_fields_are_named_when_missing() {
        assert_eq!(message(parse(json!({"action": "save", "collection": "c"}))), "document must be specified");
        assert_eq!(message(parse(json!({"action": "update", "collection": "c", "criteria": {}}))), "objNew must be specified");
        assert_eq!(message(parse(json!({"action": "delete", "collection": "c"}))), "matcher must be specified");
        assert_eq!(message(parse(json!({"action": "count"}))), "collection must be specified");
        assert_eq!(message(parse(json!({"action": "command"}))), "command must be specified");
        assert_eq!(message(parse(json!({"action": "find_and_modify", "collection": "c"}))), "update must be specified");
    }

    #[test]
    fn wrong_shapes_are_rejected() {
        assert_eq!(message(parse(json!({"action": "delete", "collection": "c", "matcher": [1]}))), "matcher must be a JSON object");
        assert_eq!(message(parse(json!({"action": "find", "collection": "c", "limit": "ten"}))), "limit must be an integer");
        assert_eq!(message(parse(json!({"action": "find", "collection": "c", "sort": 1}))), "Cannot handle type number");
        assert_eq!(message(parse(json!({"action": "find", "collection": "c", "sort": [{"a": 1}, "b"]}))), "Cannot handle type string");
    }

    #[test]
    fn find_defaults_and_coercions() {
        let Request::Find(f) = parse(json!({"action": "find", "collection": "c", "limit": -1, "skip": -5, "timeout": -1, "batch_size": 0})).unwrap() else {
            panic!("expected find");
        };
        assert_eq!(f.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(f.timeout, DEFAULT_TIMEOUT);
        assert_eq!(f.spec.limit, None);
        assert_eq!(f.spec.skip, None);
        assert!(f.spec.matcher.is_empty());
    }

    #[test]
    fn array_sort_keeps_element_order() {
        let Request::Find(f) = parse(json!({"action": "find", "collection": "c", "sort": [{"b": -1}, {"a": 1}], "hint": "a_1"})).unwrap() else {
            panic!("expected find");
        };
        let sort = f.spec.sort.unwrap();
        assert_eq!(sort.keys().collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(f.spec.hint, Some(Hint::Name("a_1".into())));
    }

    #[test]
    fn aliases_resolve_to_the_same_action() {
        assert_eq!(parse(json!({"action": "get_collections"})).unwrap(), Request::GetCollections);
        assert_eq!(parse(json!({"action": "drop_collection", "collection": "c"})).unwrap().action(), Action::DropCollection);
        assert_eq!(parse(json!({"action": "collection_stats", "collection": "c"})).unwrap().action(), Action::CollectionStats);
    }

    #[test]
    fn command_may_be_a_json_string() {
        let r = parse(json!({"action": "command", "command": "{\"ping\": 1}"})).unwrap();
        assert_eq!(r, Request::Command { command: doc! {"ping": 1} });
        assert!(message(parse(json!({"action": "command", "command": "{oops"}))).starts_with("command is not valid JSON"));
    }

    #[test]
    fn update_flags_default_to_false() {
        let r = parse(json!({"action": "update", "collection": "c", "criteria": {"name": "a"}, "objNew": {"$set": {"name": "b"}}, "write_concern": "SAFE"})).unwrap();
        match r {
            Request::Update { upsert, multi, write_concern, .. } => {
                assert!(!upsert);
                assert!(!multi);
                assert_eq!(write_concern, vec!["SAFE".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
