//! Conversion between wire JSON objects and BSON documents.
//!
//! Inbound JSON is read as MongoDB extended JSON, so `{"$oid": ..}`,
//! `{"$date": ..}` and `{"$binary": ..}` come through as their BSON types.
//! Outbound documents are written as relaxed extended JSON, which keeps
//! plain JSON values unchanged and renders the extended types symmetrically.

use crate::error::{Error, Result};
use bson::{Bson, Document};
use serde_json::{Map, Value};

pub fn to_document(json: &Map<String, Value>) -> Result<Document> {
    match Bson::try_from(Value::Object(json.clone())) {
        Ok(Bson::Document(doc)) => Ok(doc),
        Ok(other) => Err(Error::Codec(format!("expected a document, got {:?}", other.element_type()))),
        Err(e) => Err(Error::Codec(e.to_string())),
    }
}

pub fn to_bson(json: &Value) -> Result<Bson> {
    Bson::try_from(json.clone()).map_err(|e| Error::Codec(e.to_string()))
}

pub fn to_json(doc: Document) -> Map<String, Value> {
    match Bson::Document(doc).into_relaxed_extjson() {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

pub fn to_json_value(doc: Document) -> Value {
    Value::Object(to_json(doc))
}

/// Parse an administrative command given as an extended JSON string.
pub fn parse_command(text: &str) -> Result<Document> {
    let value: Value = serde_json::from_str(text)?;
    match value {
        Value::Object(map) => to_document(&map),
        _ => Err(Error::invalid("command", "a JSON object")),
    }
}
