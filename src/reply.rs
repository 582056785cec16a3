use crate::error::Error;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error,
    /// A batch was sent and the cursor still has documents.
    MoreExist,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::Error => "error",
            Status::MoreExist => "more-exist",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ok" => Some(Status::Ok),
            "error" => Some(Status::Error),
            "more-exist" => Some(Status::MoreExist),
            _ => None,
        }
    }
}

/// Reply envelope: a JSON object with a `status` plus result fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    body: Map<String, Value>,
}

impl Reply {
    fn with_status(status: Status) -> Self {
        let mut body = Map::new();
        body.insert("status".to_string(), Value::String(status.as_str().to_string()));
        Self { body }
    }

    pub fn ok() -> Self {
        Self::with_status(Status::Ok)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::with_status(Status::Error).with("message", message.into())
    }

    pub fn batch(status: Status, results: Vec<Value>) -> Self {
        let number = results.len() as u64;
        Self::with_status(status).with("results", results).with("number", number)
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.body.insert(key.to_string(), value.into());
        self
    }

    pub fn status(&self) -> Option<Status> {
        self.body.get("status").and_then(Value::as_str).and_then(Status::parse)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.body)
    }

    /// Accept a reply received off the wire; it must be an object with a known status.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(body) => {
                let reply = Self { body };
                reply.status().map(|_| reply)
            }
            _ => None,
        }
    }
}

impl From<Error> for Reply {
    fn from(e: Error) -> Self {
        Reply::error(e.to_string())
    }
}
