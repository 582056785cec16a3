//! Write-concern resolution.
//!
//! A write picks its durability level from, in order: the request's own
//! override, the module configuration, then the backend's database default.
//! At the first two levels the keys are consulted in the order given by
//! [`WRITE_CONCERN_KEYS`]. A value that does not name a known level is
//! skipped rather than rejected, so deployments carrying an old or
//! misspelled setting keep writing with the next level down.

use crate::config::Config;
use serde_json::{Map, Value};

/// Envelope and configuration keys for the write concern, highest priority first.
pub const WRITE_CONCERN_KEYS: [&str; 2] = ["writeConcern", "write_concern"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteConcern {
    /// Fire and forget, network errors ignored too.
    ErrorsIgnored,
    Unacknowledged,
    Acknowledged,
    Fsynced,
    Journaled,
    ReplicaAcknowledged,
    ThreeReplicas,
    Majority,
}

impl WriteConcern {
    pub fn parse(name: &str) -> Option<Self> {
        let norm = name.trim().to_ascii_uppercase().replace('-', "_");
        let wc = match norm.as_str() {
            "NONE" | "ERRORS_IGNORED" => WriteConcern::ErrorsIgnored,
            "NORMAL" | "UNACKNOWLEDGED" | "W0" => WriteConcern::Unacknowledged,
            "SAFE" | "ACKNOWLEDGED" | "W1" => WriteConcern::Acknowledged,
            "FSYNC_SAFE" | "FSYNCED" => WriteConcern::Fsynced,
            "JOURNAL_SAFE" | "JOURNALED" => WriteConcern::Journaled,
            "REPLICAS_SAFE" | "REPLICA_ACKNOWLEDGED" | "W2" => WriteConcern::ReplicaAcknowledged,
            "W3" => WriteConcern::ThreeReplicas,
            "MAJORITY" => WriteConcern::Majority,
            _ => return None,
        };
        Some(wc)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WriteConcern::ErrorsIgnored => "ERRORS_IGNORED",
            WriteConcern::Unacknowledged => "UNACKNOWLEDGED",
            WriteConcern::Acknowledged => "ACKNOWLEDGED",
            WriteConcern::Fsynced => "FSYNCED",
            WriteConcern::Journaled => "JOURNALED",
            WriteConcern::ReplicaAcknowledged => "REPLICA_ACKNOWLEDGED",
            WriteConcern::ThreeReplicas => "W3",
            WriteConcern::Majority => "MAJORITY",
        }
    }

    pub fn is_acknowledged(&self) -> bool {
        !matches!(self, WriteConcern::ErrorsIgnored | WriteConcern::Unacknowledged)
    }
}

/// Collect the write-concern names present in an envelope, in priority order.
pub fn request_candidates(body: &Map<String, Value>) -> Vec<String> {
    WRITE_CONCERN_KEYS
        .iter()
        .filter_map(|k| body.get(*k))
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct WriteConcernResolver {
    configured: Vec<String>,
}

impl WriteConcernResolver {
    pub fn new(configured: Vec<String>) -> Self {
        Self { configured }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.write_concern_candidates())
    }

    pub fn resolve(&self, overrides: &[String], db_default: WriteConcern) -> WriteConcern {
        for name in overrides.iter().chain(self.configured.iter()) {
            match WriteConcern::parse(name) {
                Some(wc) => return wc,
                None => tracing::debug!(write_concern = %name, "unrecognized write concern; falling through"),
            }
        }
        db_default
    }
}
