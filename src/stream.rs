//! Cursor streaming sessions.
//!
//! A find produces a [`StreamSession`] owning its cursor. Each batch step
//! consumes the session and either finishes it (`Outcome::Done`, cursor
//! closed) or hands it back alongside a `more-exist` reply. Whoever holds the
//! session is the only party able to advance or abandon it.

use crate::backend::Cursor;
use crate::codec;
use crate::error::Result;
use crate::reply::{Reply, Status};
use serde_json::Value;
use std::time::Duration;

pub enum Outcome {
    Done(Reply),
    /// A batch went out and the cursor has more; the session awaits a continuation.
    MoreExist(Reply, StreamSession),
}

impl Outcome {
    pub fn reply(&self) -> &Reply {
        match self {
            Outcome::Done(r) | Outcome::MoreExist(r, _) => r,
        }
    }

    pub fn into_reply(self) -> Reply {
        match self {
            Outcome::Done(r) => r,
            Outcome::MoreExist(r, _) => r,
        }
    }
}

impl std::fmt::Debug for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Done(r) => f.debug_tuple("Done").field(r).finish(),
            Outcome::MoreExist(r, s) => f.debug_tuple("MoreExist").field(r).field(&s.collection).finish(),
        }
    }
}

pub struct StreamSession {
    cursor: Box<dyn Cursor>,
    collection: String,
    batch_size: usize,
    timeout: Duration,
}

impl StreamSession {
    pub fn new(cursor: Box<dyn Cursor>, collection: impl Into<String>, batch_size: usize, timeout: Duration) -> Self {
        Self { cursor, collection: collection.into(), batch_size: batch_size.max(1), timeout }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// How long the session may wait for a continuation before it is abandoned.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn fill(&mut self) -> Result<(Vec<Value>, bool)> {
        let mut results = Vec::with_capacity(self.batch_size.min(1024));
        while results.len() < self.batch_size {
            match self.cursor.next().await? {
                Some(doc) => results.push(codec::to_json_value(doc)),
                None => break,
            }
        }
        let more = self.cursor.has_next().await?;
        Ok((results, more))
    }

    /// Pull up to `batch_size` documents. The cursor is closed on exhaustion
    /// and on error.
    pub async fn next_batch(mut self) -> Result<Outcome> {
        match self.fill().await {
            Ok((results, true)) => Ok(Outcome::MoreExist(Reply::batch(Status::MoreExist, results), self)),
            Ok((results, false)) => {
                self.cursor.close().await?;
                Ok(Outcome::Done(Reply::batch(Status::Ok, results)))
            }
            Err(e) => {
                self.abandon().await;
                Err(e)
            }
        }
    }

    /// Close the cursor without replying.
    pub async fn abandon(mut self) {
        if let Err(e) = self.cursor.close().await {
            tracing::warn!(error = %e, collection = %self.collection, "failed to close cursor");
        }
    }
}
