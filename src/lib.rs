//! docbus: a document-database gateway addressed over a request/reply message bus.

pub mod backend;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod protocol;
pub mod reply;
pub mod request;
pub mod router;
pub mod server;
pub mod stream;
pub mod write_concern;
