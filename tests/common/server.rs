#![allow(dead_code)]

use docbus::backend::memory::MemoryBackend;
use docbus::client::BusClient;
use docbus::config::Config;
use docbus::router::Persistor;
use docbus::server::spawn_with_backend;
use std::net::SocketAddr;
use std::sync::Arc;

pub const ADDRESS: &str = "docbus.persistor";

/// A bus server over a fresh in-memory backend on an ephemeral port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub backend: Arc<MemoryBackend>,
    pub persistor: Arc<Persistor>,
    shutdown: tokio::sync::watch::Sender<bool>,
    handle: tokio::task::JoinHandle<docbus::error::Result<()>>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(Config::default()).await
    }

    pub async fn start_with(mut cfg: Config) -> Self {
        cfg.listen_addr = "127.0.0.1:0".into();
        cfg.address = ADDRESS.into();
        let backend = Arc::new(MemoryBackend::new("test"));
        let (persistor, addr, shutdown, handle) = spawn_with_backend(cfg, backend.clone()).await.unwrap();
        Self { addr, backend, persistor, shutdown, handle }
    }

    pub async fn client(&self) -> BusClient {
        BusClient::connect(self.addr, ADDRESS).await.unwrap()
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        self.handle.await.unwrap().unwrap();
    }
}
