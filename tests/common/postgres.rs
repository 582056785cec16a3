#![allow(dead_code)]

use docbus::config::{BackendKind, Config};
use rand::distributions::{Alphanumeric, DistString};
use tokio_postgres::{Client, NoTls};

/// A scratch PostgreSQL database for one test, carved out of the server named
/// by `DOCBUS_TEST_POSTGRES_URL` and removed again when dropped.
pub struct TestDb {
    admin_url: String,
    pub name: String,
    pub url: String,
}

async fn admin(url: &str) -> Option<Client> {
    let (client, conn) = tokio_postgres::connect(url, NoTls).await.ok()?;
    tokio::spawn(conn);
    Some(client)
}

impl TestDb {
    /// `None` when the variable is unset or the server refuses the database.
    pub async fn create() -> Option<Self> {
        let admin_url = std::env::var("DOCBUS_TEST_POSTGRES_URL").ok()?;
        let name = format!("docbus_it_{}", Alphanumeric.sample_string(&mut rand::thread_rng(), 10).to_lowercase());
        admin(&admin_url)
            .await?
            .batch_execute(&format!("CREATE DATABASE {name}"))
            .await
            .ok()?;
        let url = with_database(&admin_url, &name);
        Some(Self { admin_url, name, url })
    }

    /// Server config on an ephemeral port with the PostgreSQL engine pointed here.
    pub fn config(&self, address: &str) -> Config {
        let mut cfg = Config::default();
        cfg.listen_addr = "127.0.0.1:0".into();
        cfg.address = address.into();
        cfg.backend.kind = BackendKind::Postgres;
        cfg.backend.url = Some(self.url.clone());
        cfg.backend.db_name = "it".into();
        cfg.backend.pool_size = 4;
        cfg.backend.pool_wait_timeout_ms = 2_000;
        cfg
    }
}

impl Drop for TestDb {
    fn drop(&mut self) {
        let admin_url = self.admin_url.clone();
        let name = self.name.clone();
        // The test runtime may be shutting down; use a private one.
        let _ = std::thread::spawn(move || {
            let Ok(rt) = tokio::runtime::Builder::new_current_thread().enable_all().build() else {
                return;
            };
            rt.block_on(async {
                if let Some(client) = admin(&admin_url).await {
                    let _ = client.batch_execute(&format!("DROP DATABASE IF EXISTS {name} WITH (FORCE)")).await;
                }
            });
        })
        .join();
    }
}

/// Swap the database segment of a `postgres://` URL, keeping any query string.
fn with_database(url: &str, db: &str) -> String {
    let (base, query) = url.split_once('?').map_or((url, None), |(b, q)| (b, Some(q)));
    let base = base.rsplit_once('/').map_or(base, |(head, _)| head);
    match query {
        Some(q) => format!("{base}/{db}?{q}"),
        None => format!("{base}/{db}"),
    }
}
