mod config_channel;
mod counters;
mod dedup;
mod sink;
mod stream;
mod tokens;

pub use self::config_channel::ConfigChannel;
pub use self::counters::{CounterStore, Window};
pub use self::dedup::DedupFilter;
pub use self::sink::AppendSink;
pub use self::stream::{decode_record, encode_record, DurableStream, StreamRecord};
pub use self::tokens::TokenKeys;

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::Client;
use tracing::info;

/// Shared Redis handle. `ConnectionManager` multiplexes and reconnects, so
/// every component clones this cheaply; the raw `Client` is kept only for
/// pub/sub connections.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    client: Client,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).context("failed to create counter store client")?;
        let connection = ConnectionManager::new(client.clone())
            .await
            .context("failed to establish counter store connection")?;
        info!("counter store connected");
        Ok(Self { connection, client })
    }

    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }
}
