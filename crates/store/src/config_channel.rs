use anyhow::{Context, Result};
use futures_util::StreamExt;
use mintwatch_config::CONFIG_RELOAD_CHANNEL;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::RedisStore;

/// Config hot-reload plumbing. Writers update `cfg:{section}` then publish
/// the section name on `cfg:reload`; subscribers re-fetch only the named
/// section.
#[derive(Clone)]
pub struct ConfigChannel {
    conn: ConnectionManager,
    client: redis::Client,
}

impl ConfigChannel {
    pub fn new(store: &RedisStore) -> Self {
        Self {
            conn: store.connection(),
            client: store.client(),
        }
    }

    pub async fn get_section(&self, section: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn
            .get(format!("cfg:{section}"))
            .await
            .with_context(|| format!("failed to read cfg:{section}"))?;
        Ok(payload)
    }

    pub async fn publish_section(&self, section: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set(format!("cfg:{section}"), payload)
            .await
            .with_context(|| format!("failed to write cfg:{section}"))?;
        let _: i64 = conn
            .publish(CONFIG_RELOAD_CHANNEL, section)
            .await
            .context("failed to publish config reload")?;
        Ok(())
    }

    /// Spawns the pub/sub listener; each message payload (a section name)
    /// lands on the returned channel. The task runs until the receiver is
    /// dropped or the connection dies.
    pub async fn subscribe_reloads(&self) -> Result<(mpsc::Receiver<String>, JoinHandle<()>)> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .context("failed to open config pubsub connection")?;
        pubsub
            .subscribe(CONFIG_RELOAD_CHANNEL)
            .await
            .context("failed to subscribe to config reload channel")?;
        info!(channel = CONFIG_RELOAD_CHANNEL, "config reload listener subscribed");

        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(message) = stream.next().await {
                let section: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(error) => {
                        warn!(error = %error, "ignoring malformed config reload payload");
                        continue;
                    }
                };
                if tx.send(section).await.is_err() {
                    break;
                }
            }
        });
        Ok((rx, task))
    }
}
