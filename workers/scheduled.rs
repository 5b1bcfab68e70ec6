use std::sync::{Arc, Mutex};
use std::time::Duration;

use redis::AsyncCommands;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{event, Level};

use crate::{
    config::Config, enqueue::now_to_seconds_with_nano_precision, error::Error, message::Message,
};

/// Promotes due entries from the watched sorted sets (retry and schedule)
/// onto their target queues. One instance runs per process.
pub(crate) struct Scheduled {
    config: Arc<Config>,
    keys: Vec<String>,
    task: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl Scheduled {
    pub fn new(config: Arc<Config>, keys: Vec<String>) -> Scheduled {
        Scheduled {
            config,
            keys,
            task: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        let mut task = self.task.lock().unwrap();
        if task.is_some() {
            return;
        }

        event!(Level::INFO, keys = ?self.keys, "Starting scheduled job poller");

        let config = self.config.clone();
        let keys = self.keys.clone();
        let (closer_tx, mut closer_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(config.poll_interval));

            loop {
                tokio::select! {
                    biased;

                    _ = closer_rx.changed() => break,
                    _ = interval.tick() => {}
                };

                if let Err(e) = poll(&config, &keys).await {
                    event!(Level::ERROR, error=%e, "Error promoting scheduled jobs");
                }
            }
        });

        *task = Some((closer_tx, handle));
    }

    /// Stop the poller at its next suspension point. Returns the task
    /// handle so callers can wait for it to finish.
    pub fn quit(&self) -> Option<JoinHandle<()>> {
        let (closer_tx, handle) = self.task.lock().unwrap().take()?;
        let _ = closer_tx.send(true);
        Some(handle)
    }
}

/// Drain every due entry from each watched set into its target queue.
///
/// Entries are claimed one at a time: `ZREM` only succeeds for one process,
/// so two pollers racing over the same set each move a disjoint subset.
/// Promotions LPUSH to the head, ahead of freshly enqueued jobs.
pub(crate) async fn poll(config: &Config, keys: &[String]) -> Result<(), Error> {
    let mut conn = config.pool.get().await?;
    let now = now_to_seconds_with_nano_precision();

    for key in keys {
        let key = config.namespaced_key(&[key]);

        loop {
            let due: Vec<String> = conn
                .zrangebyscore_limit(&key, "-inf", now, 0, 1)
                .await?;
            let raw = match due.first() {
                Some(raw) => raw,
                None => break,
            };

            let removed: i64 = conn.zrem(&key, raw).await?;
            if removed == 0 {
                // Another process claimed this entry.
                continue;
            }

            let mut message = match Message::from_json(raw) {
                Ok(message) => message,
                Err(e) => {
                    event!(Level::ERROR, error=%e, payload=%raw, "Dropping unparseable scheduled entry");
                    continue;
                }
            };

            let queue = message.queue().unwrap_or("").to_string();
            let queue = config.trim_key_namespace(&queue).to_string();
            message.set("enqueued_at", json!(now_to_seconds_with_nano_precision()));

            let _: i64 = conn
                .lpush(config.namespaced_key(&["queue", &queue]), message.to_json())
                .await?;
        }
    }

    Ok(())
}
