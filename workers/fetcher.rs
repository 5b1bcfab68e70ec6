use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use conveyor_database::RedisPool;
use redis::AsyncCommands;
use tokio::sync::{mpsc, watch};
use tracing::{event, Level};

use crate::{error::Error, message::Message};

/// The manager-side endpoints a fetcher delivers into and listens on.
///
/// `ready` carries one ticket per worker that can take a message right now;
/// the fetcher only touches Redis while it holds at least one unspent
/// ticket. `finished` is a best-effort nudge that cuts an error pause short.
pub struct FetcherChannels {
    pub messages: mpsc::Sender<Message>,
    pub ready: mpsc::Receiver<()>,
    pub finished: mpsc::Receiver<()>,
}

/// Constructor capability for fetchers, injected into managers. The default
/// builds [`RedisFetcher`]; tests substitute in-memory implementations.
pub type FetcherFactory = Arc<dyn Fn(String, FetcherChannels) -> Arc<dyn Fetcher> + Send + Sync>;

/// Moves envelopes from one queue to this process's inprogress list and
/// hands them to the manager, with at-least-once semantics per process.
#[async_trait]
pub trait Fetcher: Send + Sync {
    fn queue(&self) -> &str;
    fn inprogress_queue(&self) -> &str;

    /// Run the fetch loop until [`Fetcher::close`] is called. Replays the
    /// inprogress list before fetching anything new.
    async fn fetch(&self);

    /// Forget a delivered message. Calls after `close` are silently dropped.
    async fn acknowledge(&self, message: &Message) -> Result<(), Error>;

    /// Ask the fetch loop to stop and wait until it has. Idempotent.
    async fn close(&self);

    fn closed(&self) -> bool;
}

struct FetchEndpoints {
    ready: mpsc::Receiver<()>,
    finished: mpsc::Receiver<()>,
}

pub struct RedisFetcher {
    pool: RedisPool,
    queue: String,
    inprogress_queue: String,
    messages: mpsc::Sender<Message>,
    endpoints: Mutex<Option<FetchEndpoints>>,
    stop: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    closed: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

impl RedisFetcher {
    pub fn new(
        pool: RedisPool,
        process_id: &str,
        queue: String,
        channels: FetcherChannels,
    ) -> RedisFetcher {
        let (stop, stop_rx) = watch::channel(false);
        let (closed, closed_rx) = watch::channel(false);

        RedisFetcher {
            pool,
            inprogress_queue: format!("{}:{}:inprogress", queue, process_id),
            queue,
            messages: channels.messages,
            endpoints: Mutex::new(Some(FetchEndpoints {
                ready: channels.ready,
                finished: channels.finished,
            })),
            stop,
            stop_rx,
            closed,
            closed_rx,
        }
    }

    async fn inprogress_messages(&self) -> Result<Vec<String>, Error> {
        let mut conn = self.pool.get().await?;
        let messages: Vec<String> = conn.lrange(&self.inprogress_queue, 0, -1).await?;
        Ok(messages)
    }

    /// Block until a ticket is available. Returns false when stopping or
    /// when every worker has gone away.
    async fn wait_for_ready(
        &self,
        ready: &mut mpsc::Receiver<()>,
        credit: &mut usize,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> bool {
        while *credit == 0 {
            tokio::select! {
                biased;

                _ = stop_rx.changed() => return false,
                ticket = ready.recv() => match ticket {
                    Some(()) => *credit += 1,
                    None => return false,
                },
            }
        }
        true
    }

    /// Parse and deliver one raw envelope. Returns true when a worker slot
    /// was consumed. Unparseable envelopes are logged and left alone; they
    /// stay on the inprogress list rather than being acknowledged away.
    async fn send_message(&self, raw: &str, stop_rx: &mut watch::Receiver<bool>) -> bool {
        let message = match Message::from_json(raw) {
            Ok(message) => message,
            Err(e) => {
                event!(Level::ERROR, error=%e, payload=%raw, queue=%self.queue, "Couldn't create message from fetched payload");
                return false;
            }
        };

        tokio::select! {
            biased;

            _ = stop_rx.changed() => false,
            sent = self.messages.send(message) => sent.is_ok(),
        }
    }

    async fn try_fetch_message(
        &self,
        credit: &mut usize,
        finished: &mut mpsc::Receiver<()>,
        stop_rx: &mut watch::Receiver<bool>,
    ) {
        let mut conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(e) => {
                event!(Level::ERROR, error=%e, queue=%self.queue, "Error acquiring connection");
                self.pause_after_error(finished, stop_rx).await;
                return;
            }
        };

        match conn
            .brpoplpush::<_, Option<String>>(&self.queue, &self.inprogress_queue, 1)
            .await
        {
            Ok(Some(raw)) => {
                if self.send_message(&raw, stop_rx).await {
                    *credit -= 1;
                }
            }
            // Nil reply: the queue stayed empty for the whole timeout.
            Ok(None) => {}
            Err(e) => {
                event!(Level::ERROR, error=%e, queue=%self.queue, "Error fetching message");
                self.pause_after_error(finished, stop_rx).await;
            }
        }
    }

    /// Hold off for a second after a Redis error. A worker finishing, or a
    /// close request, ends the pause early.
    async fn pause_after_error(
        &self,
        finished: &mut mpsc::Receiver<()>,
        stop_rx: &mut watch::Receiver<bool>,
    ) {
        tokio::select! {
            biased;

            _ = stop_rx.changed() => {}
            _ = finished.recv() => {}
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
    }
}

#[async_trait]
impl Fetcher for RedisFetcher {
    fn queue(&self) -> &str {
        &self.queue
    }

    fn inprogress_queue(&self) -> &str {
        &self.inprogress_queue
    }

    async fn fetch(&self) {
        let endpoints = self.endpoints.lock().unwrap().take();
        let FetchEndpoints {
            mut ready,
            mut finished,
        } = match endpoints {
            Some(endpoints) => endpoints,
            None => return,
        };

        let mut stop_rx = self.stop_rx.clone();
        let mut credit = 0usize;

        // Anything still on the inprogress list was fetched by a previous
        // incarnation of this process id and never acknowledged. Deliver it
        // again before touching the queue itself.
        match self.inprogress_messages().await {
            Ok(old_messages) => {
                for raw in &old_messages {
                    if !self
                        .wait_for_ready(&mut ready, &mut credit, &mut stop_rx)
                        .await
                    {
                        break;
                    }
                    if self.send_message(raw, &mut stop_rx).await {
                        credit -= 1;
                    }
                }
            }
            Err(e) => {
                event!(Level::ERROR, error=%e, queue=%self.queue, "Error reading inprogress messages");
            }
        }

        while !*stop_rx.borrow() {
            if !self
                .wait_for_ready(&mut ready, &mut credit, &mut stop_rx)
                .await
            {
                break;
            }
            self.try_fetch_message(&mut credit, &mut finished, &mut stop_rx)
                .await;
        }

        let _ = self.closed.send(true);
    }

    async fn acknowledge(&self, message: &Message) -> Result<(), Error> {
        if self.closed() {
            return Ok(());
        }

        let mut conn = self.pool.get().await?;
        // -1 removes a single occurrence, scanning from the tail, even if
        // the same envelope bytes appear more than once.
        let _: i64 = conn
            .lrem(&self.inprogress_queue, -1, message.original_json())
            .await?;
        Ok(())
    }

    async fn close(&self) {
        if self.closed() {
            return;
        }

        let _ = self.stop.send(true);

        let mut closed_rx = self.closed_rx.clone();
        while !*closed_rx.borrow() {
            if closed_rx.changed().await.is_err() {
                break;
            }
        }
    }

    fn closed(&self) -> bool {
        *self.closed_rx.borrow()
    }
}

#[cfg(all(test, feature = "test_redis"))]
mod redis_tests {
    use super::*;
    use crate::test_support::run_redis_test;
    use std::time::Duration;
    use tokio::time::timeout;

    struct Harness {
        fetcher: Arc<RedisFetcher>,
        fetch_task: tokio::task::JoinHandle<()>,
        messages: mpsc::Receiver<Message>,
        ready: mpsc::Sender<()>,
        _finished: mpsc::Sender<()>,
    }

    fn start_fetcher(config: &Arc<crate::config::Config>, queue: &str) -> Harness {
        let (messages_tx, messages_rx) = mpsc::channel(1);
        let (ready_tx, ready_rx) = mpsc::channel(1);
        let (finished_tx, finished_rx) = mpsc::channel(1);

        let fetcher = Arc::new(RedisFetcher::new(
            config.pool.clone(),
            "1",
            config.namespaced_key(&["queue", queue]),
            FetcherChannels {
                messages: messages_tx,
                ready: ready_rx,
                finished: finished_rx,
            },
        ));

        let fetch_task = {
            let fetcher = fetcher.clone();
            tokio::spawn(async move { fetcher.fetch().await })
        };

        Harness {
            fetcher,
            fetch_task,
            messages: messages_rx,
            ready: ready_tx,
            _finished: finished_tx,
        }
    }

    #[tokio::test]
    async fn delivers_newly_queued_messages() {
        run_redis_test(|config| async move {
            let envelope = r#"{"jid":"fetchme","class":"Add","args":[]}"#;
            let queue_key = config.namespaced_key(&["queue", "fetch1"]);

            let mut conn = config.pool.get().await?;
            let _: i64 = conn.rpush(&queue_key, envelope).await?;

            let mut harness = start_fetcher(&config, "fetch1");
            harness.ready.send(()).await.unwrap();

            let message = timeout(Duration::from_secs(5), harness.messages.recv())
                .await
                .expect("timed out waiting for message")
                .expect("messages channel closed");
            assert_eq!(message.original_json(), envelope);

            // The envelope has moved from the queue to the inprogress list.
            let queued: i64 = conn.llen(&queue_key).await?;
            assert_eq!(queued, 0);
            let inprogress: i64 = conn.llen(harness.fetcher.inprogress_queue()).await?;
            assert_eq!(inprogress, 1);

            harness.fetcher.acknowledge(&message).await?;
            let inprogress: i64 = conn.llen(harness.fetcher.inprogress_queue()).await?;
            assert_eq!(inprogress, 0);

            harness.fetcher.close().await;
            harness.fetch_task.await.unwrap();

            Ok::<(), Error>(())
        })
        .await;
    }

    #[tokio::test]
    async fn replays_inprogress_messages_on_startup() {
        run_redis_test(|config| async move {
            let envelope = r#"{"jid":"replayme","class":"Add","args":[]}"#;
            let inprogress_key = format!("{}:1:inprogress", config.namespaced_key(&["queue", "fetch2"]));

            let mut conn = config.pool.get().await?;
            let _: i64 = conn.rpush(&inprogress_key, envelope).await?;

            let mut harness = start_fetcher(&config, "fetch2");
            harness.ready.send(()).await.unwrap();

            let message = timeout(Duration::from_secs(5), harness.messages.recv())
                .await
                .expect("timed out waiting for replay")
                .expect("messages channel closed");
            assert_eq!(message.original_json(), envelope);

            // Replay delivers without acknowledging; the entry survives
            // until the job completes.
            let inprogress: i64 = conn.llen(&inprogress_key).await?;
            assert_eq!(inprogress, 1);

            harness.fetcher.close().await;
            harness.fetch_task.await.unwrap();

            Ok::<(), Error>(())
        })
        .await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_drops_late_acks() {
        run_redis_test(|config| async move {
            let envelope = r#"{"jid":"lateack","class":"Add","args":[]}"#;
            let inprogress_key = format!("{}:1:inprogress", config.namespaced_key(&["queue", "fetch3"]));

            let mut conn = config.pool.get().await?;
            let _: i64 = conn.rpush(&inprogress_key, envelope).await?;

            let mut harness = start_fetcher(&config, "fetch3");
            harness.ready.send(()).await.unwrap();
            let message = timeout(Duration::from_secs(5), harness.messages.recv())
                .await
                .unwrap()
                .unwrap();

            harness.fetcher.close().await;
            harness.fetcher.close().await;
            assert!(harness.fetcher.closed());
            harness.fetch_task.await.unwrap();

            // An acknowledgement after close is dropped, so the entry stays.
            harness.fetcher.acknowledge(&message).await?;
            let inprogress: i64 = conn.llen(&inprogress_key).await?;
            assert_eq!(inprogress, 1);

            Ok::<(), Error>(())
        })
        .await;
    }
}
