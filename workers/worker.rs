use std::panic::AssertUnwindSafe;
use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{event, Level};

use crate::{
    message::Message,
    middleware::{JobHandler, Middlewares},
};

/// Shared busy flag for one worker, readable while the worker runs.
pub(crate) struct WorkerState {
    started_at: AtomicI64,
}

impl WorkerState {
    pub fn new() -> WorkerState {
        WorkerState {
            started_at: AtomicI64::new(0),
        }
    }

    pub fn is_processing(&self) -> bool {
        self.started_at.load(Ordering::SeqCst) > 0
    }
}

/// Everything one worker needs. Workers hold no reference back to their
/// manager; the channels and chain are all they see.
pub(crate) struct WorkerContext {
    pub messages: Arc<Mutex<mpsc::Receiver<Message>>>,
    pub ready: mpsc::Sender<()>,
    pub finished: mpsc::Sender<()>,
    pub confirm: mpsc::Sender<Message>,
    pub chain: Arc<Middlewares>,
    pub job: Arc<dyn JobHandler>,
    pub queue: String,
    pub stop: watch::Receiver<bool>,
}

pub(crate) fn spawn_worker(state: Arc<WorkerState>, mut ctx: WorkerContext) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            // Tell the fetcher a slot is free, unless we're stopping.
            tokio::select! {
                biased;

                _ = ctx.stop.changed() => break,
                sent = ctx.ready.send(()) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }

            // The receiver is shared with sibling workers; whichever worker
            // grabs the lock first takes the next message.
            let message = {
                let mut messages = ctx.messages.lock().await;
                tokio::select! {
                    biased;

                    _ = ctx.stop.changed() => None,
                    message = messages.recv() => message,
                }
            };
            let mut message = match message {
                Some(message) => message,
                None => break,
            };

            state.started_at.store(Utc::now().timestamp(), Ordering::SeqCst);

            if process(&ctx, &mut message).await {
                let _ = ctx.confirm.send(message).await;
            }

            state.started_at.store(0, Ordering::SeqCst);

            // Best-effort nudge so a fetcher sleeping off an error polls
            // again right away.
            let _ = ctx.finished.try_send(());
        }
    })
}

/// Run the chain around the job. Returns whether the message should be
/// confirmed: true on success, false on error or panic. A panicking job
/// takes down neither the worker nor its siblings, and the unconfirmed
/// message stays on the inprogress list for replay.
async fn process(ctx: &WorkerContext, message: &mut Message) -> bool {
    let invocation = ctx.chain.call(&ctx.queue, message, ctx.job.as_ref());

    match AssertUnwindSafe(invocation).catch_unwind().await {
        Ok(Ok(())) => true,
        Ok(Err(_)) => {
            // The chain already handled the failure (retry, stats, logging).
            false
        }
        Err(panic) => {
            event!(
                Level::ERROR,
                panic = %panic_message(&panic),
                queue = %ctx.queue,
                "recovered panic while processing message, discarding"
            );
            false
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
