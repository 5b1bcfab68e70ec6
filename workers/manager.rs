use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tracing::{event, Level};

use crate::{
    config::Config,
    fetcher::{Fetcher, FetcherChannels, FetcherFactory},
    message::Message,
    middleware::{JobHandler, Middleware, Middlewares},
    worker::{spawn_worker, WorkerContext, WorkerState},
};

/// Owns everything involved in consuming one queue: the fetcher, a fixed
/// pool of workers, and this queue's private middleware chain.
pub(crate) struct Manager {
    queue: String,
    concurrency: usize,
    job: Arc<dyn JobHandler>,
    chain: Arc<Middlewares>,
    fetcher_factory: FetcherFactory,
    state: Mutex<Option<RunningState>>,
    workers: Mutex<Vec<Arc<WorkerState>>>,
}

struct RunningState {
    fetcher: Arc<dyn Fetcher>,
    stop: watch::Sender<bool>,
    supervisor: JoinHandle<()>,
    worker_handles: Vec<JoinHandle<()>>,
}

impl Manager {
    pub fn new(
        config: &Arc<Config>,
        queue: &str,
        job: Arc<dyn JobHandler>,
        concurrency: usize,
        mids: Vec<Arc<dyn Middleware>>,
        global: &Middlewares,
        fetcher_factory: Option<FetcherFactory>,
    ) -> Manager {
        Manager {
            queue: config.namespaced_key(&["queue", queue]),
            concurrency: concurrency.max(1),
            job,
            chain: Arc::new(global.append_to_copy(mids)),
            fetcher_factory: fetcher_factory.unwrap_or_else(|| config.fetcher_factory()),
            state: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// The name middleware sees: the namespaced queue key without the
    /// `queue:` segment, e.g. `prod:myqueue`.
    pub fn queue_name(&self) -> String {
        self.queue.replacen("queue:", "", 1)
    }

    pub fn processing(&self) -> usize {
        self.workers
            .lock()
            .unwrap()
            .iter()
            .filter(|worker| worker.is_processing())
            .count()
    }

    pub fn start(&self) {
        let mut state = self.state.lock().unwrap();
        if state.is_some() {
            return;
        }

        event!(
            Level::INFO,
            queue = %self.queue_name(),
            concurrency = %self.concurrency,
            "processing queue"
        );

        let (messages_tx, messages_rx) = mpsc::channel(self.concurrency);
        let (ready_tx, ready_rx) = mpsc::channel(self.concurrency);
        let (finished_tx, finished_rx) = mpsc::channel(self.concurrency);
        let (confirm_tx, confirm_rx) = mpsc::channel(self.concurrency);
        let (stop_tx, stop_rx) = watch::channel(false);

        let fetcher = (self.fetcher_factory)(
            self.queue.clone(),
            FetcherChannels {
                messages: messages_tx,
                ready: ready_rx,
                finished: finished_rx,
            },
        );

        let messages_rx = Arc::new(TokioMutex::new(messages_rx));
        let mut worker_states = Vec::with_capacity(self.concurrency);
        let mut worker_handles = Vec::with_capacity(self.concurrency);
        for _ in 0..self.concurrency {
            let state = Arc::new(WorkerState::new());
            worker_handles.push(spawn_worker(
                state.clone(),
                WorkerContext {
                    messages: messages_rx.clone(),
                    ready: ready_tx.clone(),
                    finished: finished_tx.clone(),
                    confirm: confirm_tx.clone(),
                    chain: self.chain.clone(),
                    job: self.job.clone(),
                    queue: self.queue_name(),
                    stop: stop_rx.clone(),
                },
            ));
            worker_states.push(state);
        }
        *self.workers.lock().unwrap() = worker_states;

        // The workers hold the only senders now, so the supervisor's ack
        // loop ends exactly when the last worker exits.
        drop(ready_tx);
        drop(finished_tx);
        drop(confirm_tx);

        let supervisor = spawn_supervisor(fetcher.clone(), confirm_rx);

        *state = Some(RunningState {
            fetcher,
            stop: stop_tx,
            supervisor,
            worker_handles,
        });
    }

    /// Stop intake, drain the workers, and tear the supervisor down. In-
    /// flight jobs run to completion; the next `start` builds a fresh
    /// fetcher from the factory.
    pub async fn quit(&self) {
        let state = self.state.lock().unwrap().take();
        let state = match state {
            Some(state) => state,
            None => return,
        };

        event!(
            Level::INFO,
            queue = %self.queue_name(),
            busy = %self.processing(),
            workers = %self.concurrency,
            "quitting queue"
        );

        state.fetcher.close().await;

        let _ = state.stop.send(true);
        for handle in state.worker_handles {
            if let Err(e) = handle.await {
                event!(Level::ERROR, error=%e, queue=%self.queue_name(), "worker task panicked");
            }
        }

        if let Err(e) = state.supervisor.await {
            event!(Level::ERROR, error=%e, queue=%self.queue_name(), "supervisor task panicked");
        }

        self.workers.lock().unwrap().clear();
    }
}

/// Runs the fetcher and forwards every confirmation to it. This task is the
/// confirm channel's only consumer and the only caller of `acknowledge`.
fn spawn_supervisor(
    fetcher: Arc<dyn Fetcher>,
    mut confirm: mpsc::Receiver<Message>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let fetch = fetcher.fetch();
        let acks = async {
            while let Some(message) = confirm.recv().await {
                if let Err(e) = fetcher.acknowledge(&message).await {
                    event!(
                        Level::ERROR,
                        error = %e,
                        queue = %fetcher.queue(),
                        "failed to acknowledge message"
                    );
                }
            }
        };
        let _ = tokio::join!(fetch, acks);
    })
}
