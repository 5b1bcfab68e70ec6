pub mod config;
mod enqueue;
mod error;
mod fetcher;
mod manager;
mod message;
mod middleware;
mod middleware_logging;
mod middleware_retry;
mod middleware_stats;
mod queue_stats;
mod scheduled;
#[cfg(all(test, feature = "test_redis"))]
pub(crate) mod test_support;
mod worker;

pub use self::{
    config::{Config, WorkersConfig, DEFAULT_POLL_INTERVAL, RETRY_KEY, SCHEDULED_JOBS_KEY},
    enqueue::{EnqueueData, EnqueueOptions},
    error::Error,
    fetcher::{Fetcher, FetcherChannels, FetcherFactory, RedisFetcher},
    message::{Message, RetryPolicy, DEFAULT_MAX_RETRY},
    middleware::{JobHandler, JobResult, Middleware, Middlewares, Next},
    middleware_logging::LoggingMiddleware,
    middleware_retry::RetryMiddleware,
    middleware_stats::StatsMiddleware,
    queue_stats::{QueueDepth, QueueStats},
};
pub use conveyor_database::RedisPool;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{event, Level};

use crate::{manager::Manager, scheduled::Scheduled};

type Hook = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct WorkersState {
    managers: HashMap<String, Arc<Manager>>,
    schedule: Option<Scheduled>,
    started: bool,
    before_start: Vec<Hook>,
    during_drain: Vec<Hook>,
}

/// The process-wide coordinator: one manager per registered queue, one
/// scheduled-set poller, and the lifecycle that ties them together.
///
/// The interior mutex guards registration and lifecycle transitions only;
/// it is never held across Redis I/O.
pub struct Workers {
    config: Arc<Config>,
    global_middlewares: Mutex<Middlewares>,
    state: Mutex<WorkersState>,
}

fn default_middlewares(config: &Arc<Config>) -> Middlewares {
    Middlewares::new(vec![
        Arc::new(LoggingMiddleware) as Arc<dyn Middleware>,
        Arc::new(RetryMiddleware::new(config.clone())),
        Arc::new(StatsMiddleware::new(config.clone())),
    ])
}

fn run_hooks(hooks: &[Hook]) {
    for hook in hooks {
        hook();
    }
}

impl Workers {
    pub fn new(config: Config) -> Workers {
        let config = Arc::new(config);
        let global_middlewares = Mutex::new(default_middlewares(&config));

        Workers {
            config,
            global_middlewares,
            state: Mutex::new(WorkersState::default()),
        }
    }

    /// Register `concurrency` workers for `queue`. Replaces any existing
    /// registration for the same queue; takes effect at the next `start`.
    pub fn process<H: JobHandler + 'static>(&self, queue: &str, job: H, concurrency: usize) {
        self.process_with_middleware(queue, job, concurrency, Vec::new())
    }

    /// Like [`Workers::process`], appending extra middleware to this
    /// queue's private copy of the global chain.
    pub fn process_with_middleware<H: JobHandler + 'static>(
        &self,
        queue: &str,
        job: H,
        concurrency: usize,
        mids: Vec<Arc<dyn Middleware>>,
    ) {
        let global = self.global_middlewares.lock().unwrap().clone();
        let manager = Manager::new(
            &self.config,
            queue,
            Arc::new(job),
            concurrency,
            mids,
            &global,
            None,
        );

        self.state
            .lock()
            .unwrap()
            .managers
            .insert(queue.to_string(), Arc::new(manager));
    }

    /// Extend the global chain. Affects managers registered afterwards.
    pub fn append_middleware(&self, action: Arc<dyn Middleware>) {
        self.global_middlewares.lock().unwrap().append(action);
    }

    pub fn before_start<F: Fn() + Send + Sync + 'static>(&self, hook: F) {
        self.state.lock().unwrap().before_start.push(Box::new(hook));
    }

    pub fn during_drain<F: Fn() + Send + Sync + 'static>(&self, hook: F) {
        self.state.lock().unwrap().during_drain.push(Box::new(hook));
    }

    /// Start the scheduled poller and every registered manager. Does
    /// nothing when already started.
    pub fn start(&self) {
        let mut state = self.state.lock().unwrap();
        if state.started {
            return;
        }

        run_hooks(&state.before_start);

        let schedule = Scheduled::new(
            self.config.clone(),
            vec![RETRY_KEY.to_string(), SCHEDULED_JOBS_KEY.to_string()],
        );
        schedule.start();
        state.schedule = Some(schedule);

        for manager in state.managers.values() {
            manager.start();
        }

        state.started = true;
    }

    /// Drain and stop everything. Waits for in-flight jobs; does nothing
    /// when not started.
    pub async fn quit(&self) {
        let (managers, schedule) = {
            let mut state = self.state.lock().unwrap();
            if !state.started {
                return;
            }
            state.started = false;
            let managers: Vec<_> = state.managers.values().cloned().collect();
            let schedule = state.schedule.take();
            (managers, schedule)
        };

        let quit_tasks: Vec<JoinHandle<()>> = managers
            .into_iter()
            .map(|manager| tokio::spawn(async move { manager.quit().await }))
            .collect();

        let schedule_task = schedule.and_then(|schedule| schedule.quit());

        {
            let state = self.state.lock().unwrap();
            run_hooks(&state.during_drain);
        }

        for task in quit_tasks {
            if let Err(e) = task.await {
                event!(Level::ERROR, error=%e, "manager quit task panicked");
            }
        }
        if let Some(task) = schedule_task {
            if let Err(e) = task.await {
                event!(Level::ERROR, error=%e, "scheduled poller task panicked");
            }
        }
    }

    /// Start, wait for an interrupt, then drain.
    pub async fn run(&self) {
        self.start();

        match tokio::signal::ctrl_c().await {
            Ok(()) => event!(Level::INFO, "Received interrupt, shutting down"),
            Err(e) => event!(Level::ERROR, error=%e, "Failed to listen for interrupt"),
        }

        self.quit().await;
    }

    /// Clear the manager registrations. Fails while running.
    pub fn reset_managers(&self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.started {
            return Err(Error::WorkersRunning);
        }
        state.managers.clear();
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), Error> {
        let mut conn = self.config.pool.get().await?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn queue_stats(&self) -> Result<QueueStats, Error> {
        queue_stats::queue_stats(&self.config).await
    }

    pub async fn enqueue<A: Serialize>(
        &self,
        queue: &str,
        class: &str,
        args: A,
    ) -> Result<String, Error> {
        enqueue::enqueue(&self.config, queue, class, args).await
    }

    pub async fn enqueue_in<A: Serialize>(
        &self,
        queue: &str,
        class: &str,
        delay_seconds: f64,
        args: A,
    ) -> Result<String, Error> {
        enqueue::enqueue_in(&self.config, queue, class, delay_seconds, args).await
    }

    pub async fn enqueue_at<A: Serialize>(
        &self,
        queue: &str,
        class: &str,
        at: DateTime<Utc>,
        args: A,
    ) -> Result<String, Error> {
        enqueue::enqueue_at(&self.config, queue, class, at, args).await
    }

    pub async fn enqueue_with_options<A: Serialize>(
        &self,
        queue: &str,
        class: &str,
        args: A,
        options: EnqueueOptions,
    ) -> Result<String, Error> {
        enqueue::enqueue_with_options(&self.config, queue, class, args, options).await
    }

    pub fn namespace(&self) -> &str {
        self.config.namespace()
    }

    pub fn namespaced_key(&self, parts: &[&str]) -> String {
        self.config.namespaced_key(parts)
    }

    pub fn trim_key_namespace<'a>(&self, key: &'a str) -> &'a str {
        self.config.trim_key_namespace(key)
    }
}
