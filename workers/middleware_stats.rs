use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{event, Level};

use crate::{
    config::Config,
    error::Error,
    message::Message,
    middleware::{JobResult, Middleware, Next},
};

/// Counts processed and failed jobs, globally and per UTC day. Counter
/// writes never affect the job outcome; failures to record are only logged.
pub struct StatsMiddleware {
    config: Arc<Config>,
}

impl StatsMiddleware {
    pub fn new(config: Arc<Config>) -> StatsMiddleware {
        StatsMiddleware { config }
    }

    async fn increment(&self, metric: &str) {
        if let Err(e) = self.try_increment(metric).await {
            event!(Level::ERROR, error=%e, metric=%metric, "couldn't save stats");
        }
    }

    async fn try_increment(&self, metric: &str) -> Result<(), Error> {
        let today = Utc::now().format("%Y-%m-%d").to_string();

        let mut conn = self.config.pool.get().await?;
        redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(self.config.namespaced_key(&["stat", metric]))
            .cmd("INCR")
            .arg(self.config.namespaced_key(&["stat", metric, &today]))
            .query_async::<_, ()>(&mut conn)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl Middleware for StatsMiddleware {
    async fn call(&self, queue: &str, message: &mut Message, next: Next<'_>) -> JobResult {
        let result = next.run(queue, message).await;

        if result.is_err() {
            self.increment("failed").await;
        }
        self.increment("processed").await;

        result
    }
}

#[cfg(all(test, feature = "test_redis"))]
mod redis_tests {
    use super::*;
    use crate::{
        middleware::{JobHandler, Middlewares},
        test_support::run_redis_test,
    };
    use anyhow::anyhow;
    use redis::AsyncCommands;

    struct OkJob;

    #[async_trait]
    impl JobHandler for OkJob {
        async fn perform(&self, _message: &Message) -> JobResult {
            Ok(())
        }
    }

    struct FailingJob;

    #[async_trait]
    impl JobHandler for FailingJob {
        async fn perform(&self, _message: &Message) -> JobResult {
            Err(anyhow!("AHHHH"))
        }
    }

    async fn counter(config: &Arc<Config>, parts: &[&str]) -> Result<i64, Error> {
        let mut conn = config.pool.get().await?;
        let value: Option<i64> = conn.get(config.namespaced_key(parts)).await?;
        Ok(value.unwrap_or(0))
    }

    #[tokio::test]
    async fn counts_processed_jobs() {
        run_redis_test(|config| async move {
            let chain = Middlewares::new(vec![
                Arc::new(StatsMiddleware::new(config.clone())) as Arc<dyn Middleware>
            ]);
            let today = Utc::now().format("%Y-%m-%d").to_string();

            let mut message = Message::from_json(r#"{"jid":"1"}"#).unwrap();
            chain.call("myqueue", &mut message, &OkJob).await.unwrap();
            chain.call("myqueue", &mut message, &OkJob).await.unwrap();

            assert_eq!(counter(&config, &["stat", "processed"]).await?, 2);
            assert_eq!(counter(&config, &["stat", "processed", &today]).await?, 2);
            assert_eq!(counter(&config, &["stat", "failed"]).await?, 0);

            Ok::<(), Error>(())
        })
        .await;
    }

    #[tokio::test]
    async fn counts_failed_jobs_and_propagates_the_error() {
        run_redis_test(|config| async move {
            let chain = Middlewares::new(vec![
                Arc::new(StatsMiddleware::new(config.clone())) as Arc<dyn Middleware>
            ]);
            let today = Utc::now().format("%Y-%m-%d").to_string();

            let mut message = Message::from_json(r#"{"jid":"1"}"#).unwrap();
            let result = chain.call("myqueue", &mut message, &FailingJob).await;
            assert!(result.is_err());

            assert_eq!(counter(&config, &["stat", "failed"]).await?, 1);
            assert_eq!(counter(&config, &["stat", "failed", &today]).await?, 1);
            // Failed jobs still count as processed.
            assert_eq!(counter(&config, &["stat", "processed"]).await?, 1);

            Ok::<(), Error>(())
        })
        .await;
    }
}
