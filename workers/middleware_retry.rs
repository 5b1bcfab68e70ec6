use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use redis::AsyncCommands;
use serde_json::json;
use tracing::{event, Level};

use crate::{
    config::{Config, RETRY_KEY},
    enqueue::{duration_to_seconds_with_nano_precision, now_to_seconds_with_nano_precision},
    error::Error,
    message::Message,
    middleware::{JobResult, Middleware, Next},
};

/// Timestamp layout used for `failed_at`/`retried_at`, matching Sidekiq.
const LAYOUT: &str = "%Y-%m-%d %H:%M:%S %Z";

/// Converts eligible job failures into entries on the retry sorted set.
///
/// A converted failure is swallowed so that middleware further out sees a
/// success and the worker acknowledges the message; the failed invocation
/// lives on as the ZSET entry. Ineligible failures pass through untouched.
pub struct RetryMiddleware {
    config: Arc<Config>,
}

impl RetryMiddleware {
    pub fn new(config: Arc<Config>) -> RetryMiddleware {
        RetryMiddleware { config }
    }

    async fn schedule_retry(&self, score: f64, envelope: String) -> Result<(), Error> {
        let mut conn = self.config.pool.get().await?;
        let _: i64 = conn
            .zadd(self.config.namespaced_key(&[RETRY_KEY]), envelope, score)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Middleware for RetryMiddleware {
    async fn call(&self, queue: &str, message: &mut Message, next: Next<'_>) -> JobResult {
        let err = match next.run(queue, message).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        let max = match message.retry().max_retries() {
            Some(max) => max,
            None => return Err(err),
        };
        if message.retry_count().unwrap_or(0) >= max {
            return Err(err);
        }

        message.set("queue", json!(queue));
        message.set("error_message", json!(err.to_string()));
        let retry_count = increment_retry(message);

        let delay = duration_to_seconds_with_nano_precision(Duration::from_secs(
            seconds_to_delay(retry_count),
        ));

        // The message has been turned into a retry attempt; losing the ZADD
        // must not resurface the original error.
        if let Err(e) = self
            .schedule_retry(now_to_seconds_with_nano_precision() + delay, message.to_json())
            .await
        {
            event!(Level::ERROR, error=%e, jid=%message.jid().unwrap_or(""), "failed to add job to retry queue");
        }

        Ok(())
    }
}

/// Stamp the failure time fields and bump `retry_count`, returning the new
/// count. The first failure sets `failed_at` and a count of zero; later
/// failures set `retried_at` and increment.
fn increment_retry(message: &mut Message) -> i64 {
    let now = Utc::now().format(LAYOUT).to_string();

    let retry_count = match message.retry_count() {
        None => {
            message.set("failed_at", json!(now));
            0
        }
        Some(count) => {
            message.set("retried_at", json!(now));
            count + 1
        }
    };

    message.set("retry_count", json!(retry_count));
    retry_count
}

/// `count^4 + 15 + rand(0,29) * (count + 1)` seconds, Sidekiq's backoff.
fn seconds_to_delay(count: i64) -> u64 {
    let power = (count as f64).powi(4) as u64;
    power + 15 + rand::thread_rng().gen_range(0..30) * (count as u64 + 1)
}
