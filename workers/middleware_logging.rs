use std::time::Instant;

use async_trait::async_trait;
use tracing::{event, Level};

use crate::{
    message::Message,
    middleware::{JobResult, Middleware, Next},
};

/// Emits start/done events around every job, with the elapsed time.
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn call(&self, queue: &str, message: &mut Message, next: Next<'_>) -> JobResult {
        let jid = message.jid().unwrap_or("").to_string();

        event!(Level::INFO, queue=%queue, jid=%jid, args=?message.args(), "job start");
        let start = Instant::now();

        let result = next.run(queue, message).await;

        match &result {
            Ok(()) => {
                event!(Level::INFO, queue=%queue, jid=%jid, elapsed=?start.elapsed(), "job done")
            }
            Err(e) => {
                event!(Level::ERROR, queue=%queue, jid=%jid, elapsed=?start.elapsed(), error=%e, "job fail")
            }
        }

        result
    }
}
