use chrono::{DateTime, Utc};
use rand::RngCore;
use redis::AsyncCommands;
use serde::Serialize;
use serde_json::Value;

use crate::{
    config::{Config, SCHEDULED_JOBS_KEY},
    error::Error,
};

const NANO_SECOND_PRECISION: f64 = 1_000_000_000.0;

/// The envelope written to Redis by the enqueue entry points. Field names
/// and omission rules match the Sidekiq wire format.
#[derive(Debug, Serialize)]
pub struct EnqueueData {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub queue: String,
    pub class: String,
    pub args: Value,
    pub jid: String,
    pub enqueued_at: f64,
    #[serde(flatten)]
    pub options: EnqueueOptions,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct EnqueueOptions {
    #[serde(skip_serializing_if = "is_zero_i64")]
    pub retry_count: i64,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub retry: bool,
    #[serde(skip_serializing_if = "is_zero_f64")]
    pub at: f64,
}

fn is_zero_i64(value: &i64) -> bool {
    *value == 0
}

fn is_zero_f64(value: &f64) -> bool {
    *value == 0.0
}

/// 24 hex characters from 12 random bytes, as Sidekiq generates them.
pub(crate) fn generate_jid() -> String {
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub(crate) fn time_to_seconds_with_nano_precision(time: &DateTime<Utc>) -> f64 {
    time.timestamp_nanos() as f64 / NANO_SECOND_PRECISION
}

pub(crate) fn duration_to_seconds_with_nano_precision(duration: std::time::Duration) -> f64 {
    duration.as_nanos() as f64 / NANO_SECOND_PRECISION
}

pub(crate) fn now_to_seconds_with_nano_precision() -> f64 {
    time_to_seconds_with_nano_precision(&Utc::now())
}

pub async fn enqueue<A: Serialize>(
    config: &Config,
    queue: &str,
    class: &str,
    args: A,
) -> Result<String, Error> {
    enqueue_with_options(
        config,
        queue,
        class,
        args,
        EnqueueOptions {
            at: now_to_seconds_with_nano_precision(),
            ..Default::default()
        },
    )
    .await
}

pub async fn enqueue_in<A: Serialize>(
    config: &Config,
    queue: &str,
    class: &str,
    delay_seconds: f64,
    args: A,
) -> Result<String, Error> {
    enqueue_with_options(
        config,
        queue,
        class,
        args,
        EnqueueOptions {
            at: now_to_seconds_with_nano_precision() + delay_seconds,
            ..Default::default()
        },
    )
    .await
}

pub async fn enqueue_at<A: Serialize>(
    config: &Config,
    queue: &str,
    class: &str,
    at: DateTime<Utc>,
    args: A,
) -> Result<String, Error> {
    enqueue_with_options(
        config,
        queue,
        class,
        args,
        EnqueueOptions {
            at: time_to_seconds_with_nano_precision(&at),
            ..Default::default()
        },
    )
    .await
}

pub async fn enqueue_with_options<A: Serialize>(
    config: &Config,
    queue: &str,
    class: &str,
    args: A,
    options: EnqueueOptions,
) -> Result<String, Error> {
    let now = now_to_seconds_with_nano_precision();
    let data = EnqueueData {
        queue: queue.to_string(),
        class: class.to_string(),
        args: serde_json::to_value(args)?,
        jid: generate_jid(),
        enqueued_at: now,
        options,
    };

    let bytes = serde_json::to_string(&data)?;

    let mut conn = config.pool.get().await?;

    if now < data.options.at {
        let _: i64 = conn
            .zadd(
                config.namespaced_key(&[SCHEDULED_JOBS_KEY]),
                bytes,
                data.options.at,
            )
            .await?;
        return Ok(data.jid);
    }

    let _: i64 = conn.sadd(config.namespaced_key(&["queues"]), queue).await?;
    let _: i64 = conn
        .rpush(config.namespaced_key(&["queue", queue]), bytes)
        .await?;

    Ok(data.jid)
}
