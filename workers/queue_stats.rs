use redis::AsyncCommands;
use serde::Serialize;

use crate::{
    config::{Config, RETRY_KEY},
    error::Error,
};

#[derive(Debug, Serialize)]
pub struct QueueStats {
    pub retry_depth: usize,
    pub queues: Vec<QueueDepth>,
}

#[derive(Debug, Serialize)]
pub struct QueueDepth {
    pub name: String,
    pub in_progress: usize,
    pub queued: usize,
}

/// Depth of the retry set plus, for every known queue, how many envelopes
/// are pending and how many this process currently holds in progress.
pub(crate) async fn queue_stats(config: &Config) -> Result<QueueStats, Error> {
    let mut conn = config.pool.get().await?;

    let mut queue_names: Vec<String> = conn.smembers(config.namespaced_key(&["queues"])).await?;
    queue_names.sort();

    let mut pipe = redis::Pipeline::with_capacity(1 + queue_names.len() * 2);
    pipe.cmd("ZCARD").arg(config.namespaced_key(&[RETRY_KEY]));
    for name in &queue_names {
        let queue_key = config.namespaced_key(&["queue", name]);
        pipe.cmd("LLEN").arg(&queue_key);
        pipe.cmd("LLEN")
            .arg(format!("{}:{}:inprogress", queue_key, config.process_id));
    }

    let counts: Vec<usize> = pipe.query_async(&mut conn).await?;

    let retry_depth = counts.get(0).copied().unwrap_or(0);
    let queues = queue_names
        .into_iter()
        .enumerate()
        .map(|(i, name)| QueueDepth {
            name,
            queued: counts.get(1 + i * 2).copied().unwrap_or(0),
            in_progress: counts.get(2 + i * 2).copied().unwrap_or(0),
        })
        .collect();

    Ok(QueueStats {
        retry_depth,
        queues,
    })
}

#[cfg(all(test, feature = "test_redis"))]
mod redis_tests {
    use super::*;
    use crate::{enqueue::enqueue, test_support::run_redis_test};

    #[tokio::test]
    async fn reports_depths_for_known_queues() {
        run_redis_test(|config| async move {
            enqueue(&config, "stats1", "Add", vec![1]).await?;
            enqueue(&config, "stats1", "Add", vec![2]).await?;
            enqueue(&config, "stats2", "Add", vec![3]).await?;

            let stats = queue_stats(&config).await?;

            assert_eq!(stats.retry_depth, 0);
            assert_eq!(stats.queues.len(), 2);
            assert_eq!(stats.queues[0].name, "stats1");
            assert_eq!(stats.queues[0].queued, 2);
            assert_eq!(stats.queues[0].in_progress, 0);
            assert_eq!(stats.queues[1].name, "stats2");
            assert_eq!(stats.queues[1].queued, 1);

            Ok::<(), Error>(())
        })
        .await;
    }
}
