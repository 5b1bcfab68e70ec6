use std::{future::Future, panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;

use crate::{
    config::{Config, WorkersConfig},
    enqueue::generate_jid,
};

/// Run a test against a live Redis (`REDIS_URL`, default localhost) under a
/// unique namespace, then delete every key the test left behind.
pub(crate) async fn run_redis_test<T, Fut, E>(test: T)
where
    T: FnOnce(Arc<Config>) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: std::fmt::Debug,
{
    dotenv::dotenv().ok();

    let namespace = format!("test-{}", generate_jid());
    let config = Arc::new(
        Config::configure(WorkersConfig {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            process_id: "1".to_string(),
            namespace: namespace.clone(),
            ..Default::default()
        })
        .expect("Creating config"),
    );

    let result = AssertUnwindSafe(test(config.clone())).catch_unwind().await;

    // Clean up the test keys whether or not the test passed.
    let mut conn = config
        .pool
        .get()
        .await
        .expect("Cleanup: acquiring connection");
    let keys: Vec<String> = redis::cmd("KEYS")
        .arg(format!("{}:*", namespace))
        .query_async(&mut conn)
        .await
        .expect("Cleanup: listing keys");
    if !keys.is_empty() {
        redis::cmd("DEL")
            .arg(&keys)
            .query_async::<_, ()>(&mut conn)
            .await
            .expect("Cleanup: deleting keys");
    }

    result.expect("Panicked").expect("Error");
}
