use std::{env, fmt, ops::Deref, sync::Arc};

use crate::error::Error;

/// Shared handle on a deadpool-backed Redis connection pool. Cloning is
/// cheap; every clone talks to the same pool. Connections are checked on
/// recycle, so a borrowed connection is known-good.
#[derive(Clone)]
pub struct RedisPool(Arc<RedisPoolInner>);

impl fmt::Debug for RedisPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisPool").finish()
    }
}

struct RedisPoolInner {
    pool: deadpool_redis::Pool,
}

impl Deref for RedisPool {
    type Target = deadpool_redis::Pool;

    fn deref(&self) -> &Self::Target {
        &self.0.pool
    }
}

impl RedisPool {
    /// Create a pool for the given connection string, falling back to the
    /// `REDIS_URL` environment variable when `connection` is `None`.
    pub fn new(connection: Option<String>, max_size: Option<usize>) -> Result<RedisPool, Error> {
        let redis_url = connection
            .or_else(|| env::var("REDIS_URL").ok())
            .ok_or_else(|| {
                Error::ConfigError(String::from("REDIS_URL is required to create a Redis pool"))
            })?;

        let mut cfg = deadpool_redis::Config::from_url(redis_url);
        if let Some(max_size) = max_size {
            cfg.pool = Some(deadpool::managed::PoolConfig::new(max_size));
        }

        let pool = cfg.create_pool()?;

        Ok(RedisPool(Arc::new(RedisPoolInner { pool })))
    }

    pub fn pool(&self) -> &deadpool_redis::Pool {
        &self.0.pool
    }
}
