use std::sync::Arc;

use conveyor_database::RedisPool;

use crate::{
    error::Error,
    fetcher::{Fetcher, FetcherChannels, FetcherFactory, RedisFetcher},
};

pub const DEFAULT_POLL_INTERVAL: u64 = 15;

/// Sorted set holding jobs waiting on a retry backoff.
pub const RETRY_KEY: &str = "goretry";
/// Sorted set holding jobs scheduled to run in the future.
pub const SCHEDULED_JOBS_KEY: &str = "schedule";

/// Options accepted by [`Config::configure`].
#[derive(Debug, Default, Clone)]
pub struct WorkersConfig {
    pub redis_url: String,
    /// Must uniquely identify this process across the fleet. The inprogress
    /// list is keyed on it, so reusing an id resumes that id's unacked work.
    pub process_id: String,
    pub pool_size: usize,
    pub max_idle: usize,
    /// Seconds between scheduled-set polls. Defaults to 15 when zero.
    pub poll_interval: u64,
    pub namespace: String,
}

#[derive(Debug)]
pub struct Config {
    pub(crate) process_id: String,
    pub(crate) poll_interval: u64,
    pub(crate) pool: RedisPool,
    namespace: String,
    namespace_with_colon: String,
}

impl Config {
    /// Validate the options and build the Redis pool.
    pub fn configure(options: WorkersConfig) -> Result<Config, Error> {
        if options.redis_url.is_empty() {
            return Err(Error::Configuration("RedisURL is required"));
        }

        let pool_size = if options.pool_size == 0 {
            num_cpus::get() * 2
        } else {
            options.pool_size
        };
        let max_idle = if options.max_idle == 0 {
            pool_size
        } else {
            options.max_idle
        };

        let pool = RedisPool::new(
            Some(options.redis_url.clone()),
            Some(pool_size.max(max_idle)),
        )?;

        Self::with_pool(options, pool)
    }

    /// Like [`Config::configure`] but for callers that already hold a pool,
    /// in which case `redis_url` is not consulted.
    pub fn with_pool(options: WorkersConfig, pool: RedisPool) -> Result<Config, Error> {
        if options.process_id.is_empty() {
            return Err(Error::Configuration("ProcessID is required"));
        }

        let poll_interval = if options.poll_interval == 0 {
            DEFAULT_POLL_INTERVAL
        } else {
            options.poll_interval
        };

        let mut config = Config {
            process_id: options.process_id,
            poll_interval,
            pool,
            namespace: String::new(),
            namespace_with_colon: String::new(),
        };
        config.set_namespace(&options.namespace);

        Ok(config)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn set_namespace(&mut self, namespace: &str) {
        if namespace.is_empty() {
            self.namespace = String::new();
            self.namespace_with_colon = String::new();
        } else {
            self.namespace = namespace.trim_end_matches(':').to_string();
            self.namespace_with_colon = format!("{}:", self.namespace);
        }
    }

    /// Join the parts with `:` under the configured namespace prefix.
    pub fn namespaced_key(&self, parts: &[&str]) -> String {
        format!("{}{}", self.namespace_with_colon, parts.join(":"))
    }

    /// Drop the namespace prefix from a key, if present.
    pub fn trim_key_namespace<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(self.namespace_with_colon.as_str())
            .unwrap_or(key)
    }

    /// The default fetcher constructor handed to managers that were not
    /// given one explicitly: a Redis-backed fetcher over this config's pool
    /// and process id.
    pub(crate) fn fetcher_factory(&self) -> FetcherFactory {
        let pool = self.pool.clone();
        let process_id = self.process_id.clone();
        Arc::new(move |queue: String, channels: FetcherChannels| {
            Arc::new(RedisFetcher::new(
                pool.clone(),
                &process_id,
                queue,
                channels,
            )) as Arc<dyn Fetcher>
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn test_options() -> WorkersConfig {
        WorkersConfig {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            process_id: "1".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn requires_redis_url() {
        let options = WorkersConfig {
            redis_url: String::new(),
            ..test_options()
        };
        assert_matches!(Config::configure(options), Err(Error::Configuration(_)));
    }

    #[test]
    fn requires_process_id() {
        let options = WorkersConfig {
            process_id: String::new(),
            ..test_options()
        };
        assert_matches!(Config::configure(options), Err(Error::Configuration(_)));
    }

    #[test]
    fn poll_interval_defaults_to_15() {
        let config = Config::configure(test_options()).unwrap();
        assert_eq!(config.poll_interval, DEFAULT_POLL_INTERVAL);

        let config = Config::configure(WorkersConfig {
            poll_interval: 1,
            ..test_options()
        })
        .unwrap();
        assert_eq!(config.poll_interval, 1);
    }

    #[test]
    fn namespaced_key_joins_parts() {
        let mut config = Config::configure(test_options()).unwrap();

        assert_eq!(config.namespaced_key(&["a", "b"]), "a:b");

        config.set_namespace("prod");
        assert_eq!(config.namespaced_key(&["a", "b"]), "prod:a:b");
        assert_eq!(config.namespace(), "prod");
    }

    #[test]
    fn namespace_trailing_colon_is_stripped() {
        let mut config = Config::configure(test_options()).unwrap();
        config.set_namespace("prod:");

        assert_eq!(config.namespace(), "prod");
        assert_eq!(config.namespaced_key(&["queue", "q"]), "prod:queue:q");
    }

    #[test]
    fn trim_key_namespace_round_trips() {
        let mut config = Config::configure(test_options()).unwrap();

        assert_eq!(config.trim_key_namespace(&config.namespaced_key(&["k"])), "k");

        config.set_namespace("prod");
        assert_eq!(config.trim_key_namespace(&config.namespaced_key(&["k"])), "k");
        assert_eq!(config.trim_key_namespace("other:k"), "other:k");
    }
}
