use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid worker configuration: {0}")]
    Configuration(&'static str),

    #[error("Cannot reset worker managers while workers are running")]
    WorkersRunning,

    #[error("Redis error {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("Redis connection error {0}")]
    RedisPoolError(#[from] deadpool::managed::PoolError<::redis::RedisError>),

    #[error(transparent)]
    DatabaseError(#[from] conveyor_database::Error),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),
}
