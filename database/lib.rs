mod error;
pub mod redis;

pub use self::redis::RedisPool;
pub use error::Error;
