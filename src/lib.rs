pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod in_memory;
pub mod rate_limiter;
pub mod redis_backend;
pub mod token_bucket;

pub use backend::{Backend, TokenInfo};
pub use config::{Config, RedisSettings};
pub use context::Context;
pub use error::{ErrorKind, Result, ThrottleError};
pub use in_memory::InMemoryBackend;
pub use rate_limiter::RateLimiter;
pub use redis_backend::RedisBackend;
pub use token_bucket::TokenBucket;
