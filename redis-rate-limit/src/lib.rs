//! Thin bb8-pooled Redis plumbing.
//!
//! The response cache and the dynamic auth key store are external
//! collaborators (see spec §1/§6); this crate only provides the connection
//! pool type and error sink the core wires up when a `redis_url` is
//! configured, mirroring how the teacher app builds its pool in `app.rs`.

pub mod errors;

pub use bb8;
pub use redis;

pub type RedisConnectionManager = bb8_redis::RedisConnectionManager;
pub type RedisPool = bb8::Pool<RedisConnectionManager>;
pub use errors::{RedisErrorSink, RedisError};
