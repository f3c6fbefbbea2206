//! KV coordination layer.
//!
//! All shared state lives in a Redis-compatible store; the control plane
//! itself is stateless. Every cross-process atomic step -- concurrency lease
//! sets, the user-message serialization lock, queue counters, guarded hash
//! writes -- is a server-side script, and a usage event's counter fan-out is
//! issued as one pipeline. Scripts take `now` from the caller instead of the
//! server's TIME so behavior is identical across sharded deployments.

mod error;
mod keys;
mod memory;
#[cfg(feature = "redis")]
mod redis;
mod traits;

pub use error::{StoreError, StoreResult};
pub use keys::{StoreKeys, ttl};
pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis::RedisStore;
pub use traits::{CounterOp, Store, StoreExt, UserMessageAcquire};
