//! Consolidated end-to-end tests.
//!
//! The admission scenarios run the full engine against the in-memory store;
//! the Redis script tests exercise the same coordination primitives against
//! a containerized Redis.

mod admission_e2e;
#[cfg(feature = "redis")]
mod store_redis;
