//! praetor -- control plane for multi-provider LLM relays.
//!
//! The control plane mediates incoming requests against a pool of upstream
//! provider accounts. It admits requests per tenant (rate windows,
//! concurrency leases with bounded queueing, layered cost limits with
//! fuel-pack override), selects an upstream account per request with sticky
//! sessions and overload masking, and accounts usage and cost after each
//! response. All shared state lives in a Redis-compatible store; the
//! control plane itself is stateless and scales horizontally.
//!
//! Out of scope by design: HTTP transport, upstream proxying, OAuth
//! refresh, secret encryption, and configuration loading. Those live in the
//! embedding relay; this crate is the part that has to be correct under
//! concurrent, distributed access.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use praetor::{
//!     admission::{AdmissionEngine, RequestDescriptor},
//!     config::ControlPlaneConfig,
//!     store::MemoryStore,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ControlPlaneConfig::default();
//! let engine = AdmissionEngine::new(Arc::new(MemoryStore::new()), config.admission);
//!
//! let descriptor = RequestDescriptor {
//!     model: Some("claude-3-5-sonnet-20241022".into()),
//!     ..Default::default()
//! };
//! let admission = engine
//!     .admit("cr_raw_key", "req-1", &descriptor, &CancellationToken::new())
//!     .await?;
//! // ... forward upstream, then release the slot
//! engine.release_slot(&admission.api_key.id, "req-1").await;
//! # Ok(())
//! # }
//! ```

pub mod accounting;
pub mod accounts;
pub mod admission;
pub mod config;
pub mod models;
pub mod observability;
pub mod scheduler;
pub mod store;

#[cfg(test)]
mod tests;
