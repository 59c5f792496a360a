//! Request-admission and cache-policy engine.
//!
//! Sits between clients and an origin web server and decides, per request:
//! which backend pool serves it, whether it may enter that pool right now,
//! whether a cached response can be served instead, and whether an origin
//! response is eligible for caching and for how long. Cache hits stay on a
//! zero-wait fast path; anonymous page storms are absorbed by per-class
//! concurrency ceilings with bounded wait queues.

pub mod cache;
pub mod classify;
pub mod config;
pub mod error;
pub mod normalize;
pub mod policy;
pub mod pool;
pub mod proxy;
pub mod purge;
pub mod request;
pub mod router;

pub use config::Config;
pub use error::{GateError, Result};
pub use proxy::Gatekeeper;
