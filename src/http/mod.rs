//! HTTP layer of the caching proxy.
//!
//! A single catch-all handler decides per request whether to answer from the
//! cache tree or to fetch from upstream while filling the cache.

pub mod handler;
pub mod headers;

pub use handler::{ADMIN_PREFIX, ProxyError, create_router};
