//! Client handle and multiplexing

use std::fmt;
use std::sync::Arc;

/// Opaque handle for calling an upstream API.
///
/// The only contract is a stable [`Client::id`], used as the key for metrics
/// and per-pair semaphores. A client lives for the whole sync.
pub trait Client: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
}

/// Shared client reference
pub type ClientRef = Arc<dyn Client>;

/// Expands one client into several logical clients (one per account, region, ...)
pub type Multiplexer = Arc<dyn Fn(&ClientRef) -> Vec<ClientRef> + Send + Sync>;
