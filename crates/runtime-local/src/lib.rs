//! Native implementations of the `runtime` contracts: an in-memory TTL
//! cache store, a `reqwest`-backed upstream fetcher, and a request context
//! that spawns deferred work onto the runtime.

mod cache;
mod context;
mod fetch;

pub use cache::InMemoryCacheStore;
pub use context::NativeRequestContext;
pub use fetch::NativeFetcher;
