//! Data-loading and caching core of the Refract gateway.
//!
//! One graph-shaped query fans out into many upstream REST calls; the
//! loaders here make that fan-out batched, deduplicated, cached, and
//! resilient so no resolver ever coordinates it by hand:
//!
//! - [`cached`] builds loaders over shareable resources, backed by the
//!   persistent cache store with throttled background refreshes.
//! - [`authed`] builds loaders over user-specific resources, with one
//!   lazily-exchanged bearer token per query execution and no persistent
//!   cache interaction.
//! - [`merge`] coalesces single-item calls into bulk upstream calls where
//!   a multi-item endpoint exists.
//! - [`compound`] groups two-part keys by their parent so each parent's
//!   children are fetched once.
//! - [`timeout`] caps any loader future with a deadline.

pub mod authed;
pub mod cached;
pub mod compound;
pub mod config;
pub mod error;
pub mod key;
pub mod loaded;
pub mod merge;
pub mod throttle;
pub mod timeout;

pub use authed::{AuthedLoader, AuthedLoaderFactory, TokenContext};
pub use cached::{CachedLoader, CachedLoaderFactory};
pub use compound::{CompoundKey, CompoundLoader};
pub use config::{GatewayConfig, LoaderOptions};
pub use error::LoadError;
pub use key::{merge_params, LoaderKey, ParamValue, Params, PathSpec, ResourceId};
pub use loaded::Loaded;
pub use merge::{MergeConfig, MergedLoader};
pub use throttle::ThrottleRegistry;
pub use timeout::with_deadline;
