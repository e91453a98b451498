//! Contracts between the Refract loader core and its collaborators.
//!
//! Everything in here is a boundary: the persistent cache store shared
//! across requests, the upstream fetch transport, the access-token
//! exchange, and the per-execution request context. Implementations live
//! in `runtime-local` (native) and in test fakes.

pub mod cache;
pub mod context;
pub mod fetch;
pub mod token;
