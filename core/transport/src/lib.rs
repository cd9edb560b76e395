//! Remote transport abstraction for offsync.
//!
//! The sync engine never talks to a remote directly. It hands a [`Batch`] to a
//! [`RemoteTransport`] and only cares whether the call succeeded. This crate
//! defines that seam and ships two implementations:
//!
//! - [`MemoryTransport`]: an in-process mirror with scriptable failures
//! - [`HttpTransport`]: JSON over HTTP with an idempotency key per batch
//!
//! A [`TransportRegistry`] resolves transports by name from JSON
//! configuration.

pub mod http;
pub mod memory;
pub mod registry;
pub mod transport;

pub use http::HttpTransport;
pub use memory::{FailureKind, MemoryTransport};
pub use registry::{create_default_registry, TransportFactory, TransportRegistry};
pub use transport::{Batch, RemoteTransport};
