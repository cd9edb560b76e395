//! Common utilities and types shared across offsync crates.
//!
//! This module provides the error taxonomy and the small value types that
//! flow between the queue, the coordinator and the transports.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{ChangeRecord, ConnectivityState, SequenceNumber, TargetId};
