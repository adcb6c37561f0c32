//! # trellis-core
//!
//! Core abstractions for the trellis software-defined-network control plane.
//!
//! This crate provides the foundational types used across all trellis
//! components:
//!
//! - **Identifiers**: Strongly-typed IDs for flows, switches, operations,
//!   and speaker commands
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialization with consistent formats
//!
//! ## Crate Boundary
//!
//! `trellis-core` is the **only** crate allowed to define shared primitives.
//! Cross-component interaction happens via the contracts defined here.
//!
//! ## Example
//!
//! ```rust
//! use trellis_core::prelude::*;
//!
//! let flow = FlowId::new("customer-42");
//! let operation = OperationId::generate();
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod observability;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use trellis_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{CommandId, Cookie, FlowId, MeterId, OperationId, SwitchId};
}

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use id::{CommandId, Cookie, FlowId, MeterId, OperationId, SwitchId};
pub use observability::{LogFormat, init_logging};
