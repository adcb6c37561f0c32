//! # trellis-flow
//!
//! Saga-based orchestration of flow lifecycle operations for the trellis
//! software-defined-network control plane.
//!
//! A caller submits a create, delete, or reroute request for a flow; the
//! service drives it through an explicit state machine that validates the
//! request, reserves path resources transactionally, installs forwarding
//! rules on the involved switches through asynchronous speaker commands,
//! verifies them, and commits — or compensates everything it did when a
//! step fails.
//!
//! Layering, top to bottom:
//!
//! - [`service::FlowService`] — request admission, partition routing,
//!   lifecycle
//! - [`worker`] — one single-threaded event loop per flow-id partition
//! - [`saga`] — per-operation state machine and its orchestrator
//! - [`dispatch`] / [`correlation`] — command retry ladders and response
//!   routing
//! - [`ledger`] / [`store`] — transactional resource accounting over a
//!   pluggable store
//!
//! External collaborators (path computation, switch-agent transport,
//! history persistence) are traits; in-memory implementations back the
//! tests and the development binary.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod correlation;
pub mod dispatch;
pub mod error;
pub mod history;
pub mod ledger;
pub mod model;
pub mod resolver;
pub mod saga;
pub mod service;
pub mod store;
pub mod worker;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::FlowServiceConfig;
    pub use crate::error::{Error, Result};
    pub use crate::model::{Flow, FlowSpec, FlowStatus, Path, PathPair, PathSegment};
    pub use crate::saga::{OperationKind, RequestPayload};
    pub use crate::service::{FlowRequest, FlowResponse, FlowService, RequestStatus};
}

pub use config::FlowServiceConfig;
pub use error::{Error, Result};
pub use service::{FlowRequest, FlowResponse, FlowService, ResponseHandle};
