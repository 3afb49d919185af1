//! # edgeval-id
//!
//! Resource identifiers as issued by the edge control plane.
//!
//! ## ID Format
//!
//! Every resource is addressed as `{collection}/{uuid}`:
//!
//! - `nuvlabox/6f1d4c1e-6a53-4d7e-9a2b-1c9a4c43f0a7`
//! - `nuvlabox-status/0b0c8f1a-2e3d-4c5b-8a9f-7e6d5c4b3a21`
//! - `job/9d8c7b6a-5f4e-4d3c-8b2a-1f0e9d8c7b6a`
//!
//! Typed IDs pin the collection so an edge ID can never be passed where a job
//! ID is expected. `ResourceId` is the untyped form used for generic lookups.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export uuid for consumers that need raw UUID operations
pub use uuid::Uuid;
