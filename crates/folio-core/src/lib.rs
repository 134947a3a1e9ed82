//! # Folio Core
//!
//! Core traits, types, and errors for the Folio sync engine.
//!
//! This crate provides the foundational abstractions that allow the same
//! query, resolution and publish logic to run against real node connections
//! and against the in-memory [`MockNodeTransport`] used in tests.
//!
//! ## Key Traits
//!
//! - [`NodeTransport`]: Request, subscribe and publish against a pool of nodes
//! - [`Signer`]: Opaque record signing capability
//! - [`Clock`]: Time abstraction for testability
//!
//! ## Key Types
//!
//! - [`Record`]: A signed, content-addressed record
//! - [`Coordinate`]: Stable address of a replaceable record
//! - [`QueryFilter`]: Selection criteria for records
//! - [`NodeUrl`]: Canonical node address with its [`NodeTier`]
//! - [`ContentProjection`]: Typed view of a record's content

pub mod content;
pub mod coordinate;
pub mod error;
pub mod filter;
pub mod mock_transport;
pub mod node;
pub mod record;
pub mod traits;
pub mod transport;

// Re-export main types
pub use content::*;
pub use coordinate::*;
pub use error::*;
pub use filter::*;
pub use mock_transport::*;
pub use node::*;
pub use record::*;
pub use traits::*;
pub use transport::*;
