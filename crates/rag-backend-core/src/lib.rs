//! # RAG Backend Core
//!
//! Runtime-free domain logic for the RAG backend: catalog and job models,
//! the index consistency guard, job recovery planning, and the traits that
//! describe the backend's external collaborators.
//!
//! This crate contains no tokio, socket, or filesystem I/O. Everything here
//! is a pure function over values or a trait implemented elsewhere.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Catalog, snapshot, ingestion job, and index version types |
//! | [`catalog`] | Source registration, update, and removal |
//! | [`guard`] | Catalog/index consistency check gating query serving |
//! | [`recovery`] | Checkpoints and resume plans for interrupted jobs |
//! | [`audit`] | Audit entry shape and language normalization |
//! | [`store`] | Collaborator traits plus in-memory implementations |
//! | [`clock`] | Injectable time source |

pub mod audit;
pub mod catalog;
pub mod clock;
pub mod error;
pub mod guard;
pub mod models;
pub mod recovery;
pub mod store;

pub use error::{IndexErrorCode, IndexUnavailable};
