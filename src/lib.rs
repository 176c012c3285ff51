//! # rag-backend
//!
//! A local knowledge-retrieval backend serving CLI clients over a private
//! Unix socket.
//!
//! Clients speak a length-prefixed JSON protocol: a handshake, then request
//! frames routed to the query, catalog, reindex, and admin handlers. Reindex
//! jobs run in the background and stream progress frames back on the
//! requesting connection; a failed job can be resumed from its last
//! checkpoint. Queries are refused with `409` until the catalog's index
//! snapshots match its active sources.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  frames  ┌────────────┐  dispatch  ┌─────────────────────┐
//! │  client  │─────────▶│ Connection │───────────▶│       Router        │
//! └──────────┘◀─────────│  (per fd)  │◀───────────│ query/sources/admin │
//!               stream  └────────────┘  JobStream └──────────┬──────────┘
//!                                                            │ begin
//!                                                            ▼
//!                        ┌───────────┐  chunks    ┌─────────────────────┐
//!                        │ ChunkIndex│◀───────────│ ReindexOrchestrator │
//!                        └───────────┘            │ + JobRecoveryService│
//!                                                 └─────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`frame`] | Length-prefixed JSON framing |
//! | [`connection`] | Per-connection handshake and serving loop |
//! | [`server`] | Unix-socket listener |
//! | [`router`] | Path dispatch and error mapping |
//! | [`error`] | Protocol, transport, and handler errors |
//! | [`job_stream`] | Job event channel between reindex runs and connections |
//! | [`reindex`] | Reindex orchestration, checkpoints, and resume |
//! | [`query`] | Retrieval and answer assembly |
//! | [`health`] | Health diagnostics |
//! | [`admin`] | Installation bootstrap check |
//! | [`storage`] | JSON-file catalog, index version, and audit log |
//! | [`search`] | Persisted keyword chunk index |
//! | [`chunk`] | Text chunking |
//! | [`connector_fs`] | Filesystem chunk builder |
//! | [`checksum`] | Source checksums |
//! | [`progress`] | CLI progress reporting |
//! | [`sources`] | CLI catalog listing |

pub mod admin;
pub mod checksum;
pub mod chunk;
pub mod config;
pub mod connection;
pub mod connector_fs;
pub mod error;
pub mod frame;
pub mod health;
pub mod job_stream;
pub mod progress;
pub mod query;
pub mod reindex;
pub mod router;
pub mod search;
pub mod server;
pub mod sources;
pub mod storage;
