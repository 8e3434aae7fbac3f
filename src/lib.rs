//! # notemesh
//!
//! A semantic retrieval and sync engine for personal Markdown knowledge
//! bases.
//!
//! notemesh turns a user's notes into searchable vector representations,
//! answers queries by meaning rather than keyword, and keeps the
//! knowledge base reconciled across devices through a shared remote
//! store. Retrieval and sync are one engine: every sync-driven content
//! change re-indexes the affected documents, and every query reflects the
//! most recently reconciled state.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────┐   ┌───────────┐
//! │ Notes     │──▶│  Pipeline     │──▶│  SQLite    │
//! │ tree      │   │ Chunk+Embed  │   │ vectors   │
//! └─────┬─────┘   └──────────────┘   └─────┬─────┘
//!       │                                  │
//!       ▼                                  ▼
//! ┌───────────┐   ┌──────────────┐   ┌───────────┐
//! │ Sync      │◀─▶│ Remote store  │   │  Search    │
//! │ engine    │   │ (shared dir)  │   │ (cosine)  │
//! └───────────┘   └──────────────┘   └───────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Core data types |
//! | [`chunk`] | Document chunking strategies |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Per-user partitioned vector index |
//! | [`retrieval`] | Ingest and search orchestration |
//! | [`local`] | Local notes tree |
//! | [`remote`] | Remote store abstraction |
//! | [`sync`] | Sync engine state machine |
//! | [`manager`] | Per-user knowledge base façade |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod index;
pub mod local;
pub mod manager;
pub mod migrate;
pub mod models;
pub mod remote;
pub mod retrieval;
pub mod sync;

pub use error::{Error, Result};
pub use manager::KnowledgeBase;
