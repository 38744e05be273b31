//! # Hivemind Memory
//!
//! **A git-backed, hybrid-searchable memory store for fleets of coding
//! agents.**
//!
//! Hivemind Memory keeps automated coding assistants in sync with user
//! preferences, project decisions, and environmental facts across sessions,
//! projects, and machines. Each store is a directory of markdown files with
//! an embedded git repository for history and an SQLite index (FTS5 +
//! embedding vectors) for retrieval. Many concurrent clients talk to it
//! through an MCP tool surface over stdio or streamable HTTP.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌───────────────┐   ┌───────────────┐
//! │ MCP tools   │──▶│ Scope resolver │──▶│   Manager     │
//! │ (rmcp)      │   │ global / repo  │   │  per store    │
//! └────────────┘   └───────────────┘   └──────┬────────┘
//!                                            │
//!                       ┌────────────┬───────┴────┬───────────┐
//!                       ▼            ▼            ▼           ▼
//!                  ┌─────────┐  ┌─────────┐  ┌────────┐  ┌─────────┐
//!                  │ markdown │  │  SQLite │  │  git   │  │ watcher │
//!                  │  files   │  │FTS5+vec │  │history │  │(notify) │
//!                  └─────────┘  └─────────┘  └────────┘  └─────────┘
//! ```
//!
//! ## Data Flow
//!
//! A mutating tool call acquires the store's on-disk lock, checks out the
//! target branch when needed, applies the filesystem change, resyncs the
//! index (default branch only), auto-commits, and restores the branch. The
//! on-disk file is the source of truth, the index is a cache, git is the
//! history. A debounced [`watcher`] picks up out-of-band edits.
//!
//! ## Search Modes
//!
//! | Engine | Backend | Requires embeddings |
//! |--------|---------|---------------------|
//! | keyword | SQLite FTS5 (BM25) | No |
//! | vector | Cosine similarity over stored vectors | Yes |
//! | hybrid merge | 0.4 keyword + 0.6 vector, temporal decay | — |
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and `HIVEMIND_*` environment wiring |
//! | [`error`] | Error taxonomy (`NotFound`, `RefLookup`, `Busy`, …) |
//! | [`chunk`] | Heading-boundary markdown chunker |
//! | [`frontmatter`] | Lenient YAML frontmatter codec |
//! | [`embedding`] | Embedding provider trait, remote/local HTTP providers |
//! | [`rerank`] | Subprocess reranker with order-preserving fallback |
//! | [`db`] / [`migrate`] | SQLite pool (WAL, FK) and idempotent schema |
//! | [`git`] | Subprocess git adapter with classified errors |
//! | [`lock`] | On-disk store lock with stale reclaim |
//! | [`manager`] | Store façade: writes, reads, sync, branches |
//! | [`search`] | Hybrid retrieval pipeline |
//! | [`watcher`] | Debounced filesystem observer |
//! | [`scope`] | Store registry and request routing |
//! | [`inject`] | Context injection into `CLAUDE.md` |
//! | [`mcp`] | MCP tool surface (stdio and streamable HTTP) |

pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod frontmatter;
pub mod git;
pub mod inject;
pub mod lock;
pub mod manager;
pub mod mcp;
pub mod migrate;
pub mod rerank;
pub mod scope;
pub mod search;
pub mod watcher;

pub use error::{Error, Result};
pub use manager::{Manager, StoreOptions};
pub use scope::{Scope, StoreRegistry};
