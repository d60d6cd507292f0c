//! Tidepool: a local-first context plane for engineering projects.
//!
//! Tidepool indexes source repositories into per-project vector collections,
//! answers natural-language questions grounded in that content, and enforces
//! a governance layer of *sacred plans* that detects when ongoing
//! development drifts from approved architectural decisions.
//!
//! # Core Principles
//!
//! - **Local-first**: one node, a local vector store, a local filesystem tree
//! - **Project-isolated**: every vector operation is scoped to one project's
//!   collection; nothing reads across projects
//! - **Governed**: plans become immutable on two-factor approval and are the
//!   reference development is measured against
//! - **Owned state**: each record type has exactly one owner; components
//!   share state only through owner operations
//!
//! # Architecture
//!
//! ## Owners
//!
//! - [`core::project::ProjectRegistry`]: projects, decisions, objectives,
//!   development events, and the single focus selector
//! - [`core::sacred::SacredStore`]: plan records, the approval state
//!   machine, and chunk-reconstructable content
//! - [`core::retrieval::RetrievalEngine`]: chunk and vector-entry
//!   lifecycles; the only writer of `project_*` collections
//! - [`core::tasks::TaskRegistry`]: asynchronous indexing tasks and their
//!   worker lifecycle
//!
//! ## Pipelines
//!
//! Ingest: path filter → secret redaction → chunking → batched embedding →
//! atomic collection write, with progress on the event bus. Query: embed →
//! top-k cosine search → optional generation grounded in the hits. Drift:
//! approved plans × (git activity + query log) → alignment score,
//! violations, recommendations.
//!
//! ## Surfaces
//!
//! The HTTP+WebSocket API in [`api`] is the only ingress; external
//! assistants reach the same operations through an MCP shim that forwards to
//! it. The [`cli`] runs the server (`tidepool serve`) and the environment
//! doctor (`tidepool doctor`).

pub mod api;
pub mod cli;
pub mod core;
