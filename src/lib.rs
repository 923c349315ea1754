//! # graphlens: enriched code graph with freshness-aware queries
//!
//! Keeps a per-repository symbol graph annotated by LLM backends and answers
//! navigation queries against it, falling back to a live scan of the working
//! tree whenever the graph cannot be trusted.
//!
//! ## Architecture
//!
//! - **[`models`]** - Spans, entities, relations, graph snapshots, enrichment records
//! - **[`store`]** - JSON graph snapshots plus the SQLite enrichment store
//! - **[`backend`]** - Inference backend adapters (Ollama, OpenAI-compatible, Anthropic)
//! - **[`reliability`]** - Rate limiting, circuit breaking, retries, cost tracking, cascade
//! - **[`enrichment`]** - Batch pipeline that annotates pending spans
//! - **[`freshness`]** - Graph revision vs. repository head, and query routing
//! - **[`query`]** - `search`, `where_used`, `lineage` over graph or live fallback
//! - **[`scheduler`]** - Worker pool driving periodic enrichment runs
//! - **[`vcs`]** - Head revision lookup
//! - **[`config`]** - Configuration loading and validation

pub mod backend;
pub mod config;
pub mod enrichment;
pub mod error;
pub mod freshness;
pub mod models;
pub mod query;
pub mod reliability;
pub mod scheduler;
pub mod store;
pub mod vcs;
