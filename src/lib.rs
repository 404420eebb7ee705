//! clawcore — conversation-state core for an interactive LLM agent runtime.
//!
//! Three tightly coupled subsystems live here:
//!
//! - **Session store & lifecycle** ([`store`], [`session`]): an append-only,
//!   multi-writer persistent log of messages, checkpoints, and compactions,
//!   with an in-memory cache and a `"primary"` session convention.
//! - **Rolling checkpoint + adaptive compaction** ([`checkpoint`],
//!   [`compaction`]): background summarization that keeps long conversations
//!   within a model's context window, using a truncate-now/summarize-later
//!   protocol with retry on failure.
//! - **Browser automation pool** ([`browser`]): a singleton-managed pool of
//!   long-lived browser instances keyed by profile, with tab tracking, crash
//!   recovery, and an SSRF guard on every navigation.
//!
//! CLI plumbing, channel delivery, and UI are out of scope — this crate is
//! the core that those surfaces embed.

pub mod browser;
pub mod checkpoint;
pub mod compaction;
pub mod config;
pub mod error;
pub mod flush;
pub mod logging;
pub mod memory_graph;
pub mod records;
pub mod session;
pub mod store;
pub mod summarizer;
pub mod tokenizer;

pub use error::{CoreError, ErrorKind};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const AUTHORS: &str = env!("CARGO_PKG_AUTHORS");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
