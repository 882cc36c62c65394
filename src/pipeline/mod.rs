//! Pipeline stages for lecture-to-study-guide generation.
//!
//! Each submodule implements one step. Only [`llm`] talks to the model and
//! only [`manifest`] and [`diagnostics`] talk to the store; everything else
//! is a pure transformation and is tested without either.
//!
//! ## Data Flow
//!
//! ```text
//! text ──▶ slides ──▶ chunker ──▶ extract ──▶ merge/derive ──▶ compile ──▶ gate ──▶ review ──▶ render ──▶ postprocess
//!                                   │  ▲                          │          │
//!                                   ▼  │                          └──────────┴──▶ fallback
//!                                 manifest (chunk cache)
//! ```
//!
//! 1. [`slides`]: parse slide/page markers into numbered slides
//! 2. [`chunker`]: greedy chunking with one adaptive halving pass
//! 3. [`extract`]: Step A per-chunk extraction with strict retry and
//!    recursive splitting, backed by the [`manifest`] cache
//! 4. [`merge`]: order and dedupe chunk outputs, then the derive call
//! 5. [`compile`]: Step B plan → outline → pack → validate → rewrite
//! 6. [`gate`]: minimum-count ladder: rewrite → redraft → fallback
//! 7. [`review`]: Step C review over compact statistics
//! 8. [`render`]: pure Markdown assembly plus the coverage appendix
//! 9. [`postprocess`]: deterministic layout cleanup
//!
//! [`json_repair`] and [`schema`] are shared by every JSON-producing call;
//! [`fallback`] holds the deterministic Step B stand-ins.

pub mod chunker;
pub mod compile;
pub mod diagnostics;
pub mod extract;
pub mod fallback;
pub mod gate;
pub mod json_repair;
pub mod llm;
pub mod manifest;
pub mod merge;
pub mod postprocess;
pub mod render;
pub mod review;
pub mod schema;
pub mod slides;
