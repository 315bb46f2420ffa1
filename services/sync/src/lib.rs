//! services/sync/src/lib.rs
//!
//! The sync core: everything needed to align the text of an ebook with the
//! narration of its audiobook. Concrete adapters live under `adapters`; the
//! pipeline stages (parser, chunker, aligner, anchor calculator) and the
//! orchestrator that drives them live at the top level.

pub mod adapters;
pub mod aligner;
pub mod anchors;
pub mod bootstrap;
pub mod chunker;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod parser;
pub mod text;
