//! Codeloom library crate
//!
//! Runs scripted, multi-turn model conversations against a live workspace.
//! The model reaches the workspace through a small set of tools; edits are
//! version-checked and propagated through the dependency matrix so that
//! files importing a changed file get flagged for review.
//!
//! The `codeloom` binary is a thin host over [`engine::Engine`].

pub mod analysis;
pub mod classify;
pub mod coherence;
pub mod config;
pub mod debug;
pub mod engine;
pub mod error;
pub mod fuzzy;
pub mod llm;
pub mod logging;
pub mod script;
pub mod tools;
pub mod util;
