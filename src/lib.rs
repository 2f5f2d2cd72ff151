//! Server-side HTML fragment rendering.
//!
//! Templates are resolved through tiered storage, rendered in one of four
//! modes (standard, fragment, block, stream) and served through a rule-based
//! response cache. See [`application::render::Renderer`] for the entry point.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
pub mod presentation;
