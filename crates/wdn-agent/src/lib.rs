//! warden-agent library target.
//!
//! Exposes the wiring between the connectivity components so integration
//! tests can assemble the same pipelines the binary runs. The binary
//! `main.rs` depends on this library target.

pub mod cli;
pub mod executor;
pub mod pipeline;
pub mod runner;
pub mod settings;
