//! deckhand-lib: pipeline definitions and run logic for deckhand
//!
//! This crate provides the pieces that turn a service description into a
//! running delivery pipeline:
//! - `PipelineDefinition`: source, image builds and deploy preparation of one service
//! - `PipelinePlan`: the staged jobs a definition expands to
//! - `render`: buildspec and pipeline documents for a hosted backend
//! - `run`: executing a plan locally, one run per revision

pub mod build;
pub mod config;
pub mod deploy;
pub mod descriptor;
pub mod error;
pub mod params;
pub mod pipeline;
pub mod placeholder;
pub mod render;
pub mod revision;
pub mod run;
pub mod step;
pub mod util;
