//! CLI integration tests driven by TOML fixtures.

mod common;
mod descriptor_tests;
mod pipeline_tests;
mod run_tests;
