//! Integration tests for deckhand-lib.

mod common;
mod config_tests;
mod coordinator_tests;
mod git_tests;
mod run_tests;
