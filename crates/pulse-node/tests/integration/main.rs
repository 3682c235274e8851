//! Integration test entry point for pulse-node.
//!
//! Run with: cargo test --test integration -- --test-threads=1

mod harness;
mod api;
mod reconnect;
mod streaming;
