//! Shared setup for the sidecar binaries

pub mod common;
