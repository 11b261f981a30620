//! Relay remote cache API.

pub mod v1;
