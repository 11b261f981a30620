//! Core engine for `forge`, a polyglot incremental build system.
//!
//! The engine turns a declared target graph into cached, reproducible build
//! artifacts: targets are analyzed into per-file imports, lowered into
//! fine-grained actions, scheduled across a work-stealing thread pool, and
//! executed under a sandbox, with results recorded in a tiered
//! content-addressed cache.
//!
//! The DSL frontend, per-language compiler shims, and the CLI are external
//! collaborators; this library consumes their interfaces ([`target::Target`]
//! lists in, [`handler::LanguageHandler`] implementations invoked from the
//! executor) and exposes [`driver::Build`] as the entry point.

pub mod action;
pub mod analyzer;
pub mod cache;
pub mod cas;
pub mod codec;
pub mod config;
pub mod distributed;
pub mod driver;
pub mod error;
pub mod events;
pub mod exec;
pub mod fs;
pub mod graph;
pub mod handler;
pub mod hash;
pub mod label;
pub mod log;
pub mod sandbox;
pub mod target;
pub mod track;
