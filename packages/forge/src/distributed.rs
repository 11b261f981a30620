//! Distributed execution coordination.
//!
//! An optional alternative dispatch target: instead of running an action
//! on a local worker thread, the engine ships a [`DispatchRequest`] to a
//! remote worker and collects a [`DispatchResponse`]. Inputs and outputs
//! never travel by value; workers fetch blobs from the shared CAS by
//! digest.
//!
//! The registry tracks worker health through heartbeats, reassigns the
//! in-progress actions of failed workers (none are lost), and blacklists
//! failing workers with exponential backoff.

mod registry;
mod wire;

pub use registry::{Health, RegistryConfig, Strategy, WorkerRegistry};
pub use wire::{DispatchRequest, DispatchResponse, RemoteStatus, ResourceUsage};
