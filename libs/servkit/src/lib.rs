//! # Servkit - Pluggable Model Serving Engine
//!
//! Core of the inference serving runtime: backends wrap one model
//! configuration each and own a pool of workers that assemble fixed-size
//! batches, run the pluggable [`engine::ModelEngine`], and fan results out
//! to configured [`outlet`]s.
//!
//! The [`registry::BackendRegistry`] is the single entry point: it creates
//! backends keyed by the deterministic identity hash of their config,
//! starts and stops their worker pools, and routes tasks and results.

pub mod backend;
pub mod batch;
pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod loader;
pub mod outlet;
pub mod registry;
pub mod sandbox;
pub mod status;
pub mod task;
pub mod worker;

pub use backend::{Backend, BackendReport};
pub use config::{BackendConfig, BackendDefaults, Limits, OutletBinding, PoolTiming};
pub use engine::{EngineFactory, ModelDescriptor, ModelEngine, StagedModel};
pub use error::{ResultReply, ServingError};
pub use outlet::{Outlet, OutletFactory, OutletInfo, SyncEntry};
pub use registry::{BackendRegistry, RegistrySettings};
pub use sandbox::SandboxDecoder;
pub use status::{StatusCell, WorkerStatus};
pub use task::{ImagePool, Task};
