//! Bundling
//!
//! - [`scan`] finds import specifiers
//! - [`resolver`] maps specifiers to module ids
//! - [`emit`] writes module registrations and graph statements
//! - [`engine`] walks the graph with an incremental handle
//! - [`orchestrator`] produces full bundles and hot payloads

pub mod emit;
pub mod engine;
pub mod orchestrator;
pub mod resolver;
pub mod scan;

pub use engine::{BuildArtifact, BuildRequest, BundlerEngine};
pub use orchestrator::{BuildOrchestrator, HmrPayload, OrchestratorRegistry, BUILD_FAILED_STATEMENT};
pub use resolver::Resolver;
