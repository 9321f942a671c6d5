//! Livebundle: an incremental development bundler with live module replacement
//!
//! Livebundle serves a mobile application a patchable bundle over HTTP and
//! keeps it live while sources change. Edits are rebuilt incrementally,
//! shipped to the device over a socket as minimal payloads, and applied in
//! place whenever the edited modules sit under a component boundary. When
//! they do not, the device is asked to reload.
//!
//! # Quick Start
//!
//! ```no_run
//! use livebundle::{DevConfig, DevServer, OrchestratorRegistry, PersistentCache, JsonModuleStage};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn run() -> livebundle::Result<()> {
//! let root = Path::new(".");
//! let config = DevConfig::load(root)?;
//! let cache = Arc::new(PersistentCache::open(&root.join(&config.cache_dir), livebundle::transform::CACHE_NAME));
//! let port = config.server_port;
//! let registry = Arc::new(OrchestratorRegistry::new(root, config, cache, vec![JsonModuleStage::stage()], None));
//! let server = DevServer::bind(registry, port).await?;
//! server.run_then_persist(livebundle::server::shutdown_signal()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Module Overview
//!
//! Change flow: [`watch`] → [`session`] → [`bundler`] → [`server`] → [`runtime`]
//!
//! | Category | Modules |
//! |----------|---------|
//! | **Build** | [`bundler`], [`transform`], [`cache`], [`source_map`] |
//! | **Live updates** | [`watch`], [`session`], [`server`], [`runtime`] |
//! | **Shared** | [`config`], [`module_id`], [`error`](Error) |

pub mod bundler;
pub mod cache;
pub mod config;
pub mod error;
pub mod module_id;
pub mod runtime;
pub mod server;
pub mod session;
pub mod source_map;
pub mod transform;
pub mod watch;

pub use bundler::{BuildOrchestrator, HmrPayload, OrchestratorRegistry};
pub use cache::PersistentCache;
pub use config::{DevConfig, JsTarget, Platform};
pub use error::{Error, Result};
pub use module_id::ModuleId;
pub use runtime::{ClientRuntime, RefreshOutcome};
pub use server::DevServer;
pub use session::{ClientKnownModules, ClientSession};
pub use transform::{JsonModuleStage, TransformPipeline, TransformStage, WorkerPool};
pub use watch::WatchBridge;

/// Livebundle version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
