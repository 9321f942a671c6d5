//! Development server
//!
//! Serves bundles over HTTP and pushes hot updates over one socket per
//! connected device.
//!
//! - [`http`] holds the routes and the per-session watch forwarding
//! - [`transport`] holds the socket framing and registration

pub mod http;
pub mod transport;

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bundler::OrchestratorRegistry;
use crate::error::{Error, Result};
use crate::watch::WatchBridge;

pub use http::generate_client_id;
pub use transport::{decode_frame, encode_frame, ClientMessage, HmrChannel, ServerMessage, FRAME_SEPARATOR};

/// Everything the server tracks for one device
#[derive(Debug)]
pub(crate) struct SessionEntry {
    pub(crate) channel: Arc<HmrChannel>,
    pub(crate) forwarder: JoinHandle<()>,
    /// Full-build output namespace, deleted with the session
    pub(crate) output_dir: PathBuf,
}

/// Shared by every route
#[derive(Debug)]
pub(crate) struct ServerState {
    pub(crate) registry: Arc<OrchestratorRegistry>,
    pub(crate) watch: WatchBridge,
    pub(crate) port: u16,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl ServerState {
    pub(crate) fn insert_session(&self, client_id: &str, entry: SessionEntry) {
        let previous = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(client_id.to_string(), entry);
        if let Some(previous) = previous {
            previous.forwarder.abort();
        }
    }

    pub(crate) fn channel(&self, client_id: &str) -> Option<Arc<HmrChannel>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(client_id)
            .map(|entry| Arc::clone(&entry.channel))
    }

    pub(crate) fn remove_session(&self, client_id: &str) {
        let removed = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(client_id);
        if let Some(entry) = removed {
            entry.forwarder.abort();
            match std::fs::remove_dir_all(&entry.output_dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %entry.output_dir.display(), error = %e, "could not remove session output"),
            }
            debug!(client = %client_id, "session torn down");
        }
    }

    fn session_count(&self) -> usize {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// A bound development server
pub struct DevServer {
    state: Arc<ServerState>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl std::fmt::Debug for DevServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevServer")
            .field("local_addr", &self.local_addr)
            .field("sessions", &self.state.session_count())
            .finish()
    }
}

impl DevServer {
    /// Bind `127.0.0.1:port` (0 picks a free port) and start watching the
    /// project root. Must be called inside a tokio runtime.
    pub async fn bind(registry: Arc<OrchestratorRegistry>, port: u16) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], port))).await?;
        let local_addr = listener.local_addr()?;

        let root = registry.root().to_path_buf();
        let watch = start_watch(&root, &registry)?;

        let state = Arc::new(ServerState {
            registry,
            watch,
            port: local_addr.port(),
            sessions: Mutex::new(HashMap::new()),
        });
        Ok(Self {
            state,
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until `shutdown` resolves
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!(
            addr = %self.local_addr,
            "serving http://localhost:{}/index.bundle?platform=<ios|android>",
            self.local_addr.port()
        );
        let app = http::routes(Arc::clone(&self.state));
        axum::serve(self.listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::internal(format!("server error: {}", e)))
    }

    /// Serve until `shutdown` resolves, then write the transform cache.
    /// The cache is written even when serving fails; the serve error is
    /// the one returned.
    pub async fn run_then_persist<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let registry = Arc::clone(&self.state.registry);
        let served = self.run_until(shutdown).await;
        info!("shutting down, writing transform cache");
        let persisted = registry.persist_cache();
        if let (Err(_), Err(e)) = (&served, &persisted) {
            warn!(error = %e, "failed to persist transform cache");
        }
        served.and(persisted)
    }
}

/// Resolves on Ctrl-C or, on unix, SIGTERM. A signal that cannot be
/// installed is logged and never fires.
pub async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "could not listen for interrupt");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("received interrupt"),
        _ = terminate => info!("received SIGTERM"),
    }
}

fn start_watch(root: &Path, registry: &OrchestratorRegistry) -> Result<WatchBridge> {
    let config = registry.config();
    let cache_dir = config
        .cache_dir
        .strip_prefix(root)
        .unwrap_or(&config.cache_dir)
        .to_path_buf();
    WatchBridge::start(root, &[cache_dir], config.watch_debounce())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DevConfig;
    use crate::transform::{JsonModuleStage, CACHE_NAME};
    use crate::PersistentCache;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    struct Running {
        dir: TempDir,
        state: Arc<ServerState>,
        addr: SocketAddr,
        stop: oneshot::Sender<()>,
        served: JoinHandle<Result<()>>,
    }

    async fn serve(files: &[(&str, &str)], register_timeout_ms: u64) -> Running {
        let dir = tempfile::tempdir().unwrap();
        for (path, content) in files {
            let full = dir.path().join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, content).unwrap();
        }
        let config = DevConfig {
            watch_debounce_ms: 20,
            register_timeout_ms,
            ..DevConfig::default()
        };
        let cache = Arc::new(PersistentCache::open(&dir.path().join(&config.cache_dir), CACHE_NAME));
        let registry = Arc::new(OrchestratorRegistry::new(
            dir.path(),
            config,
            cache,
            vec![JsonModuleStage::stage()],
            None,
        ));

        let server = DevServer::bind(registry, 0).await.unwrap();
        let state = Arc::clone(&server.state);
        let addr = server.local_addr();
        let (stop, stopped) = oneshot::channel::<()>();
        let served = tokio::spawn(server.run_then_persist(async {
            let _ = stopped.await;
        }));
        Running {
            dir,
            state,
            addr,
            stop,
            served,
        }
    }

    /// GET a bundle and return the raw response
    async fn fetch_bundle(addr: SocketAddr) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /index.bundle?platform=ios HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.unwrap();
        String::from_utf8(raw).unwrap()
    }

    async fn eventually(check: impl Fn() -> bool) -> bool {
        for _ in 0..60 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        check()
    }

    fn client_id(response: &str) -> String {
        let marker = "/hmr/";
        let start = response.find(marker).unwrap() + marker.len();
        response[start..start + 6].to_string()
    }

    #[tokio::test]
    async fn test_failed_bundle_drops_session() {
        let running = serve(&[("src/Leaf.tsx", "export default 1;\n")], 60_000).await;
        let response = fetch_bundle(running.addr).await;
        assert!(response.starts_with("HTTP/1.1 200"));

        assert!(eventually(|| running.state.session_count() == 0).await);
    }

    #[tokio::test]
    async fn test_unregistered_session_expires_with_its_output() {
        let running = serve(&[("index.js", "module.exports = 1;\n")], 500).await;
        let response = fetch_bundle(running.addr).await;
        let id = client_id(&response);
        let output_dir = running
            .state
            .registry
            .get(crate::config::Platform::Ios)
            .output_dir(&id);

        assert_eq!(running.state.session_count(), 1);
        assert!(output_dir.join("index.bundle.js").is_file());

        assert!(eventually(|| running.state.session_count() == 0).await);
        assert!(!output_dir.exists());
        assert!(running.dir.path().exists());
    }

    #[tokio::test]
    async fn test_registered_session_outlives_timeout() {
        let running = serve(&[("index.js", "module.exports = 1;\n")], 300).await;
        let response = fetch_bundle(running.addr).await;
        let id = client_id(&response);
        let channel = running.state.channel(&id).unwrap();
        let _registration = channel.register(&id).unwrap();

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(running.state.session_count(), 1);
    }

    #[tokio::test]
    async fn test_stopping_writes_the_transform_cache() {
        let running = serve(&[("index.js", "module.exports = 1;\n")], 60_000).await;
        let cache = running.state.registry.cache().path().to_path_buf();
        let response = fetch_bundle(running.addr).await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(!running.state.registry.cache().is_empty());
        assert!(!cache.exists());

        running.stop.send(()).unwrap();
        running.served.await.unwrap().unwrap();
        assert!(cache.is_file());
    }
}
