//! HTTP routes
//!
//! - `GET /index.bundle?platform=ios|android` streams a fresh full bundle and
//!   opens a session for the requesting device
//! - `GET /hmr/{client_id}` upgrades to the session's hot-update socket; a
//!   plain GET answers 205 so a reconnecting client reloads

use axum::{
    body::Body,
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};

use super::transport::{ClientMessage, HmrChannel, Registration};
use super::{ServerState, SessionEntry};
use crate::config::Platform;
use crate::error::Error;
use crate::session::ClientSession;
use crate::watch::ChangeBatch;

/// Buffer between the build task and the response body
const BUNDLE_PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
struct BundleQuery {
    platform: Option<String>,
}

pub(super) fn routes(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/index.bundle", get(bundle))
        .route("/hmr/{client_id}", get(hmr_socket))
        .with_state(state)
}

/// Six lowercase hex characters
pub fn generate_client_id() -> String {
    let bytes: [u8; 3] = rand::random();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// GET /index.bundle
async fn bundle(State(state): State<Arc<ServerState>>, Query(query): Query<BundleQuery>) -> Response {
    let platform = match query.platform.as_deref().map(str::parse::<Platform>) {
        Some(Ok(platform)) => platform,
        Some(Err(e)) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        None => return (StatusCode::BAD_REQUEST, "missing platform query parameter").into_response(),
    };

    let client_id = generate_client_id();
    let socket_url = format!("ws://localhost:{}/hmr/{}", state.port, client_id);
    let orchestrator = state.registry.get(platform);
    let session = Arc::new(tokio::sync::Mutex::new(ClientSession::new(
        Arc::clone(&orchestrator),
        &client_id,
        &socket_url,
    )));
    let channel = Arc::new(HmrChannel::new(&client_id));

    let forwarder = tokio::spawn(forward_changes(
        state.watch.subscribe(),
        Arc::clone(&session),
        Arc::clone(&channel),
        state.port,
    ));
    let output_dir = orchestrator.output_dir(&client_id);
    state.insert_session(
        &client_id,
        SessionEntry {
            channel: Arc::clone(&channel),
            forwarder,
            output_dir,
        },
    );
    info!(client = %client_id, platform = %platform, "bundle requested");

    let (mut writer, reader) = tokio::io::duplex(BUNDLE_PIPE_CAPACITY);
    tokio::spawn(async move {
        let built = {
            let mut session = session.lock().await;
            session.build_full_bundle(&mut writer).await
        };
        // Ends the response body
        drop(writer);

        match built {
            Ok(()) => expire_unregistered(state, channel).await,
            Err(e) => {
                report_build_error(&e);
                state.remove_session(&client_id);
            }
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/javascript")
        .body(Body::from_stream(ReaderStream::new(reader)))
        .unwrap_or_else(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response())
}

/// Drop a session whose client never opened its socket
async fn expire_unregistered(state: Arc<ServerState>, channel: Arc<HmrChannel>) {
    tokio::time::sleep(state.registry.config().register_timeout()).await;
    if !channel.is_registered() {
        info!(client = %channel.client_id(), "client never connected, dropping session");
        state.remove_session(channel.client_id());
    }
}

/// GET /hmr/{client_id}
async fn hmr_socket(
    State(state): State<Arc<ServerState>>,
    Path(client_id): Path<String>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Ok(upgrade) = upgrade else {
        // The server restarted under a client that still holds an old bundle
        debug!(client = %client_id, "plain request on socket path, asking client to reload");
        return StatusCode::RESET_CONTENT.into_response();
    };
    let Some(channel) = state.channel(&client_id) else {
        return StatusCode::RESET_CONTENT.into_response();
    };
    upgrade.on_upgrade(move |socket| handle_socket(socket, state, channel))
}

async fn handle_socket(socket: WebSocket, state: Arc<ServerState>, channel: Arc<HmrChannel>) {
    let (mut sender, mut receiver) = socket.split();

    let registration = loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                Ok(ClientMessage::Register { client_id }) => {
                    if let Some(registration) = channel.register(&client_id) {
                        break Some(registration);
                    }
                }
                Err(e) => warn!(error = %e, "unreadable client message"),
            },
            Some(Ok(Message::Close(_))) | None => break None,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(error = %e, "socket error before register");
                break None;
            }
        }
    };

    let Some(Registration { generation, mut outbox }) = registration else {
        debug!(client = %channel.client_id(), "socket closed before register");
        return;
    };

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = outbox.recv().await {
            if sender.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if let Message::Close(_) = message {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // A newer socket for the same client keeps the session alive
    if channel.unregister(generation) {
        state.remove_session(channel.client_id());
        info!(client = %channel.client_id(), "client disconnected");
    }
}

/// Turn watch batches into hot updates for one session until the watch ends
async fn forward_changes(
    mut batches: tokio::sync::broadcast::Receiver<ChangeBatch>,
    session: Arc<tokio::sync::Mutex<ClientSession>>,
    channel: Arc<HmrChannel>,
    port: u16,
) {
    let mut sequence: u64 = 0;
    loop {
        let batch = match batches.recv().await {
            Ok(batch) => batch,
            Err(RecvError::Lagged(missed)) => {
                warn!(client = %channel.client_id(), missed, "watch batches dropped, client may be stale");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        let mut session = session.lock().await;
        match session.build_hmr_payload(&batch).await {
            Ok(Some(payload)) => {
                sequence += 1;
                let source_url = format!("http://localhost:{}/hmr/{}/update-{}.js", port, channel.client_id(), sequence);
                match channel.send_update(&source_url, &payload.modules_to_hot_replace, &payload.code) {
                    Ok(true) => debug!(client = %channel.client_id(), sequence, "hot update sent"),
                    Ok(false) => session.discard_undelivered(&payload),
                    Err(e) => {
                        error!(client = %channel.client_id(), error = %e, "could not encode hot update");
                        session.discard_undelivered(&payload);
                    }
                }
            }
            Ok(None) => {}
            Err(e) => report_build_error(&e),
        }
    }
}

/// Print a failed build with source context
fn report_build_error(e: &Error) {
    match e.diagnostics() {
        Some(diagnostics) => {
            for diagnostic in diagnostics.iter() {
                error!("{}", diagnostic.render());
            }
        }
        None => error!(error = %e, "build failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundler::OrchestratorRegistry;
    use crate::config::DevConfig;
    use crate::module_id::ModuleId;
    use crate::transform::{JsonModuleStage, CACHE_NAME};
    use crate::PersistentCache;
    use std::collections::BTreeSet;
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    const APP: &[(&str, &str)] = &[
        ("index.js", "require('./src/Leaf');\n"),
        ("src/Leaf.js", "module.exports = function Leaf() {};\n"),
        ("src/badge.js", "module.exports = '*';\n"),
    ];

    /// A session that has streamed its full bundle
    async fn bundled_session() -> (TempDir, Arc<tokio::sync::Mutex<ClientSession>>) {
        let dir = tempfile::tempdir().unwrap();
        for (path, content) in APP {
            let full = dir.path().join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, content).unwrap();
        }
        let cache = Arc::new(PersistentCache::open(&dir.path().join(".cache"), CACHE_NAME));
        let registry =
            OrchestratorRegistry::new(dir.path(), DevConfig::default(), cache, vec![JsonModuleStage::stage()], None);
        let mut session = ClientSession::new(registry.get(Platform::Ios), "abc123", "ws://localhost/hmr/abc123");
        let mut out: Vec<u8> = Vec::new();
        session.build_full_bundle(&mut out).await.unwrap();
        (dir, Arc::new(tokio::sync::Mutex::new(session)))
    }

    /// Edit the leaf to pull in a new module and push one batch through the forwarder
    async fn forward_leaf_edit(dir: &TempDir, session: &Arc<tokio::sync::Mutex<ClientSession>>, channel: &Arc<HmrChannel>) {
        std::fs::write(
            dir.path().join("src/Leaf.js"),
            "var badge = require('./badge');\nmodule.exports = function Leaf() { return badge; };\n",
        )
        .unwrap();
        let (batches, receiver) = broadcast::channel(4);
        batches.send(Arc::new(vec![ModuleId::from("src/Leaf.js")])).unwrap();
        drop(batches);
        forward_changes(receiver, Arc::clone(session), Arc::clone(channel), 8081).await;
    }

    fn known(session: &ClientSession) -> BTreeSet<String> {
        session.known().iter().map(|id| id.to_string()).collect()
    }

    #[tokio::test]
    async fn test_delivered_update_is_recorded() {
        let (dir, session) = bundled_session().await;
        let channel = Arc::new(HmrChannel::new("abc123"));
        let mut registration = channel.register("abc123").unwrap();

        forward_leaf_edit(&dir, &session, &channel).await;

        let frame = registration.outbox.try_recv().unwrap();
        assert!(frame.contains("\"modules_to_hot_replace\":[\"src/Leaf.js\"]"));
        assert!(frame.contains("/hmr/abc123/update-1.js"));
        let session = session.lock().await;
        assert!(known(&session).contains("src/badge.js"));
        assert!(known(&session).contains("src/Leaf.js"));
    }

    #[tokio::test]
    async fn test_undelivered_update_is_not_recorded() {
        let (dir, session) = bundled_session().await;
        let channel = Arc::new(HmrChannel::new("abc123"));

        forward_leaf_edit(&dir, &session, &channel).await;

        let session = session.lock().await;
        let expected: BTreeSet<String> = ["index.js".to_string()].into_iter().collect();
        assert_eq!(known(&session), expected);
    }

    #[test]
    fn test_client_id_shape() {
        for _ in 0..32 {
            let id = generate_client_id();
            assert_eq!(id.len(), 6);
            assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        }
    }
}
