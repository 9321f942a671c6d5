//! Hot-update transport
//!
//! Each session owns one [`HmrChannel`]. The device connects to
//! `/hmr/<client_id>`, sends a single register message, and from then on
//! receives frames of the form
//!
//! ```text
//! {"type":"update","sourceURL":"...","modules_to_hot_replace":[...]}§<code>
//! ```
//!
//! The code is appended raw after the separator, never JSON-encoded.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::module_id::ModuleId;

/// Splits the JSON header from the payload code
pub const FRAME_SEPARATOR: char = '§';

/// Sent by the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Register { client_id: String },
}

/// Sent by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Update {
        #[serde(rename = "sourceURL")]
        source_url: String,
        modules_to_hot_replace: Vec<ModuleId>,
    },
}

/// Header JSON, separator, then the raw code
pub fn encode_frame(message: &ServerMessage, code: &str) -> Result<String> {
    let header = serde_json::to_string(message)?;
    let mut frame = String::with_capacity(header.len() + code.len() + FRAME_SEPARATOR.len_utf8());
    frame.push_str(&header);
    frame.push(FRAME_SEPARATOR);
    frame.push_str(code);
    Ok(frame)
}

/// Split a frame at the first separator back into header and code
pub fn decode_frame(frame: &str) -> Option<(ServerMessage, &str)> {
    let (header, code) = frame.split_once(FRAME_SEPARATOR)?;
    let message = serde_json::from_str(header).ok()?;
    Some((message, code))
}

/// A live socket's claim on a channel
#[derive(Debug)]
pub struct Registration {
    pub generation: u64,
    pub outbox: mpsc::UnboundedReceiver<String>,
}

/// Server side of one session's socket
#[derive(Debug)]
pub struct HmrChannel {
    client_id: String,
    generations: AtomicU64,
    outbox: Mutex<Option<(u64, mpsc::UnboundedSender<String>)>>,
}

impl HmrChannel {
    pub fn new(client_id: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            generations: AtomicU64::new(0),
            outbox: Mutex::new(None),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Handle a register message.
    ///
    /// Returns the outbox that the socket writer drains, or `None` when the
    /// id belongs to another session. A second register replaces the first
    /// connection.
    pub fn register(&self, client_id: &str) -> Option<Registration> {
        if client_id != self.client_id {
            warn!(expected = %self.client_id, got = %client_id, "ignoring register for another client");
            return None;
        }
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, outbox) = mpsc::unbounded_channel();
        *self.outbox.lock().unwrap_or_else(PoisonError::into_inner) = Some((generation, tx));
        debug!(client = %self.client_id, generation, "client registered");
        Some(Registration { generation, outbox })
    }

    /// Drop the registration made as `generation`. Returns false when a newer
    /// socket has taken over since.
    pub fn unregister(&self, generation: u64) -> bool {
        let mut outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
        match outbox.as_ref() {
            Some((current, _)) if *current != generation => false,
            _ => {
                outbox.take();
                true
            }
        }
    }

    pub fn is_registered(&self) -> bool {
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|(_, tx)| !tx.is_closed())
    }

    /// Push one update frame.
    ///
    /// Returns whether the frame was handed to a connected socket. With no
    /// registered client the frame is dropped.
    pub fn send_update(&self, source_url: &str, modules_to_hot_replace: &[ModuleId], code: &str) -> Result<bool> {
        let message = ServerMessage::Update {
            source_url: source_url.to_string(),
            modules_to_hot_replace: modules_to_hot_replace.to_vec(),
        };
        let frame = encode_frame(&message, code)?;

        let mut outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
        let Some((_, tx)) = outbox.as_ref() else {
            trace!(client = %self.client_id, "no socket registered, dropping update");
            return Ok(false);
        };
        if tx.send(frame).is_err() {
            outbox.take();
            trace!(client = %self.client_id, "socket gone, dropping update");
            return Ok(false);
        }
        Ok(true)
    }
}
