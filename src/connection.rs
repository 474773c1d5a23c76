//! Connection manager - owns the CIP link lifecycle
//!
//! The supervisor loop connects, runs one [`session`] until it ends, reports
//! the loss, backs off and connects again, until `stop()` cancels it.
//! A session is the registration → synchronization → active exchange over a
//! single TCP connection.
//!
//! Outbound traffic from API calls goes through [`ConnectionManager::submit`]:
//! the state update and the decision to put frames on the wire happen under
//! one lock, the same lock the session takes when it goes active and re-sends
//! the outgoing mirror. A value recorded while the link is down is therefore
//! either picked up by the re-send or sent by the call itself.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{CipMessage, CodecError};
use crate::config::ClientConfig;
use crate::error::CipError;
use crate::join::JoinEvent;

mod session;
mod writer;

#[cfg(test)]
mod tests;

/// Lifecycle state of the client's link to the processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Registering,
    Synchronizing,
    Active,
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Registering => "registering",
            ConnectionState::Synchronizing => "synchronizing",
            ConnectionState::Active => "active",
            ConnectionState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Callback invoked on every connection state transition
pub type StateCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Why a session ended
///
/// These never reach API callers; the supervisor logs them and reconnects.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("connection to {addr} timed out")]
    ConnectTimeout { addr: String },

    #[error("IP-ID 0x{0:02x} does not exist on the processor")]
    RegistrationRejected(u8),

    #[error("registration failed (reply {0})")]
    RegistrationFailed(String),

    #[error("no registration result within {0:?}")]
    RegistrationTimeout(Duration),

    #[error("no traffic from the processor within {0:?}")]
    HeartbeatTimeout(Duration),

    #[error("processor ended the session")]
    ProcessorDisconnect,

    #[error("connection closed by the processor")]
    PeerClosed,

    #[error("unrecoverable framing error: {0}")]
    Framing(#[source] CodecError),

    #[error("write failed: {0}")]
    Write(#[source] CodecError),

    #[error("writer task failed: {0}")]
    WriterTask(String),
}

/// What the connection needs from the rest of the client
///
/// Called from the connection task; implementations must not block.
pub trait LinkHandler: Send + Sync {
    /// A join update arrived from the processor
    fn on_join(&self, event: JoinEvent);

    /// The processor reported its clock
    fn on_processor_time(&self, at: NaiveDateTime);

    /// Frames re-sent when the link goes active
    fn resync_frames(&self) -> Vec<CipMessage>;

    /// Frames repeated every button-repeat tick while active
    fn keep_alive_frames(&self) -> Vec<CipMessage>;

    /// The session ended; runs after outbound traffic has been cut off
    fn on_link_lost(&self);
}

/// Sender half of the active session's writer queue; each batch goes out
/// back-to-back
type Outbound = UnboundedSender<Vec<CipMessage>>;

pub struct ConnectionManager {
    config: ClientConfig,
    state: RwLock<ConnectionState>,
    /// Held while a transition is published, so callbacks see every state in order
    callbacks: Mutex<Vec<StateCallback>>,
    /// Present only while a session is active
    outbound: Mutex<Option<Outbound>>,
}

impl ConnectionManager {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            state: RwLock::new(ConnectionState::Disconnected),
            callbacks: Mutex::new(Vec::new()),
            outbound: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_active(&self) -> bool {
        self.outbound.lock().is_some()
    }

    /// Register a state callback; it is called right away with the current state
    ///
    /// Callbacks must not register further callbacks.
    pub fn subscribe_state(&self, callback: StateCallback) {
        let mut callbacks = self.callbacks.lock();
        callback(self.state());
        callbacks.push(callback);
    }

    /// Publish a transition
    ///
    /// Once `Closing` is published only `Disconnected` may follow, so a
    /// session still starting up cannot report progress after a stop.
    pub(crate) fn set_state(&self, state: ConnectionState) {
        let callbacks = self.callbacks.lock();
        {
            let mut current = self.state.write();
            if *current == state {
                return;
            }
            if *current == ConnectionState::Closing && state != ConnectionState::Disconnected {
                debug!("Ignoring {} while closing", state);
                return;
            }
            debug!("Connection state {} -> {}", *current, state);
            *current = state;
        }

        for callback in callbacks.iter() {
            callback(state);
        }
    }

    /// Run `record` and queue the frames it returns as one uninterrupted burst
    ///
    /// `record` runs in any state; its frames are discarded unless a session
    /// is active. Returns whether the frames were queued.
    pub fn submit<F>(&self, record: F) -> bool
    where
        F: FnOnce() -> Vec<CipMessage>,
    {
        let outbound = self.outbound.lock();
        let batch = record();
        match outbound.as_ref() {
            Some(tx) if !batch.is_empty() => tx.send(batch).is_ok(),
            _ => false,
        }
    }

    /// Queue frames that only make sense on an active link
    pub fn send(&self, batch: Vec<CipMessage>) -> Result<(), CipError> {
        let outbound = self.outbound.lock();
        let tx = outbound.as_ref().ok_or(CipError::NotConnected)?;
        tx.send(batch).map_err(|_| CipError::NotConnected)
    }

    /// Publish the session's writer queue, queueing `resync` first
    fn activate<F>(&self, tx: Outbound, resync: F)
    where
        F: FnOnce() -> Vec<CipMessage>,
    {
        let mut outbound = self.outbound.lock();
        let batch = resync();
        if !batch.is_empty() {
            debug!("Re-sending {} outgoing join(s)", batch.len());
            let _ = tx.send(batch);
        }
        *outbound = Some(tx);
    }

    fn deactivate(&self) {
        self.outbound.lock().take();
    }

    /// Connect, run sessions and reconnect until `cancel` fires
    pub async fn run(self: Arc<Self>, handler: Arc<dyn LinkHandler>, cancel: CancellationToken) {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        info!("🚀 CIP client starting (processor {}, IP-ID 0x{:02x})", addr, self.config.ip_id);

        let mut retry_count: u32 = 0;
        loop {
            let mut session = session::Session::new(&self, handler.as_ref(), &cancel);
            let result = session.run().await;
            let was_active = session.was_active();
            drop(session);

            handler.on_link_lost();

            match result {
                Ok(()) => break,
                Err(e) if was_active => warn!("🔌 Lost connection to {}: {}", addr, e),
                Err(e) => warn!("❌ Connection attempt to {} failed: {}", addr, e),
            }

            if cancel.is_cancelled() {
                break;
            }
            self.set_state(ConnectionState::Disconnected);

            retry_count = if was_active { 1 } else { retry_count.saturating_add(1) };
            let delay = self.config.reconnect_delay(retry_count);
            info!("⏳ CIP reconnect #{} in {}ms", retry_count, delay.as_millis());

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("🛑 CIP client stopped");
    }
}
