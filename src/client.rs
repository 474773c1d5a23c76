//! CIP client - public API
//!
//! A [`CipClient`] owns the join mirror, the subscription registry and
//! dispatch thread, the press-safety monitor and the connection manager.
//! `start()` launches the connection task; everything else works whether or
//! not the link is up. Outgoing values set while disconnected are kept in the
//! mirror and sent when the link next goes active.

use std::sync::Arc;

use chrono::NaiveDateTime;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{CipMessage, UpdateRequestKind};
use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, ConnectionState, LinkHandler, StateCallback};
use crate::dispatch::{Dispatcher, SignalObserver, SubscriptionId, SubscriptionRegistry};
use crate::error::CipError;
use crate::join::{Direction, JoinEvent, JoinKey, JoinValue, SignalKind};
use crate::press::PressSafetyMonitor;
use crate::state::JoinStateStore;


/// State shared between API calls and the connection task
struct Shared {
    store: JoinStateStore,
    dispatcher: Dispatcher,
    press: PressSafetyMonitor,
}

impl Shared {
    /// Apply an event to the mirror, queueing dispatch if it changed a value
    fn record(&self, event: &JoinEvent) {
        self.store
            .apply_with(event, |changed| self.dispatcher.enqueue(changed.clone()));
    }
}

impl LinkHandler for Shared {
    fn on_join(&self, event: JoinEvent) {
        self.record(&event);
    }

    fn on_processor_time(&self, at: NaiveDateTime) {
        self.store.set_processor_time(at);
    }

    fn resync_frames(&self) -> Vec<CipMessage> {
        self.store
            .snapshot(Direction::Outgoing)
            .iter()
            .map(|event| {
                let latching = event.kind == SignalKind::Digital && self.press.is_pressed(event.join);
                CipMessage::for_event(event, latching)
            })
            .collect()
    }

    fn keep_alive_frames(&self) -> Vec<CipMessage> {
        self.press.keep_alive_frames(&self.store)
    }

    fn on_link_lost(&self) {
        self.press.force_release(|event| self.record(event));
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Client for one control processor
pub struct CipClient {
    shared: Arc<Shared>,
    manager: Arc<ConnectionManager>,
    running: Mutex<Option<Running>>,
}

impl CipClient {
    /// Create a client; nothing connects until [`start`](Self::start)
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let dispatcher = Dispatcher::spawn(Arc::new(SubscriptionRegistry::new()))?;
        let shared = Arc::new(Shared {
            store: JoinStateStore::new(),
            dispatcher,
            press: PressSafetyMonitor::new(),
        });

        Ok(Self {
            shared,
            manager: Arc::new(ConnectionManager::new(config)),
            running: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        self.manager.config()
    }

    /// Launch the connection task; a no-op if already running
    ///
    /// Returns as soon as the task is launched. Connection progress is
    /// reported through [`connection_state`](Self::connection_state).
    pub async fn start(&self) -> Result<(), CipError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| CipError::NoRuntime)?;

        let mut running = self.running.lock();
        if running.is_some() {
            debug!("CIP client already started");
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let handler: Arc<dyn LinkHandler> = self.shared.clone();
        let task = runtime.spawn(Arc::clone(&self.manager).run(handler, cancel.clone()));

        *running = Some(Running { cancel, task });
        Ok(())
    }

    /// Close the link and stop reconnecting; a no-op if not running
    ///
    /// Returns once the connection task has finished and the socket is closed.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return;
        };

        info!("🛑 Stopping CIP client");
        self.manager.set_state(ConnectionState::Closing);
        running.cancel.cancel();
        if let Err(e) = running.task.await {
            warn!("⚠️ Connection task ended abnormally: {}", e);
        }
        self.manager.set_state(ConnectionState::Disconnected);
    }

    /// Ask the processor to retransmit the state of all its joins
    pub fn update_request(&self) -> Result<(), CipError> {
        debug!("Requesting full update");
        self.manager
            .send(vec![CipMessage::UpdateRequest(UpdateRequestKind::Standard)])
    }

    /// Set an outgoing join
    ///
    /// The outgoing mirror is updated immediately. The frame is sent if the
    /// link is active, otherwise the value goes out when it next becomes
    /// active.
    pub fn set(&self, kind: SignalKind, join: u16, value: impl Into<JoinValue>) -> Result<(), CipError> {
        let value = value.into();
        self.check_join(kind, join)?;
        self.check_value(kind, &value)?;

        let event = JoinEvent::new(join, Direction::Outgoing, value);
        self.manager.submit(|| {
            self.shared.record(&event);
            vec![CipMessage::for_event(&event, false)]
        });
        Ok(())
    }

    /// Hold a digital join high with the latching ("button") frame
    ///
    /// The processor releases latching joins itself if the client goes
    /// silent; while the link is up the press is repeated to keep it held.
    pub fn press(&self, join: u16) -> Result<(), CipError> {
        self.check_join(SignalKind::Digital, join)?;

        self.manager.submit(|| {
            self.shared
                .press
                .mark_pressed_with(join, || self.shared.record(&JoinEvent::outgoing(join, true)));
            vec![CipMessage::DigitalLatching { join, value: true }]
        });
        Ok(())
    }

    /// Release a pressed digital join
    pub fn release(&self, join: u16) -> Result<(), CipError> {
        self.check_join(SignalKind::Digital, join)?;

        self.manager.submit(|| {
            self.shared
                .press
                .mark_released_with(join, || self.shared.record(&JoinEvent::outgoing(join, false)));
            vec![CipMessage::DigitalLatching { join, value: false }]
        });
        Ok(())
    }

    /// Send high then low for a digital join as one uninterrupted burst
    pub fn pulse(&self, join: u16) -> Result<(), CipError> {
        self.check_join(SignalKind::Digital, join)?;

        self.manager.submit(|| {
            self.shared.press.mark_released_with(join, || {
                self.shared.record(&JoinEvent::outgoing(join, true));
                self.shared.record(&JoinEvent::outgoing(join, false));
            });
            vec![
                CipMessage::Digital { join, value: true },
                CipMessage::Digital { join, value: false },
            ]
        });
        Ok(())
    }

    /// Last known value of a join; the kind's default if never seen
    pub fn get(&self, kind: SignalKind, join: u16, direction: Direction) -> JoinValue {
        self.shared.store.read(kind, join, direction)
    }

    /// Call `observer` on every value change of (kind, join, direction)
    pub fn subscribe<O>(&self, kind: SignalKind, join: u16, direction: Direction, observer: O) -> SubscriptionId
    where
        O: SignalObserver + 'static,
    {
        self.shared
            .dispatcher
            .registry()
            .subscribe(JoinKey::new(kind, join, direction), Arc::new(observer))
    }

    /// Returns `false` if the subscription did not exist
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.dispatcher.registry().unsubscribe(id)
    }

    /// All known joins for one direction
    pub fn snapshot(&self, direction: Direction) -> Vec<JoinEvent> {
        self.shared.store.snapshot(direction)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Register a callback for connection state changes
    ///
    /// The callback is invoked immediately with the current state, then on
    /// every transition, from the connection task.
    pub fn subscribe_connection_state<F>(&self, callback: F)
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        let callback: StateCallback = Arc::new(callback);
        self.manager.subscribe_state(callback);
    }

    /// Processor clock from the most recent date/time frame
    pub fn processor_time(&self) -> Option<NaiveDateTime> {
        self.shared.store.processor_time()
    }

    pub fn is_pressed(&self, join: u16) -> bool {
        self.shared.press.is_pressed(join)
    }

    /// Digital joins currently held by [`press`](Self::press)
    pub fn pressed_joins(&self) -> Vec<u16> {
        self.shared.press.pressed()
    }

    fn check_join(&self, kind: SignalKind, join: u16) -> Result<(), CipError> {
        let max = self.config().joins.max_for(kind);
        if join == 0 || join > max {
            return Err(CipError::JoinOutOfRange { kind, join, max });
        }
        Ok(())
    }

    fn check_value(&self, kind: SignalKind, value: &JoinValue) -> Result<(), CipError> {
        if value.kind() != kind {
            return Err(CipError::KindMismatch {
                expected: kind,
                actual: value.kind(),
            });
        }

        if let JoinValue::Serial(text) = value {
            let max = self.config().max_serial_length;
            if text.len() > max {
                return Err(CipError::SerialTooLong { len: text.len(), max });
            }
            if !text.is_ascii() {
                return Err(CipError::SerialNotAscii);
            }
        }
        Ok(())
    }
}

impl Drop for CipClient {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}
