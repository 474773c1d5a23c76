//! One CIP session: connect, register, synchronize, stay active
//!
//! The reader loop below is the protocol state machine. It owns the read half
//! of the socket and hands everything it wants written to the writer task.

use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{writer, ConnectionManager, ConnectionState, LinkError, LinkHandler, Outbound};
use crate::codec::{CipCodec, CipMessage, RegistrationResult, UpdateRequestKind};

type FrameStream = FramedRead<OwnedReadHalf, CipCodec>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Registering,
    Synchronizing,
    Active,
}

pub(super) struct Session<'a> {
    manager: &'a ConnectionManager,
    handler: &'a dyn LinkHandler,
    cancel: &'a CancellationToken,
    phase: Phase,
    /// Registration or synchronization deadline, depending on the phase
    deadline: Instant,
    activated: bool,
}

impl<'a> Session<'a> {
    pub(super) fn new(
        manager: &'a ConnectionManager,
        handler: &'a dyn LinkHandler,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            manager,
            handler,
            cancel,
            phase: Phase::Registering,
            deadline: Instant::now(),
            activated: false,
        }
    }

    /// Whether this session ever reached the active state
    pub(super) fn was_active(&self) -> bool {
        self.activated
    }

    /// Run the session to its end
    ///
    /// `Ok` means the session was stopped on request; any other ending is
    /// reported as the [`LinkError`] that caused it.
    pub(super) async fn run(&mut self) -> Result<(), LinkError> {
        let manager = self.manager;
        let config = manager.config();
        let addr = format!("{}:{}", config.host, config.port);

        self.manager.set_state(ConnectionState::Connecting);
        debug!("Connecting to {}", addr);

        let connect = timeout(
            config.connect_timeout(),
            TcpStream::connect((config.host.as_str(), config.port)),
        );
        let stream = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(()),
            result = connect => match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(source)) => return Err(LinkError::Connect { addr, source }),
                Err(_) => return Err(LinkError::ConnectTimeout { addr }),
            },
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle on CIP socket: {}", e);
        }
        info!("🔗 Connected to {}", addr);

        let (read_half, write_half) = stream.into_split();
        let mut frames = FramedRead::new(read_half, CipCodec::new());
        let session = self.cancel.child_token();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(writer::run(
            FramedWrite::new(write_half, CipCodec::new()),
            rx,
            session.clone(),
            self.cancel.clone(),
        ));

        self.phase = Phase::Registering;
        self.deadline = Instant::now() + config.registration_timeout();
        self.manager.set_state(ConnectionState::Registering);

        let outcome = self.drive(&mut frames, &tx, &session).await;

        // Cut API traffic off before the writer goes away
        self.manager.deactivate();
        session.cancel();
        drop(tx);
        let written = match writer.await {
            Ok(result) => result,
            Err(e) => Err(LinkError::WriterTask(e.to_string())),
        };

        if self.cancel.is_cancelled() {
            return Ok(());
        }
        match (outcome, written) {
            (Err(e), _) | (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => Err(LinkError::PeerClosed),
        }
    }

    async fn drive(
        &mut self,
        frames: &mut FrameStream,
        tx: &Outbound,
        session: &CancellationToken,
    ) -> Result<(), LinkError> {
        let manager = self.manager;
        let config = manager.config();
        let start = Instant::now();
        let mut last_rx = start;

        let mut heartbeat = interval_at(start + config.heartbeat_interval(), config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut repeat = interval_at(start + config.button_repeat(), config.button_repeat());
        repeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = match self.phase {
                Phase::Active => last_rx + config.heartbeat_timeout(),
                _ => self.deadline,
            };
            let active = self.phase == Phase::Active;

            tokio::select! {
                biased;
                _ = session.cancelled() => return Ok(()),
                frame = frames.next() => match frame {
                    None => return Err(LinkError::PeerClosed),
                    Some(Err(e)) => return Err(LinkError::Framing(e)),
                    Some(Ok(Err(e))) => {
                        last_rx = Instant::now();
                        warn!("⚠️ Dropped malformed CIP frame: {}", e);
                    }
                    Some(Ok(Ok(message))) => {
                        last_rx = Instant::now();
                        self.handle(message, tx)?;
                    }
                },
                _ = sleep_until(deadline) => match self.phase {
                    Phase::Registering => {
                        return Err(LinkError::RegistrationTimeout(config.registration_timeout()));
                    }
                    Phase::Synchronizing => {
                        warn!(
                            "⏱️ No end-of-query within {}ms, going active anyway",
                            config.sync_timeout_ms
                        );
                        self.go_active(tx);
                    }
                    Phase::Active => {
                        return Err(LinkError::HeartbeatTimeout(config.heartbeat_timeout()));
                    }
                },
                _ = heartbeat.tick(), if active => {
                    trace!("💓 Sending heartbeat");
                    let _ = tx.send(vec![CipMessage::Heartbeat]);
                }
                _ = repeat.tick(), if active => {
                    self.manager.submit(|| self.handler.keep_alive_frames());
                }
            }
        }
    }

    fn handle(&mut self, message: CipMessage, tx: &Outbound) -> Result<(), LinkError> {
        let ip_id = self.manager.config().ip_id;

        match message {
            CipMessage::RegistrationRequest => {
                debug!("Processor requested registration, sending IP-ID 0x{:02x}", ip_id);
                let _ = tx.send(vec![CipMessage::Register { ip_id }]);
            }
            CipMessage::RegistrationResult(RegistrationResult::Accepted) => {
                if self.phase != Phase::Registering {
                    debug!("Ignoring repeated registration result");
                    return Ok(());
                }
                info!("✅ Registered with IP-ID 0x{:02x}", ip_id);
                self.phase = Phase::Synchronizing;
                self.deadline = Instant::now() + self.manager.config().sync_timeout();
                self.manager.set_state(ConnectionState::Synchronizing);
                let _ = tx.send(vec![CipMessage::UpdateRequest(UpdateRequestKind::Standard)]);
            }
            CipMessage::RegistrationResult(RegistrationResult::UnknownIpId) => {
                error!("❌ IP-ID 0x{:02x} does not exist on the processor", ip_id);
                return Err(LinkError::RegistrationRejected(ip_id));
            }
            CipMessage::RegistrationResult(RegistrationResult::Failed(raw)) => {
                error!("❌ Registration failed (reply {})", hex::encode(&raw));
                return Err(LinkError::RegistrationFailed(hex::encode(raw)));
            }
            CipMessage::ProcessorDisconnect => return Err(LinkError::ProcessorDisconnect),
            CipMessage::Heartbeat | CipMessage::HeartbeatResponse => {
                trace!("💓 Heartbeat from processor");
            }
            CipMessage::UpdateRequest(UpdateRequestKind::EndOfQuery) => {
                debug!("End of query, acknowledging");
                let _ = tx.send(vec![
                    CipMessage::UpdateRequest(UpdateRequestKind::EndOfQueryAck),
                    CipMessage::Heartbeat,
                ]);
                if self.phase == Phase::Synchronizing {
                    self.go_active(tx);
                }
            }
            CipMessage::UpdateRequest(kind) => debug!("Update request {:?}", kind),
            CipMessage::DateTime(at) => {
                debug!("🕒 Processor time {}", at);
                self.handler.on_processor_time(at);
            }
            CipMessage::Register { .. } => debug!("Ignoring registration frame from processor"),
            other => {
                if let Some(event) = other.join_event() {
                    trace!("📥 {} = {}", event.key(), event.value);
                    self.handler.on_join(event);
                }
            }
        }
        Ok(())
    }

    fn go_active(&mut self, tx: &Outbound) {
        self.phase = Phase::Active;
        self.activated = true;
        self.manager.activate(tx.clone(), || self.handler.resync_frames());
        self.manager.set_state(ConnectionState::Active);
        info!("🟢 CIP link active");
    }
}
