//! Dispatch engine - delivers join changes to observers off the I/O path
//!
//! Changed events are queued on a crossbeam channel and delivered by a
//! dedicated OS thread, so a slow observer never stalls frame decoding or
//! heartbeats. Each observer call is isolated with `catch_unwind`: a panic
//! is logged and delivery continues with the next observer.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, error, warn};

use crate::join::JoinEvent;

mod registry;

pub use registry::{SignalObserver, SubscriptionId, SubscriptionRegistry};

enum DispatchMessage {
    Event(JoinEvent),
    /// Acknowledged once everything queued before it was delivered
    Flush(Sender<()>),
}

/// Owns the dispatch thread
///
/// Dropping it closes the queue. Outside a tokio runtime the drop also waits
/// for queued events to be delivered.
pub struct Dispatcher {
    registry: Arc<SubscriptionRegistry>,
    tx: Option<Sender<DispatchMessage>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Dispatcher {
    pub fn spawn(registry: Arc<SubscriptionRegistry>) -> anyhow::Result<Self> {
        let (tx, rx) = channel::unbounded();
        let thread_registry = Arc::clone(&registry);

        let thread = thread::Builder::new()
            .name("cip-dispatch".to_string())
            .spawn(move || run(rx, thread_registry))
            .context("Failed to spawn dispatch thread")?;

        Ok(Self {
            registry,
            tx: Some(tx),
            thread: Some(thread),
        })
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Queue a changed event for delivery; never blocks
    pub fn enqueue(&self, event: JoinEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(DispatchMessage::Event(event)).is_err() {
                warn!("⚠️ Dispatch thread is gone, dropping event");
            }
        }
    }

    /// Block until every event queued so far has been delivered
    ///
    /// Returns `false` without waiting when called from an observer.
    pub fn flush(&self) -> bool {
        if self.is_dispatch_thread() {
            return false;
        }
        let Some(tx) = &self.tx else {
            return false;
        };

        let (ack_tx, ack_rx) = channel::bounded(1);
        if tx.send(DispatchMessage::Flush(ack_tx)).is_err() {
            return false;
        }
        ack_rx.recv().is_ok()
    }

    fn is_dispatch_thread(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|handle| handle.thread().id() == thread::current().id())
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Closing the channel ends the thread's receive loop
        self.tx.take();

        let Some(handle) = self.thread.take() else {
            return;
        };
        // The last client handle may be released by an observer, or by the
        // connection task on a runtime worker; the thread then finishes the
        // queue on its own
        if handle.thread().id() == thread::current().id()
            || tokio::runtime::Handle::try_current().is_ok()
        {
            return;
        }
        if handle.join().is_err() {
            warn!("⚠️ Dispatch thread terminated abnormally");
        }
    }
}

fn run(rx: Receiver<DispatchMessage>, registry: Arc<SubscriptionRegistry>) {
    debug!("Dispatch thread started");

    for message in rx.iter() {
        match message {
            DispatchMessage::Event(event) => deliver(&registry, &event),
            DispatchMessage::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }

    debug!("Dispatch thread stopped");
}

fn deliver(registry: &SubscriptionRegistry, event: &JoinEvent) {
    for (id, observer) in registry.observers_for(&event.key()) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            observer.on_change(event.kind, event.join, &event.value)
        }));

        if let Err(payload) = result {
            error!(
                "💥 Observer #{} for {} panicked: {}",
                id,
                event.key(),
                panic_text(&*payload)
            );
        }
    }
}

/// The message of a `catch_unwind` payload, when it carries one
fn panic_text<'a>(payload: &'a (dyn Any + Send + 'static)) -> &'a str {
    payload
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| payload.downcast_ref::<&'static str>().copied())
        .unwrap_or("<non-string panic payload>")
}
