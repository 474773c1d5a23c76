//! Tests for the connection manager's state and outbound bookkeeping

use super::*;
use tokio::sync::mpsc;

fn manager() -> ConnectionManager {
    ConnectionManager::new(ClientConfig::new("127.0.0.1", 0x03))
}

#[test]
fn test_state_callback_gets_current_state_first() {
    let manager = manager();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&seen);
    manager.subscribe_state(Arc::new(move |state| sink.lock().push(state)));

    manager.set_state(ConnectionState::Connecting);
    manager.set_state(ConnectionState::Connecting);
    manager.set_state(ConnectionState::Registering);

    assert_eq!(
        *seen.lock(),
        vec![
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Registering,
        ]
    );
    assert_eq!(manager.state(), ConnectionState::Registering);
}

#[test]
fn test_state_subscriber_sees_every_later_transition() {
    let manager = Arc::new(manager());
    let flipper = {
        let manager = Arc::clone(&manager);
        std::thread::spawn(move || {
            for i in 0..2000 {
                let state = if i % 2 == 0 {
                    ConnectionState::Connecting
                } else {
                    ConnectionState::Registering
                };
                manager.set_state(state);
            }
        })
    };

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    manager.subscribe_state(Arc::new(move |state| sink.lock().push(state)));
    flipper.join().unwrap();

    let seen = seen.lock();
    assert_eq!(seen.last(), Some(&manager.state()));
    assert!(seen.windows(2).all(|pair| pair[0] != pair[1]));
}

#[test]
fn test_closing_only_gives_way_to_disconnected() {
    let manager = manager();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    manager.subscribe_state(Arc::new(move |state| sink.lock().push(state)));

    manager.set_state(ConnectionState::Active);
    manager.set_state(ConnectionState::Closing);
    manager.set_state(ConnectionState::Connecting);
    manager.set_state(ConnectionState::Registering);
    assert_eq!(manager.state(), ConnectionState::Closing);

    manager.set_state(ConnectionState::Disconnected);
    manager.set_state(ConnectionState::Connecting);

    assert_eq!(
        *seen.lock(),
        vec![
            ConnectionState::Disconnected,
            ConnectionState::Active,
            ConnectionState::Closing,
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
        ]
    );
}

#[test]
fn test_submit_records_but_does_not_send_while_inactive() {
    let manager = manager();
    let mut recorded = false;

    let sent = manager.submit(|| {
        recorded = true;
        vec![CipMessage::Digital { join: 1, value: true }]
    });

    assert!(recorded);
    assert!(!sent);
    assert!(!manager.is_active());
    assert_eq!(manager.send(vec![CipMessage::Heartbeat]), Err(CipError::NotConnected));
}

#[test]
fn test_activation_queues_resync_before_later_traffic() {
    let manager = manager();
    let (tx, mut rx) = mpsc::unbounded_channel();

    manager.activate(tx, || vec![CipMessage::Analog { join: 12, value: 32456 }]);
    assert!(manager.is_active());

    assert!(manager.submit(|| vec![
        CipMessage::Digital { join: 1, value: true },
        CipMessage::Digital { join: 1, value: false },
    ]));
    manager.send(vec![CipMessage::Heartbeat]).unwrap();

    assert_eq!(rx.try_recv().unwrap(), vec![CipMessage::Analog { join: 12, value: 32456 }]);
    assert_eq!(
        rx.try_recv().unwrap(),
        vec![
            CipMessage::Digital { join: 1, value: true },
            CipMessage::Digital { join: 1, value: false },
        ]
    );
    assert_eq!(rx.try_recv().unwrap(), vec![CipMessage::Heartbeat]);

    manager.deactivate();
    assert!(!manager.submit(|| vec![CipMessage::Heartbeat]));
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_empty_batches_are_not_queued() {
    let manager = manager();
    let (tx, mut rx) = mpsc::unbounded_channel();
    manager.activate(tx, Vec::new);

    assert!(!manager.submit(Vec::new));
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_state_display() {
    assert_eq!(ConnectionState::Synchronizing.to_string(), "synchronizing");
    assert_eq!(ConnectionState::Active.to_string(), "active");
}

#[test]
fn test_link_error_messages() {
    assert_eq!(
        LinkError::RegistrationRejected(0x03).to_string(),
        "IP-ID 0x03 does not exist on the processor"
    );
    assert_eq!(
        LinkError::ConnectTimeout {
            addr: "10.0.0.1:41794".to_string()
        }
        .to_string(),
        "connection to 10.0.0.1:41794 timed out"
    );
}
