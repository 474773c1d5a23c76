//! cipclient - client for Crestron control processors over CIP
//!
//! Keeps a local mirror of digital, analog and serial joins in sync with a
//! processor over a persistent TCP connection, with automatic registration,
//! resynchronization, heartbeats and reconnects.
//!
//! ```no_run
//! use cipclient::{CipClient, ClientConfig, Direction, JoinValue, SignalKind};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let client = CipClient::new(ClientConfig::new("192.168.1.50", 0x03))?;
//! client.subscribe(SignalKind::Digital, 1, Direction::Incoming, |kind: SignalKind, join: u16, value: &JoinValue| {
//!     println!("{kind} {join} = {value}");
//! });
//! client.start().await?;
//! client.set(SignalKind::Analog, 12, 32456u16)?;
//! client.pulse(5)?;
//! client.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod join;
pub mod press;
pub mod state;

pub use client::CipClient;
pub use config::{ClientConfig, JoinLimits};
pub use connection::{ConnectionState, LinkError};
pub use dispatch::{SignalObserver, SubscriptionId};
pub use error::CipError;
pub use join::{Direction, JoinEvent, JoinKey, JoinValue, SignalKind};
