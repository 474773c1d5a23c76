//! Join type definitions
//!
//! A join is one addressable signal exchanged with the control processor.
//! Signal kinds are parsed from their short names (`d`, `a`, `s`) once, at the
//! API boundary; everything past that point matches on [`SignalKind`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CipError;

/// Kind of signal carried by a join
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    /// Boolean signal
    Digital,
    /// Unsigned 16-bit value
    Analog,
    /// ASCII text
    Serial,
}

impl SignalKind {
    /// All signal kinds
    pub fn all() -> &'static [SignalKind] {
        &[SignalKind::Digital, SignalKind::Analog, SignalKind::Serial]
    }

    /// Short name used on the command line (`d`, `a`, `s`)
    pub fn short_name(&self) -> &'static str {
        match self {
            SignalKind::Digital => "d",
            SignalKind::Analog => "a",
            SignalKind::Serial => "s",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::Digital => write!(f, "digital"),
            SignalKind::Analog => write!(f, "analog"),
            SignalKind::Serial => write!(f, "serial"),
        }
    }
}

impl FromStr for SignalKind {
    type Err = CipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "d" | "digital" => Ok(SignalKind::Digital),
            "a" | "analog" => Ok(SignalKind::Analog),
            "s" | "serial" => Ok(SignalKind::Serial),
            other => Err(CipError::InvalidSignalKind(other.to_string())),
        }
    }
}

/// Which side last produced a join value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Processor → client
    Incoming,
    /// Client → processor
    Outgoing,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Incoming => write!(f, "in"),
            Direction::Outgoing => write!(f, "out"),
        }
    }
}

impl FromStr for Direction {
    type Err = CipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in" | "incoming" => Ok(Direction::Incoming),
            "out" | "outgoing" => Ok(Direction::Outgoing),
            other => Err(CipError::InvalidDirection(other.to_string())),
        }
    }
}

/// Value of a join
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JoinValue {
    Digital(bool),
    Analog(u16),
    Serial(String),
}

impl JoinValue {
    /// Value reported for a join that has never been set
    pub fn default_for(kind: SignalKind) -> Self {
        match kind {
            SignalKind::Digital => JoinValue::Digital(false),
            SignalKind::Analog => JoinValue::Analog(0),
            SignalKind::Serial => JoinValue::Serial(String::new()),
        }
    }

    /// Signal kind this value belongs to
    pub fn kind(&self) -> SignalKind {
        match self {
            JoinValue::Digital(_) => SignalKind::Digital,
            JoinValue::Analog(_) => SignalKind::Analog,
            JoinValue::Serial(_) => SignalKind::Serial,
        }
    }

    /// Parse a textual value for `kind`
    ///
    /// Digital accepts `0`/`1`/`true`/`false`/`on`/`off`; analog accepts
    /// decimal 0-65535; serial takes the text as-is.
    pub fn parse(kind: SignalKind, text: &str) -> Result<Self, CipError> {
        let invalid = || CipError::InvalidValue {
            kind,
            value: text.to_string(),
        };

        match kind {
            SignalKind::Digital => match text.to_ascii_lowercase().as_str() {
                "1" | "true" | "on" | "high" => Ok(JoinValue::Digital(true)),
                "0" | "false" | "off" | "low" => Ok(JoinValue::Digital(false)),
                _ => Err(invalid()),
            },
            SignalKind::Analog => text
                .parse::<u16>()
                .map(JoinValue::Analog)
                .map_err(|_| invalid()),
            SignalKind::Serial => Ok(JoinValue::Serial(text.to_string())),
        }
    }

    pub fn as_digital(&self) -> Option<bool> {
        match self {
            JoinValue::Digital(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_analog(&self) -> Option<u16> {
        match self {
            JoinValue::Analog(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_serial(&self) -> Option<&str> {
        match self {
            JoinValue::Serial(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for JoinValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinValue::Digital(v) => write!(f, "{}", u8::from(*v)),
            JoinValue::Analog(v) => write!(f, "{}", v),
            JoinValue::Serial(v) => write!(f, "{:?}", v),
        }
    }
}

impl From<bool> for JoinValue {
    fn from(value: bool) -> Self {
        JoinValue::Digital(value)
    }
}

impl From<u16> for JoinValue {
    fn from(value: u16) -> Self {
        JoinValue::Analog(value)
    }
}

impl From<&str> for JoinValue {
    fn from(value: &str) -> Self {
        JoinValue::Serial(value.to_string())
    }
}

impl From<String> for JoinValue {
    fn from(value: String) -> Self {
        JoinValue::Serial(value)
    }
}

/// A single join value change, either decoded from the wire or produced by
/// an API call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinEvent {
    pub kind: SignalKind,
    pub join: u16,
    pub direction: Direction,
    pub value: JoinValue,
}

impl JoinEvent {
    /// Build an event; the kind is taken from the value
    pub fn new(join: u16, direction: Direction, value: JoinValue) -> Self {
        Self {
            kind: value.kind(),
            join,
            direction,
            value,
        }
    }

    pub fn incoming(join: u16, value: impl Into<JoinValue>) -> Self {
        Self::new(join, Direction::Incoming, value.into())
    }

    pub fn outgoing(join: u16, value: impl Into<JoinValue>) -> Self {
        Self::new(join, Direction::Outgoing, value.into())
    }

    /// Store/subscription key of this event
    pub fn key(&self) -> JoinKey {
        JoinKey {
            kind: self.kind,
            join: self.join,
            direction: self.direction,
        }
    }
}

/// Address of a join in the state store and subscription registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JoinKey {
    pub kind: SignalKind,
    pub join: u16,
    pub direction: Direction,
}

impl JoinKey {
    pub fn new(kind: SignalKind, join: u16, direction: Direction) -> Self {
        Self {
            kind,
            join,
            direction,
        }
    }
}

impl fmt::Display for JoinKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {:04}", self.kind.short_name(), self.direction, self.join)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_kind_parsing() {
        assert_eq!("d".parse::<SignalKind>().unwrap(), SignalKind::Digital);
        assert_eq!("a".parse::<SignalKind>().unwrap(), SignalKind::Analog);
        assert_eq!("serial".parse::<SignalKind>().unwrap(), SignalKind::Serial);
        assert_eq!(
            "x".parse::<SignalKind>(),
            Err(CipError::InvalidSignalKind("x".to_string()))
        );
    }

    #[test]
    fn test_direction_parsing() {
        assert_eq!("in".parse::<Direction>().unwrap(), Direction::Incoming);
        assert_eq!("outgoing".parse::<Direction>().unwrap(), Direction::Outgoing);
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[test]
    fn test_value_parsing() {
        assert_eq!(
            JoinValue::parse(SignalKind::Digital, "1").unwrap(),
            JoinValue::Digital(true)
        );
        assert_eq!(
            JoinValue::parse(SignalKind::Digital, "OFF").unwrap(),
            JoinValue::Digital(false)
        );
        assert_eq!(
            JoinValue::parse(SignalKind::Analog, "65535").unwrap(),
            JoinValue::Analog(65535)
        );
        assert!(matches!(
            JoinValue::parse(SignalKind::Analog, "65536"),
            Err(CipError::InvalidValue { .. })
        ));
        assert!(JoinValue::parse(SignalKind::Digital, "2").is_err());
        assert_eq!(
            JoinValue::parse(SignalKind::Serial, "Hello Crestron!").unwrap(),
            JoinValue::Serial("Hello Crestron!".to_string())
        );
    }

    #[test]
    fn test_defaults() {
        assert_eq!(JoinValue::default_for(SignalKind::Digital), JoinValue::Digital(false));
        assert_eq!(JoinValue::default_for(SignalKind::Analog), JoinValue::Analog(0));
        assert_eq!(
            JoinValue::default_for(SignalKind::Serial),
            JoinValue::Serial(String::new())
        );
    }

    #[test]
    fn test_event_kind_follows_value() {
        let event = JoinEvent::outgoing(12, 32456u16);
        assert_eq!(event.kind, SignalKind::Analog);
        assert_eq!(event.key(), JoinKey::new(SignalKind::Analog, 12, Direction::Outgoing));
    }
}
