pub mod edge;

use std::fmt;

/// Ordinal slot (`0..N`) of one of the N concurrent edge connections.
///
/// A slot keeps its index across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnIndex(u8);

impl ConnIndex {
    pub fn new(index: u8) -> Self {
        Self(index)
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl From<u8> for ConnIndex {
    fn from(index: u8) -> Self {
        Self(index)
    }
}

impl fmt::Display for ConnIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, strum::Display, strum::EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    Connected,
    Reconnecting,
    RegisteringTunnel,
    Unregistering,
    Disconnected,
    /// Edge hostname assigned to the connection.
    #[strum(to_string = "set_url")]
    SetUrl(String),
}

impl EventKind {
    /// Whether this event describes a connection that serves traffic.
    ///
    /// `None` for events that carry data but no state change.
    pub fn serving(&self) -> Option<bool> {
        match self {
            EventKind::Connected => Some(true),
            EventKind::Reconnecting
            | EventKind::RegisteringTunnel
            | EventKind::Unregistering
            | EventKind::Disconnected => Some(false),
            EventKind::SetUrl(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub index: ConnIndex,
    pub kind: EventKind,
}

impl Event {
    pub fn new(index: impl Into<ConnIndex>, kind: EventKind) -> Self {
        Self {
            index: index.into(),
            kind,
        }
    }
}

/// Consumer of connection lifecycle events.
pub trait EventSink: Send + Sync {
    fn on_tunnel_event(&self, event: Event);
}
