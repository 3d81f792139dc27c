use crate::provider::CmEventKind;

/// Connection-level event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnEvent {
    /// The connection is established and ready for data-plane operations.
    Established,

    /// The connection was closed by either side.
    Closed,

    /// The connection was lost: a connection error, an unreachable peer or a
    /// removed device.
    Lost,

    /// The peer rejected the connection request.
    Rejected,

    /// An event with no meaning at the connection level, such as a
    /// connection request showing up where none was expected.
    Undefined,
}

impl ConnEvent {
    /// Map a connection-manager event.
    pub(crate) fn from_cm(kind: CmEventKind) -> Self {
        match kind {
            CmEventKind::Established => Self::Established,
            CmEventKind::Disconnected | CmEventKind::TimewaitExit => Self::Closed,
            CmEventKind::ConnectError | CmEventKind::Unreachable | CmEventKind::DeviceRemoval => {
                Self::Lost
            }
            CmEventKind::Rejected => Self::Rejected,
            _ => Self::Undefined,
        }
    }
}

/// State of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
    /// Connect or accept was issued; waiting for [`ConnEvent::Established`].
    Connecting,

    /// Data-plane operations are allowed.
    Established,

    Closed,
    Lost,
    Rejected,
}

impl ConnState {
    /// State after the given event, or `None` if the event does not move the
    /// state machine.
    pub(crate) fn after(event: ConnEvent) -> Option<Self> {
        match event {
            ConnEvent::Established => Some(Self::Established),
            ConnEvent::Closed => Some(Self::Closed),
            ConnEvent::Lost => Some(Self::Lost),
            ConnEvent::Rejected => Some(Self::Rejected),
            ConnEvent::Undefined => None,
        }
    }
}
