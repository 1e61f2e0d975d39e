//! Bridge lifecycle: which directions have reached EOF and whether the bridge
//! has been torn down.

/// Side of the bridge that reported EOF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The local endpoint stopped sending.
    Local,
    /// The remote connection stopped sending.
    Remote,
}

/// Bridge state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Both directions open
    Active,
    /// One side reached EOF, the other direction still flows
    HalfClosed(Side),
    /// Torn down
    Closed,
}

/// What the bridge must do after an EOF was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EofAction {
    /// Propagate the EOF as a write-side shutdown of the opposite endpoint.
    HalfClose,
    /// Both directions are finished.
    Teardown,
    /// Already closed, or this side already reported EOF.
    Ignore,
}

impl BridgeState {
    /// Record EOF from `side`.
    ///
    /// Connectionless endpoints have no half-close, so any EOF finishes them.
    pub(crate) fn on_eof(&mut self, side: Side, connectionless: bool) -> EofAction {
        match *self {
            BridgeState::Closed => EofAction::Ignore,
            BridgeState::HalfClosed(prev) if prev == side => EofAction::Ignore,
            BridgeState::HalfClosed(_) => EofAction::Teardown,
            BridgeState::Active if connectionless => EofAction::Teardown,
            BridgeState::Active => {
                *self = BridgeState::HalfClosed(side);
                EofAction::HalfClose
            }
        }
    }

    /// Move to `Closed`. Returns `true` only for the call that performed the
    /// transition.
    pub(crate) fn close(&mut self) -> bool {
        if *self == BridgeState::Closed {
            return false;
        }
        *self = BridgeState::Closed;
        true
    }

    pub fn is_closed(&self) -> bool {
        *self == BridgeState::Closed
    }

    pub fn local_eof(&self) -> bool {
        matches!(self, BridgeState::HalfClosed(Side::Local))
    }

    pub fn remote_eof(&self) -> bool {
        matches!(self, BridgeState::HalfClosed(Side::Remote))
    }
}
