use std::fmt;

/// State of the lite agent. The lite role never initiates checks, so the
/// machine only moves on signaling (`checking`), validated inbound checks
/// (`connected`) and the orchestrator's completion signal (`completed`).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IceLiteState {
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Closed,
}

impl Default for IceLiteState {
    fn default() -> Self {
        Self::New
    }
}

impl IceLiteState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

impl fmt::Display for IceLiteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::New => "New",
            Self::Checking => "Checking",
            Self::Connected => "Connected",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Closed => "Closed",
        };
        write!(f, "{s}")
    }
}
