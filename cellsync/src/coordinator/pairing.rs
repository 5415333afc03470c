//! Pairing state of a cell.

use std::fmt;

use crate::config::CellRole;

/// Whether the cells execute shared plans jointly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pairing {
    #[default]
    Paired,
    Unpaired,
}

impl Pairing {
    /// From the payload of an `UNPAIR` signal.
    pub const fn from_unpaired(unpaired: bool) -> Self {
        if unpaired { Self::Unpaired } else { Self::Paired }
    }

    pub const fn is_unpaired(self) -> bool {
        matches!(self, Self::Unpaired)
    }
}

impl fmt::Display for Pairing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Paired => "paired",
            Self::Unpaired => "unpaired",
        })
    }
}

/// Health of the link as seen by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkHealth {
    #[default]
    Disconnected,
    /// Transport connected, handshake outstanding.
    Connected,
    Handshaked,
}

/// Which cells execute the current plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoleMode {
    #[default]
    Dual,
    /// Only the primary cell executes.
    SingleSidePrimary,
    /// Only the secondary cell executes.
    SingleSideSecondary,
}

impl RoleMode {
    /// Mode in which only the cell with `role` executes.
    pub const fn alone(role: CellRole) -> Self {
        match role {
            CellRole::Primary => Self::SingleSidePrimary,
            CellRole::Secondary => Self::SingleSideSecondary,
        }
    }

    /// True when a cell with `role` must forward phases to its peer.
    pub const fn involves_peer(self, role: CellRole) -> bool {
        matches!(
            (self, role),
            (Self::Dual, _)
                | (Self::SingleSideSecondary, CellRole::Primary)
                | (Self::SingleSidePrimary, CellRole::Secondary)
        )
    }
}

impl fmt::Display for RoleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Dual => "dual",
            Self::SingleSidePrimary => "primary only",
            Self::SingleSideSecondary => "secondary only",
        })
    }
}

/// Desired pairing, link health and role mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PairingState {
    pub desired: Pairing,
    pub health: LinkHealth,
    pub mode: RoleMode,
}

impl PairingState {
    /// Human-readable summary for operator displays.
    pub fn describe(&self, unpair_pending: bool, peer_pid: Option<u32>) -> String {
        match (self.health, self.desired) {
            (LinkHealth::Disconnected, desired) => format!("disconnected ({desired})"),
            (LinkHealth::Connected, _) => "connected, awaiting handshake".to_owned(),
            (LinkHealth::Handshaked, _) if unpair_pending => "pairing change pending".to_owned(),
            (LinkHealth::Handshaked, Pairing::Unpaired) => "unpaired".to_owned(),
            (LinkHealth::Handshaked, Pairing::Paired) => match peer_pid {
                Some(pid) => format!("paired with pid {pid} ({})", self.mode),
                None => format!("paired ({})", self.mode),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptions() {
        let mut state = PairingState::default();
        assert_eq!(state.describe(false, None), "disconnected (paired)");

        state.health = LinkHealth::Handshaked;
        assert_eq!(state.describe(true, Some(4)), "pairing change pending");
        assert_eq!(state.describe(false, Some(4)), "paired with pid 4 (dual)");

        state.desired = Pairing::Unpaired;
        assert_eq!(state.describe(false, Some(4)), "unpaired");
    }

    #[test]
    fn peer_involvement() {
        use CellRole::*;
        assert!(RoleMode::Dual.involves_peer(Primary));
        assert!(RoleMode::SingleSideSecondary.involves_peer(Primary));
        assert!(!RoleMode::SingleSidePrimary.involves_peer(Primary));
        assert!(!RoleMode::SingleSideSecondary.involves_peer(Secondary));
        assert_eq!(RoleMode::alone(Secondary), RoleMode::SingleSideSecondary);
    }
}
