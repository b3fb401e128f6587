use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::hypervisor::MachineState;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The hypervisor-independent state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    /// On its way to another state.
    Pending,

    /// Up.
    Running,

    /// Powered off, and can be resumed.
    Suspended,

    /// Gone.
    Terminated,

    /// Failed.
    Error,

    /// In a state vboxcore does not know.
    Unrecognized,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl NodeState {
    /// The state's upper-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Pending => "PENDING",
            NodeState::Running => "RUNNING",
            NodeState::Suspended => "SUSPENDED",
            NodeState::Terminated => "TERMINATED",
            NodeState::Error => "ERROR",
            NodeState::Unrecognized => "UNRECOGNIZED",
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Maps a native machine state onto a node state.
///
/// This is the only place native states are interpreted. Transient states read as
/// [`NodeState::Pending`].
pub fn node_state(state: MachineState) -> NodeState {
    match state {
        MachineState::Running => NodeState::Running,
        MachineState::PoweredOff => NodeState::Suspended,
        MachineState::Starting
        | MachineState::Stopping
        | MachineState::Restoring
        | MachineState::SettingUp
        | MachineState::LiveSnapshotting
        | MachineState::DeletingSnapshot
        | MachineState::DeletingSnapshotOnline
        | MachineState::DeletingSnapshotPaused
        | MachineState::FaultTolerantSyncing
        | MachineState::Teleported
        | MachineState::TeleportingIn
        | MachineState::TeleportingPausedVm
        | MachineState::FirstOnline
        | MachineState::LastOnline
        | MachineState::FirstTransient
        | MachineState::LastTransient => NodeState::Pending,
        MachineState::Aborted | MachineState::Stuck => NodeState::Error,
        MachineState::Null => NodeState::Unrecognized,
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<MachineState> for NodeState {
    fn from(state: MachineState) -> Self {
        node_state(state)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_machine_state_maps() {
        for state in MachineState::ALL {
            let mapped = node_state(state);
            assert_ne!(mapped, NodeState::Terminated, "{state} maps to TERMINATED");
        }

        assert_eq!(node_state(MachineState::Running), NodeState::Running);
        assert_eq!(node_state(MachineState::PoweredOff), NodeState::Suspended);
        assert_eq!(node_state(MachineState::Aborted), NodeState::Error);
        assert_eq!(node_state(MachineState::Stuck), NodeState::Error);
        assert_eq!(
            node_state(MachineState::DeletingSnapshotOnline),
            NodeState::Pending
        );
        assert_eq!(node_state(MachineState::Null), NodeState::Unrecognized);
    }

    #[test]
    fn test_unknown_native_states_are_unrecognized() {
        for native in ["paused", "saved", "", "hibernating"] {
            assert_eq!(
                node_state(MachineState::from_vboxmanage(native)),
                NodeState::Unrecognized
            );
        }
    }

    #[test]
    fn test_node_state_display() {
        assert_eq!(NodeState::Error.to_string(), "ERROR");
        assert_eq!(
            serde_json::to_string(&NodeState::Unrecognized).unwrap(),
            "\"UNRECOGNIZED\""
        );
    }
}
