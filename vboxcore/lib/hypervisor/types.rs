use std::{
    fmt::{self, Display},
    path::PathBuf,
    str::FromStr,
};

use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    config::{SSH_FORWARD_RULE, SSH_GUEST_PORT},
    VboxcoreError,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The host address NAT forwards listen on.
pub const LOOPBACK_HOST: &str = "127.0.0.1";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An opaque reference to a machine registered with the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineHandle(String);

/// The native lifecycle state of a machine.
///
/// The set mirrors VirtualBox's `MachineState` enumeration, range markers included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MachineState {
    /// No state, or a state vboxcore does not know.
    Null,

    /// The machine is not running.
    PoweredOff,

    /// The machine is running.
    Running,

    /// The machine is being started.
    Starting,

    /// The machine is being powered down.
    Stopping,

    /// A saved state is being restored.
    Restoring,

    /// The machine is being configured.
    SettingUp,

    /// A snapshot of the running machine is being taken.
    LiveSnapshotting,

    /// A snapshot is being deleted.
    DeletingSnapshot,

    /// A snapshot of the running machine is being deleted.
    DeletingSnapshotOnline,

    /// A snapshot of the paused machine is being deleted.
    DeletingSnapshotPaused,

    /// The machine is syncing with its fault-tolerance peer.
    FaultTolerantSyncing,

    /// The machine was teleported away.
    Teleported,

    /// The machine is being teleported in.
    TeleportingIn,

    /// The paused machine is being teleported away.
    TeleportingPausedVm,

    /// First of the online states.
    FirstOnline,

    /// Last of the online states.
    LastOnline,

    /// First of the transient states.
    FirstTransient,

    /// Last of the transient states.
    LastTransient,

    /// The machine process died.
    Aborted,

    /// The guest hit a fatal error.
    Stuck,
}

/// How machines are started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ExecutionType {
    /// No display.
    #[default]
    Headless,

    /// A regular VirtualBox window.
    Gui,

    /// A bare SDL window.
    Sdl,
}

/// How a node's disk relates to its master's.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CloneMode {
    /// A copy-on-write layer over the master's disk.
    #[default]
    Linked,

    /// An independent copy of the master's disk.
    Full,
}

/// A NAT port-forwarding rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TypedBuilder)]
pub struct PortForward {
    /// The rule name, unique per adapter.
    #[builder(setter(into))]
    pub name: String,

    /// The host address the forward listens on.
    #[serde(default = "default_host_ip")]
    #[builder(default = LOOPBACK_HOST.to_string(), setter(into))]
    pub host_ip: String,

    /// The host port.
    pub host_port: u16,

    /// The guest port.
    pub guest_port: u16,
}

/// How a network adapter is attached.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum NetworkAttachment {
    /// Behind the hypervisor's NAT engine.
    Nat {
        /// TCP forwards from the host into the guest.
        #[serde(default)]
        forwards: Vec<PortForward>,
    },

    /// Bridged onto a host interface.
    Bridged {
        /// The host interface.
        interface: String,
    },

    /// On a host-only network.
    HostOnly {
        /// The host-only interface.
        interface: String,
    },

    /// On an internal network shared by guests only.
    Internal {
        /// The internal network name.
        network: String,
    },
}

/// The hardware a machine is configured with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct HardwareSettings {
    /// The number of vCPUs.
    cpus: u32,

    /// The amount of RAM in MiB.
    memory_mib: u32,

    /// The network adapters, in slot order.
    #[builder(default)]
    nics: Vec<NetworkAttachment>,
}

/// What the hypervisor knows about a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
pub struct MachineInfo {
    /// The machine handle.
    pub handle: MachineHandle,

    /// The machine name.
    #[builder(setter(into))]
    pub name: String,

    /// The native state.
    #[serde(with = "machine_state_name")]
    pub state: MachineState,

    /// The VirtualBox OS type.
    #[builder(default, setter(into))]
    pub os_type: String,

    /// The number of vCPUs.
    #[builder(default)]
    pub cpus: u32,

    /// The amount of RAM in MiB.
    #[builder(default)]
    pub memory_mib: u32,

    /// The network adapters, in slot order.
    #[builder(default)]
    pub nics: Vec<NetworkAttachment>,

    /// The primary hard disk.
    #[builder(default)]
    pub hard_disk: Option<PathBuf>,

    /// Addresses reported by the guest additions.
    #[builder(default)]
    pub guest_addresses: Vec<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MachineHandle {
    /// Wraps a hypervisor-assigned identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as the hypervisor knows it.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl MachineState {
    /// Every state.
    pub const ALL: [MachineState; 21] = [
        MachineState::Null,
        MachineState::PoweredOff,
        MachineState::Running,
        MachineState::Starting,
        MachineState::Stopping,
        MachineState::Restoring,
        MachineState::SettingUp,
        MachineState::LiveSnapshotting,
        MachineState::DeletingSnapshot,
        MachineState::DeletingSnapshotOnline,
        MachineState::DeletingSnapshotPaused,
        MachineState::FaultTolerantSyncing,
        MachineState::Teleported,
        MachineState::TeleportingIn,
        MachineState::TeleportingPausedVm,
        MachineState::FirstOnline,
        MachineState::LastOnline,
        MachineState::FirstTransient,
        MachineState::LastTransient,
        MachineState::Aborted,
        MachineState::Stuck,
    ];

    /// Reads the `VMState` value printed by `VBoxManage showvminfo --machinereadable`.
    ///
    /// Values outside the enumeration read as [`MachineState::Null`].
    pub fn from_vboxmanage(value: &str) -> Self {
        match value.trim().trim_matches('"').to_ascii_lowercase().as_str() {
            "poweroff" | "powered off" => MachineState::PoweredOff,
            "running" => MachineState::Running,
            "starting" => MachineState::Starting,
            "stopping" => MachineState::Stopping,
            "restoring" | "restoringsnapshot" => MachineState::Restoring,
            "settingup" => MachineState::SettingUp,
            "livesnapshotting" | "onlinesnapshotting" => MachineState::LiveSnapshotting,
            "deletingsnapshot" => MachineState::DeletingSnapshot,
            "deletingsnapshotlive" => MachineState::DeletingSnapshotOnline,
            "deletingsnapshotlivepaused" => MachineState::DeletingSnapshotPaused,
            "faulttolerantsyncing" => MachineState::FaultTolerantSyncing,
            "teleported" => MachineState::Teleported,
            "teleportingin" => MachineState::TeleportingIn,
            "teleportingpausedvm" => MachineState::TeleportingPausedVm,
            "aborted" => MachineState::Aborted,
            "stuck" | "gurumeditation" => MachineState::Stuck,
            _ => MachineState::Null,
        }
    }

    /// The state's name.
    pub fn name(&self) -> &'static str {
        match self {
            MachineState::Null => "Null",
            MachineState::PoweredOff => "PoweredOff",
            MachineState::Running => "Running",
            MachineState::Starting => "Starting",
            MachineState::Stopping => "Stopping",
            MachineState::Restoring => "Restoring",
            MachineState::SettingUp => "SettingUp",
            MachineState::LiveSnapshotting => "LiveSnapshotting",
            MachineState::DeletingSnapshot => "DeletingSnapshot",
            MachineState::DeletingSnapshotOnline => "DeletingSnapshotOnline",
            MachineState::DeletingSnapshotPaused => "DeletingSnapshotPaused",
            MachineState::FaultTolerantSyncing => "FaultTolerantSyncing",
            MachineState::Teleported => "Teleported",
            MachineState::TeleportingIn => "TeleportingIn",
            MachineState::TeleportingPausedVm => "TeleportingPausedVm",
            MachineState::FirstOnline => "FirstOnline",
            MachineState::LastOnline => "LastOnline",
            MachineState::FirstTransient => "FirstTransient",
            MachineState::LastTransient => "LastTransient",
            MachineState::Aborted => "Aborted",
            MachineState::Stuck => "Stuck",
        }
    }

    /// Looks a state up by [`name`](Self::name).
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.name() == name)
    }
}

impl ExecutionType {
    /// The `--type` value of `VBoxManage startvm`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionType::Headless => "headless",
            ExecutionType::Gui => "gui",
            ExecutionType::Sdl => "sdl",
        }
    }
}

impl CloneMode {
    /// The mode's lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CloneMode::Linked => "linked",
            CloneMode::Full => "full",
        }
    }
}

impl PortForward {
    /// The forward of the host port to the guest's ssh port.
    pub fn ssh(host_port: u16) -> Self {
        PortForward::builder()
            .name(SSH_FORWARD_RULE)
            .host_port(host_port)
            .guest_port(SSH_GUEST_PORT)
            .build()
    }
}

impl NetworkAttachment {
    /// A NAT adapter with no forwards.
    pub fn nat() -> Self {
        NetworkAttachment::Nat {
            forwards: Vec::new(),
        }
    }

    /// A NAT adapter forwarding `host_port` to the guest's ssh port.
    pub fn nat_with_ssh(host_port: u16) -> Self {
        NetworkAttachment::Nat {
            forwards: vec![PortForward::ssh(host_port)],
        }
    }
}

impl MachineInfo {
    /// The host port forwarded to the guest's ssh port on the first NAT adapter carrying one.
    pub fn ssh_port(&self) -> Option<u16> {
        self.nics.iter().find_map(|nic| match nic {
            NetworkAttachment::Nat { forwards } => forwards
                .iter()
                .find(|forward| forward.guest_port == SSH_GUEST_PORT)
                .map(|forward| forward.host_port),
            _ => None,
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn default_host_ip() -> String {
    LOOPBACK_HOST.to_string()
}

mod machine_state_name {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    use super::MachineState;

    pub(super) fn serialize<S>(state: &MachineState, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(state.name())
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<MachineState, D::Error>
    where
        D: Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        MachineState::from_name(&name)
            .ok_or_else(|| D::Error::custom(format!("unknown machine state {name:?}")))
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for MachineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ExecutionType {
    type Err = VboxcoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "headless" => Ok(ExecutionType::Headless),
            "gui" => Ok(ExecutionType::Gui),
            "sdl" => Ok(ExecutionType::Sdl),
            _ => Err(VboxcoreError::Config(format!(
                "unknown execution type {s:?}, expected headless, gui or sdl"
            ))),
        }
    }
}

impl TryFrom<String> for ExecutionType {
    type Error = VboxcoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ExecutionType> for String {
    fn from(value: ExecutionType) -> Self {
        value.as_str().to_string()
    }
}

impl Display for ExecutionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CloneMode {
    type Err = VboxcoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linked" => Ok(CloneMode::Linked),
            "full" => Ok(CloneMode::Full),
            _ => Err(VboxcoreError::Config(format!(
                "unknown clone mode {s:?}, expected linked or full"
            ))),
        }
    }
}

impl TryFrom<String> for CloneMode {
    type Error = VboxcoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CloneMode> for String {
    fn from(value: CloneMode) -> Self {
        value.as_str().to_string()
    }
}

impl Display for CloneMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_state_from_vboxmanage() {
        assert_eq!(
            MachineState::from_vboxmanage("\"poweroff\""),
            MachineState::PoweredOff
        );
        assert_eq!(MachineState::from_vboxmanage("running"), MachineState::Running);
        assert_eq!(
            MachineState::from_vboxmanage("deletingsnapshotlive"),
            MachineState::DeletingSnapshotOnline
        );
        assert_eq!(
            MachineState::from_vboxmanage("gurumeditation"),
            MachineState::Stuck
        );
        assert_eq!(MachineState::from_vboxmanage("paused"), MachineState::Null);
        assert_eq!(MachineState::from_vboxmanage("saved"), MachineState::Null);
    }

    #[test]
    fn test_machine_state_names_round_trip() {
        for state in MachineState::ALL {
            assert_eq!(MachineState::from_name(state.name()), Some(state));
        }
        assert_eq!(MachineState::from_name("Paused"), None);
    }

    #[test]
    fn test_execution_type_and_clone_mode_ignore_case() {
        assert_eq!("HEADLESS".parse::<ExecutionType>().unwrap(), ExecutionType::Headless);
        assert_eq!("Sdl".parse::<ExecutionType>().unwrap(), ExecutionType::Sdl);
        assert!("vrdp".parse::<ExecutionType>().is_err());

        assert_eq!("LINKED".parse::<CloneMode>().unwrap(), CloneMode::Linked);
        assert_eq!("full".parse::<CloneMode>().unwrap(), CloneMode::Full);
        assert!("shallow".parse::<CloneMode>().is_err());
    }

    #[test]
    fn test_machine_info_ssh_port() {
        let info = MachineInfo::builder()
            .handle(MachineHandle::new("b3f1"))
            .name("n1")
            .state(MachineState::Running)
            .nics(vec![
                NetworkAttachment::HostOnly {
                    interface: "vboxnet0".to_string(),
                },
                NetworkAttachment::nat_with_ssh(2222),
            ])
            .build();

        assert_eq!(info.ssh_port(), Some(2222));
    }
}
