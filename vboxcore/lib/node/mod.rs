//! Nodes: machines cloned from a master and handed out to users.

mod creator;
mod state;

use std::net::Ipv4Addr;

use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    catalogue::{HardwareProfile, LoginCredentials},
    config::{DEFAULT_DISK_MIB, SSH_FORWARD_RULE, SSH_GUEST_PORT},
    hypervisor::{CloneMode, HardwareSettings, MachineInfo, NetworkAttachment, PortForward},
};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use creator::*;
pub use state::*;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const DEFAULT_NODE_CPUS: u32 = 1;

const DEFAULT_NODE_MEMORY_MIB: u32 = 1024;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// What a node should look like.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
pub struct NodeSpec {
    /// The machine name. Must be unused.
    #[builder(setter(into))]
    pub name: String,

    /// The catalogue image to clone.
    #[builder(setter(into))]
    pub image_id: String,

    /// The node's hardware.
    #[builder(default)]
    #[serde(default)]
    pub hardware: NodeHardware,

    /// How the node's disk relates to the master's. The configured default when absent.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub clone_mode: Option<CloneMode>,
}

/// The hardware of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct NodeHardware {
    /// The number of vCPUs.
    cpus: u32,

    /// The amount of RAM in MiB.
    memory_mib: u32,

    /// The disk size in MiB. Advisory: clones inherit the master's disk.
    #[builder(default = DEFAULT_DISK_MIB)]
    disk_mib: u64,

    /// The network adapters in slot order. A single NAT adapter when empty.
    #[builder(default)]
    network_attachments: Vec<NetworkAttachment>,
}

/// What is known about a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetadata {
    /// The hypervisor's identifier of the machine.
    pub id: String,

    /// The machine name.
    pub name: String,

    /// The abstract state.
    pub state: NodeState,

    /// Guest addresses in private ranges.
    pub private_addresses: Vec<String>,

    /// Guest addresses outside private ranges.
    pub public_addresses: Vec<String>,

    /// The configured hardware.
    pub hardware: HardwareSettings,

    /// The image the node was cloned from, when recorded.
    pub image_id: Option<String>,

    /// How to log in, when the image is known.
    pub login_credentials: Option<LoginCredentials>,

    /// The host port forwarded to the guest's ssh port.
    pub ssh_port: Option<u16>,
}

/// A freshly created node and the credentials to log into it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAndInitialCredentials {
    /// The hypervisor's identifier of the machine.
    pub node_id: String,

    /// The node.
    pub node: NodeMetadata,

    /// How to log in.
    pub credentials: LoginCredentials,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl NodeHardware {
    /// The hardware of a catalogue profile, on a single NAT adapter.
    pub fn from_profile(profile: &HardwareProfile) -> Self {
        NodeHardware::builder()
            .cpus(*profile.get_cpus())
            .memory_mib(*profile.get_memory_mib())
            .disk_mib(*profile.get_disk_mib())
            .build()
    }

    /// The settings applied to a clone, with `ssh_port` forwarded to the guest's ssh port on the
    /// first NAT adapter. A NAT adapter is put in the first slot when there is none.
    pub fn settings_with_ssh(&self, ssh_port: u16) -> HardwareSettings {
        let mut nics = self.network_attachments.clone();

        let nat = nics
            .iter()
            .position(|nic| matches!(nic, NetworkAttachment::Nat { .. }));

        match nat {
            Some(index) => {
                if let NetworkAttachment::Nat { forwards } = &mut nics[index] {
                    forwards.retain(|forward| {
                        forward.name != SSH_FORWARD_RULE && forward.guest_port != SSH_GUEST_PORT
                    });
                    forwards.push(PortForward::ssh(ssh_port));
                }
            }
            None => nics.insert(0, NetworkAttachment::nat_with_ssh(ssh_port)),
        }

        HardwareSettings::builder()
            .cpus(self.cpus)
            .memory_mib(self.memory_mib)
            .nics(nics)
            .build()
    }
}

impl NodeMetadata {
    /// Describes a machine. `ssh_port` falls back to the machine's NAT forwards when not given.
    pub fn from_machine(
        info: MachineInfo,
        image_id: Option<String>,
        login_credentials: Option<LoginCredentials>,
        ssh_port: Option<u16>,
    ) -> Self {
        let (private_addresses, public_addresses): (Vec<String>, Vec<String>) = info
            .guest_addresses
            .iter()
            .cloned()
            .partition(|address| is_private(address));
        let ssh_port = ssh_port.or_else(|| info.ssh_port());

        Self {
            id: info.handle.to_string(),
            name: info.name,
            state: node_state(info.state),
            private_addresses,
            public_addresses,
            hardware: HardwareSettings::builder()
                .cpus(info.cpus)
                .memory_mib(info.memory_mib)
                .nics(info.nics)
                .build(),
            image_id,
            login_credentials,
            ssh_port,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn is_private(address: &str) -> bool {
    address
        .parse::<Ipv4Addr>()
        .map(|ip| ip.is_private() || ip.is_loopback() || ip.is_link_local())
        .unwrap_or(false)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for NodeHardware {
    fn default() -> Self {
        NodeHardware::builder()
            .cpus(DEFAULT_NODE_CPUS)
            .memory_mib(DEFAULT_NODE_MEMORY_MIB)
            .build()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::{MachineHandle, MachineState};

    #[test]
    fn test_settings_with_ssh_adds_nat_adapter() {
        let hardware = NodeHardware::builder()
            .cpus(2)
            .memory_mib(2048)
            .network_attachments(vec![NetworkAttachment::HostOnly {
                interface: "vboxnet0".to_string(),
            }])
            .build();

        let settings = hardware.settings_with_ssh(40022);

        assert_eq!(settings.get_nics().len(), 2);
        assert_eq!(settings.get_nics()[0], NetworkAttachment::nat_with_ssh(40022));
    }

    #[test]
    fn test_settings_with_ssh_replaces_existing_forward() {
        let hardware = NodeHardware::builder()
            .cpus(1)
            .memory_mib(512)
            .network_attachments(vec![NetworkAttachment::Nat {
                forwards: vec![
                    PortForward::ssh(2222),
                    PortForward::builder()
                        .name("http")
                        .host_port(8080)
                        .guest_port(80)
                        .build(),
                ],
            }])
            .build();

        let settings = hardware.settings_with_ssh(40022);
        let NetworkAttachment::Nat { forwards } = &settings.get_nics()[0] else {
            panic!("first adapter is not NAT");
        };

        assert_eq!(forwards.len(), 2);
        assert!(forwards.contains(&PortForward::ssh(40022)));
        assert!(!forwards.contains(&PortForward::ssh(2222)));
    }

    #[test]
    fn test_metadata_splits_addresses() {
        let info = MachineInfo::builder()
            .handle(MachineHandle::new("b3f1"))
            .name("n1")
            .state(MachineState::Running)
            .cpus(2)
            .memory_mib(2048)
            .nics(vec![NetworkAttachment::nat_with_ssh(40022)])
            .guest_addresses(vec!["10.0.2.15".to_string(), "203.0.113.7".to_string()])
            .build();

        let node = NodeMetadata::from_machine(info, Some("ubuntu-22-amd64".to_string()), None, None);

        assert_eq!(node.state, NodeState::Running);
        assert_eq!(node.private_addresses, vec!["10.0.2.15".to_string()]);
        assert_eq!(node.public_addresses, vec!["203.0.113.7".to_string()]);
        assert_eq!(node.ssh_port, Some(40022));
    }
}
