//! Parsers for the text `VBoxManage` prints.

use std::{collections::HashMap, path::PathBuf};

use crate::{VboxcoreError, VboxcoreResult};

use super::{MachineHandle, MachineInfo, MachineState, NetworkAttachment, PortForward};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const NO_VALUE: &str = "No value set!";
const MAX_NICS: usize = 8;

/// The storage controller hard disks are attached to.
pub(crate) const DISK_CONTROLLER: &str = "SATA";

/// The storage controller install media are attached to.
pub(crate) const DVD_CONTROLLER: &str = "IDE";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The `key=value` pairs of `showvminfo --machinereadable`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct MachineReadable {
    values: HashMap<String, String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MachineReadable {
    pub(crate) fn parse(output: &str) -> Self {
        let values = output
            .lines()
            .filter_map(|line| {
                let (key, value) = split_assignment(line)?;
                Some((unquote(key), unquote(value)))
            })
            .collect();

        Self { values }
    }

    pub(crate) fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Whether any key carries `value`, as snapshot names do in `snapshot list`.
    pub(crate) fn has_value(&self, value: &str) -> bool {
        self.values.values().any(|v| v == value)
    }

    fn get_u32(&self, key: &str) -> u32 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(0)
    }

    /// The medium attached at `controller`, port 0, device 0, if any.
    pub(crate) fn attached_medium(&self, controller: &str) -> Option<PathBuf> {
        self.get(&format!("{controller}-0-0"))
            .filter(|value| !matches!(*value, "none" | "emptydrive" | ""))
            .map(PathBuf::from)
    }

    fn nics(&self) -> Vec<NetworkAttachment> {
        (1..=MAX_NICS)
            .filter_map(|slot| {
                let kind = self.get(&format!("nic{slot}"))?;
                let attachment = match kind {
                    "nat" => NetworkAttachment::Nat {
                        forwards: self.forwards(slot),
                    },
                    "bridged" => NetworkAttachment::Bridged {
                        interface: self
                            .get(&format!("bridgeadapter{slot}"))
                            .unwrap_or_default()
                            .to_string(),
                    },
                    "hostonly" => NetworkAttachment::HostOnly {
                        interface: self
                            .get(&format!("hostonlyadapter{slot}"))
                            .unwrap_or_default()
                            .to_string(),
                    },
                    "intnet" => NetworkAttachment::Internal {
                        network: self
                            .get(&format!("intnet{slot}"))
                            .unwrap_or_default()
                            .to_string(),
                    },
                    _ => return None,
                };

                Some(attachment)
            })
            .collect()
    }

    /// NAT rules print as `Forwarding(<n>)="name,tcp,host_ip,host_port,guest_ip,guest_port"` for
    /// the first adapter and `Forwarding<slot>(<n>)` on recent versions for the others.
    fn forwards(&self, slot: usize) -> Vec<PortForward> {
        let prefixes = if slot == 1 {
            vec!["Forwarding(".to_string(), "Forwarding1(".to_string()]
        } else {
            vec![format!("Forwarding{slot}(")]
        };

        let mut forwards = self
            .values
            .iter()
            .filter(|(key, _)| prefixes.iter().any(|prefix| key.starts_with(prefix.as_str())))
            .filter_map(|(_, rule)| parse_forward(rule))
            .collect::<Vec<_>>();

        forwards.sort_by(|a, b| a.name.cmp(&b.name));
        forwards
    }

    pub(crate) fn into_machine_info(
        self,
        guest_addresses: Vec<String>,
    ) -> VboxcoreResult<MachineInfo> {
        let uuid = self
            .get("UUID")
            .ok_or_else(|| VboxcoreError::hypervisor("showvminfo output has no UUID"))?;
        let name = self
            .get("name")
            .ok_or_else(|| VboxcoreError::hypervisor("showvminfo output has no name"))?;

        Ok(MachineInfo {
            handle: MachineHandle::new(uuid),
            name: name.to_string(),
            state: MachineState::from_vboxmanage(self.get("VMState").unwrap_or_default()),
            os_type: self.get("ostype").unwrap_or_default().to_string(),
            cpus: self.get_u32("cpus"),
            memory_mib: self.get_u32("memory"),
            nics: self.nics(),
            hard_disk: self.attached_medium(DISK_CONTROLLER),
            guest_addresses,
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Parses `list vms`: one `"name" {uuid}` per line.
pub(crate) fn parse_vm_list(output: &str) -> Vec<(String, MachineHandle)> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let open = line.rfind('{')?;
            let close = line.rfind('}')?;
            if close <= open {
                return None;
            }

            let name = line[..open].trim().trim_matches('"').to_string();
            let uuid = &line[open + 1..close];
            Some((name, MachineHandle::new(uuid)))
        })
        .collect()
}

/// Parses `getextradata <vm> <key>`.
pub(crate) fn parse_extra_data_value(output: &str) -> Option<String> {
    let line = output.lines().map(str::trim).find(|line| !line.is_empty())?;
    if line == NO_VALUE {
        return None;
    }

    line.strip_prefix("Value:").map(|value| value.trim().to_string())
}

/// Parses `guestproperty enumerate`, in both the `Name: x, value: y, ...` format and the
/// `x = 'y' @ ...` format, returning the guest IPv4 addresses in adapter order.
pub(crate) fn parse_guest_addresses(output: &str) -> Vec<String> {
    let mut addresses = output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let (name, value) = if let Some(rest) = line.strip_prefix("Name:") {
                let (name, rest) = rest.split_once(',')?;
                let value = rest.trim().strip_prefix("value:")?;
                let value = value.split(',').next()?;
                (name.trim(), value.trim())
            } else {
                let (name, rest) = line.split_once(" = ")?;
                let value = rest.trim().strip_prefix('\'')?;
                let value = &value[..value.find('\'')?];
                (name.trim(), value)
            };

            let index = name
                .strip_prefix("/VirtualBox/GuestInfo/Net/")?
                .strip_suffix("/V4/IP")?
                .parse::<usize>()
                .ok()?;

            (!value.is_empty()).then(|| (index, value.to_string()))
        })
        .collect::<Vec<_>>();

    addresses.sort();
    addresses.into_iter().map(|(_, address)| address).collect()
}

fn parse_forward(rule: &str) -> Option<PortForward> {
    let fields = rule.split(',').map(str::trim).collect::<Vec<_>>();
    let [name, protocol, host_ip, host_port, _guest_ip, guest_port] = fields.as_slice() else {
        return None;
    };

    if !protocol.eq_ignore_ascii_case("tcp") {
        return None;
    }

    Some(PortForward {
        name: name.to_string(),
        host_ip: host_ip.to_string(),
        host_port: host_port.parse().ok()?,
        guest_port: guest_port.parse().ok()?,
    })
}

fn split_assignment(line: &str) -> Option<(&str, &str)> {
    let mut in_quotes = false;
    for (index, c) in line.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '=' if !in_quotes => return Some((&line[..index], &line[index + 1..])),
            _ => {}
        }
    }

    None
}

fn unquote(value: &str) -> String {
    let value = value.trim();
    let inner = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value);

    inner.replace("\\\"", "\"").replace("\\\\", "\\")
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SHOWVMINFO: &str = r#"name="n1"
groups="/"
ostype="Ubuntu (64-bit)"
UUID="6d5a3b1e-3b55-4d6c-9f5e-1c2b7f0c9a11"
memory=2048
cpus=2
VMState="running"
VMStateChangeTime="2024-05-01T10:00:00.000000000"
storagecontrollername0="SATA"
"SATA-0-0"="/home/ops/VirtualBox VMs/n1/Snapshots/{1a2b}.vdi"
"IDE-0-0"="emptydrive"
nic1="nat"
nictype1="82540EM"
Forwarding(0)="ssh,tcp,127.0.0.1,40022,,22"
nic2="hostonly"
hostonlyadapter2="vboxnet0"
nic3="none"
"#;

    #[test]
    fn test_machine_readable_into_machine_info() -> anyhow::Result<()> {
        let info = MachineReadable::parse(SHOWVMINFO)
            .into_machine_info(vec!["10.0.2.15".to_string()])?;

        assert_eq!(info.name, "n1");
        assert_eq!(info.handle.as_str(), "6d5a3b1e-3b55-4d6c-9f5e-1c2b7f0c9a11");
        assert_eq!(info.state, MachineState::Running);
        assert_eq!(info.cpus, 2);
        assert_eq!(info.memory_mib, 2048);
        assert_eq!(info.ssh_port(), Some(40022));
        assert_eq!(
            info.hard_disk,
            Some(PathBuf::from("/home/ops/VirtualBox VMs/n1/Snapshots/{1a2b}.vdi"))
        );
        assert_eq!(info.nics.len(), 2);
        assert_eq!(
            info.nics[1],
            NetworkAttachment::HostOnly {
                interface: "vboxnet0".to_string()
            }
        );

        Ok(())
    }

    #[test]
    fn test_machine_readable_without_uuid() {
        assert!(MachineReadable::parse("name=\"n1\"\n")
            .into_machine_info(vec![])
            .is_err());
    }

    #[test]
    fn test_parse_vm_list() {
        let vms = parse_vm_list(
            "\"master-ubuntu\" {0b1c}\n\"my vm {with braces}\" {9f8e}\n\nnoise\n",
        );

        assert_eq!(
            vms,
            vec![
                ("master-ubuntu".to_string(), MachineHandle::new("0b1c")),
                ("my vm {with braces}".to_string(), MachineHandle::new("9f8e")),
            ]
        );
    }

    #[test]
    fn test_parse_extra_data_value() {
        assert_eq!(
            parse_extra_data_value("Value: complete\n"),
            Some("complete".to_string())
        );
        assert_eq!(parse_extra_data_value("No value set!\n"), None);
    }

    #[test]
    fn test_parse_guest_addresses() {
        let legacy = "Name: /VirtualBox/GuestInfo/Net/1/V4/IP, value: 192.168.56.101, timestamp: 1, flags: \n\
                      Name: /VirtualBox/GuestInfo/Net/0/V4/IP, value: 10.0.2.15, timestamp: 1, flags: \n";
        assert_eq!(
            parse_guest_addresses(legacy),
            vec!["10.0.2.15".to_string(), "192.168.56.101".to_string()]
        );

        let modern = "/VirtualBox/GuestInfo/Net/0/V4/IP = '10.0.2.15' @ 2024-05-01T10:00:00.000Z\n\
                      /VirtualBox/GuestInfo/Net/0/Name = 'enp0s3' @ 2024-05-01T10:00:00.000Z\n";
        assert_eq!(parse_guest_addresses(modern), vec!["10.0.2.15".to_string()]);
    }
}
