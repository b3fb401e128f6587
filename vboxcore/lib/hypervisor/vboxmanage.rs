use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
    process::Output,
};

use async_trait::async_trait;
use tokio::process::Command;

use crate::{utils::KeyedLocks, VboxcoreError, VboxcoreResult};

use super::{
    encode,
    machinereadable::{
        parse_extra_data_value, parse_guest_addresses, parse_vm_list, MachineReadable,
        DISK_CONTROLLER, DVD_CONTROLLER,
    },
    CloneMode, ExecutionType, HardwareSettings, Hypervisor, KeyAction, MachineHandle, MachineInfo,
    MachineState, NetworkAttachment,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The names `VBoxManage` is installed under.
const BINARY_NAMES: [&str; 2] = ["VBoxManage", "vboxmanage"];

/// The snapshot linked clones are taken from.
pub const CLONE_BASE_SNAPSHOT: &str = "vboxcore-base";

/// At most this many bytes of stderr end up in an error message.
const MAX_STDERR_BYTES: usize = 1024;

/// At most this many scancodes are sent per `keyboardputscancode` call.
const SCANCODES_PER_CALL: usize = 64;

/// The number of adapter slots rewritten by `set_hardware`.
const NIC_SLOTS: usize = 8;

const GUEST_ADDRESS_PATTERN: &str = "/VirtualBox/GuestInfo/Net/*/V4/IP";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Drives VirtualBox through its `VBoxManage` command-line front end.
///
/// Every operation on a machine takes that machine's lock first, so writes to the same machine
/// never interleave. Listing does not lock.
#[derive(Debug)]
pub struct VBoxManage {
    binary: PathBuf,
    locks: KeyedLocks<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VBoxManage {
    /// Uses the `VBoxManage` binary at `binary`.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            locks: KeyedLocks::new(),
        }
    }

    /// Finds `VBoxManage` on `PATH`.
    pub fn discover() -> VboxcoreResult<Self> {
        BINARY_NAMES
            .iter()
            .find_map(|name| which::which(name).ok())
            .map(Self::new)
            .ok_or_else(|| VboxcoreError::hypervisor("VBoxManage was not found on PATH"))
    }

    /// The binary being driven.
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Runs `VBoxManage` and returns its stdout.
    async fn run<I, S>(&self, args: I) -> VboxcoreResult<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args = args
            .into_iter()
            .map(|arg| arg.as_ref().to_os_string())
            .collect::<Vec<_>>();
        let verb = args
            .first()
            .map(|arg| arg.to_string_lossy().into_owned())
            .unwrap_or_default();

        tracing::trace!(binary = %self.binary.display(), ?args, "exec");

        let output = Command::new(&self.binary)
            .args(&args)
            .output()
            .await
            .map_err(|e| {
                VboxcoreError::Hypervisor(format!(
                    "failed to run {}: {e}",
                    self.binary.display()
                ))
            })?;

        check_output(&verb, output)
    }

    async fn show(&self, handle: &MachineHandle) -> VboxcoreResult<MachineReadable> {
        let output = self
            .run(["showvminfo", handle.as_str(), "--machinereadable"])
            .await?;
        Ok(MachineReadable::parse(&output))
    }

    async fn guest_addresses(&self, handle: &MachineHandle) -> Vec<String> {
        let output = self
            .run([
                "guestproperty",
                "enumerate",
                handle.as_str(),
                "--patterns",
                GUEST_ADDRESS_PATTERN,
            ])
            .await;

        match output {
            Ok(output) => parse_guest_addresses(&output),
            Err(e) => {
                tracing::debug!(%handle, error = %e, "guest addresses unavailable");
                Vec::new()
            }
        }
    }

    async fn has_snapshot(&self, handle: &MachineHandle, name: &str) -> bool {
        match self
            .run(["snapshot", handle.as_str(), "list", "--machinereadable"])
            .await
        {
            Ok(output) => MachineReadable::parse(&output).has_value(name),
            Err(_) => false,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn check_output(verb: &str, output: Output) -> VboxcoreResult<String> {
    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }

    let stderr = output.stderr.as_slice();
    let tail = &stderr[stderr.len().saturating_sub(MAX_STDERR_BYTES)..];

    Err(VboxcoreError::Hypervisor(format!(
        "VBoxManage {verb} failed ({}): {}",
        output.status,
        String::from_utf8_lossy(tail).trim()
    )))
}

/// Builds the `modifyvm` arguments applying `hardware` to a machine currently set up as
/// `current`.
fn modifyvm_args(
    handle: &MachineHandle,
    current: &MachineInfo,
    hardware: &HardwareSettings,
) -> Vec<String> {
    let mut args = vec![
        "modifyvm".to_string(),
        handle.to_string(),
        "--cpus".to_string(),
        hardware.get_cpus().to_string(),
        "--memory".to_string(),
        hardware.get_memory_mib().to_string(),
    ];

    for (index, nic) in current.nics.iter().enumerate() {
        if let NetworkAttachment::Nat { forwards } = nic {
            for forward in forwards {
                args.push(format!("--natpf{}", index + 1));
                args.push("delete".to_string());
                args.push(forward.name.clone());
            }
        }
    }

    for slot in 1..=NIC_SLOTS {
        match hardware.get_nics().get(slot - 1) {
            Some(NetworkAttachment::Nat { forwards }) => {
                args.extend([format!("--nic{slot}"), "nat".to_string()]);
                for forward in forwards {
                    args.push(format!("--natpf{slot}"));
                    args.push(format!(
                        "{},tcp,{},{},,{}",
                        forward.name, forward.host_ip, forward.host_port, forward.guest_port
                    ));
                }
            }
            Some(NetworkAttachment::Bridged { interface }) => {
                args.extend([
                    format!("--nic{slot}"),
                    "bridged".to_string(),
                    format!("--bridgeadapter{slot}"),
                    interface.clone(),
                ]);
            }
            Some(NetworkAttachment::HostOnly { interface }) => {
                args.extend([
                    format!("--nic{slot}"),
                    "hostonly".to_string(),
                    format!("--hostonlyadapter{slot}"),
                    interface.clone(),
                ]);
            }
            Some(NetworkAttachment::Internal { network }) => {
                args.extend([
                    format!("--nic{slot}"),
                    "intnet".to_string(),
                    format!("--intnet{slot}"),
                    network.clone(),
                ]);
            }
            None => args.extend([format!("--nic{slot}"), "none".to_string()]),
        }
    }

    args
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl Hypervisor for VBoxManage {
    async fn create_machine(&self, name: &str, os_type: &str) -> VboxcoreResult<MachineHandle> {
        let handle = MachineHandle::new(uuid::Uuid::new_v4().to_string());
        let _guard = self.locks.lock(&handle.to_string()).await;

        self.run([
            "createvm",
            "--name",
            name,
            "--ostype",
            os_type,
            "--uuid",
            handle.as_str(),
            "--register",
        ])
        .await?;

        self.run([
            "storagectl",
            handle.as_str(),
            "--name",
            DISK_CONTROLLER,
            "--add",
            "sata",
            "--controller",
            "IntelAhci",
            "--portcount",
            "1",
        ])
        .await?;

        self.run([
            "storagectl",
            handle.as_str(),
            "--name",
            DVD_CONTROLLER,
            "--add",
            "ide",
        ])
        .await?;

        tracing::debug!(%handle, name, os_type, "created machine");
        Ok(handle)
    }

    async fn create_hard_disk(
        &self,
        handle: &MachineHandle,
        size_mib: u64,
    ) -> VboxcoreResult<PathBuf> {
        let _guard = self.locks.lock(&handle.to_string()).await;

        let info = self.show(handle).await?;
        let folder = info
            .get("CfgFile")
            .and_then(|cfg| Path::new(cfg).parent().map(Path::to_path_buf))
            .ok_or_else(|| {
                VboxcoreError::Hypervisor(format!("machine {handle} has no settings folder"))
            })?;
        let name = info.get("name").unwrap_or(handle.as_str());
        let path = folder.join(format!("{name}.vdi"));

        let filename = path.to_string_lossy().into_owned();
        self.run([
            "createmedium",
            "disk",
            "--filename",
            filename.as_str(),
            "--size",
            size_mib.to_string().as_str(),
            "--format",
            "VDI",
            "--variant",
            "Standard",
        ])
        .await?;

        tracing::debug!(%handle, path = %path.display(), size_mib, "created hard disk");
        Ok(path)
    }

    async fn attach_hard_disk(&self, handle: &MachineHandle, path: &Path) -> VboxcoreResult<()> {
        let _guard = self.locks.lock(&handle.to_string()).await;

        let medium = path.to_string_lossy();
        self.run([
            "storageattach",
            handle.as_str(),
            "--storagectl",
            DISK_CONTROLLER,
            "--port",
            "0",
            "--device",
            "0",
            "--type",
            "hdd",
            "--medium",
            medium.as_ref(),
        ])
        .await?;

        Ok(())
    }

    async fn attach_iso(&self, handle: &MachineHandle, path: &Path) -> VboxcoreResult<()> {
        let _guard = self.locks.lock(&handle.to_string()).await;

        let medium = path.to_string_lossy();
        self.run([
            "storageattach",
            handle.as_str(),
            "--storagectl",
            DVD_CONTROLLER,
            "--port",
            "0",
            "--device",
            "0",
            "--type",
            "dvddrive",
            "--medium",
            medium.as_ref(),
        ])
        .await?;

        Ok(())
    }

    async fn detach_iso(&self, handle: &MachineHandle) -> VboxcoreResult<()> {
        let _guard = self.locks.lock(&handle.to_string()).await;

        self.run([
            "storageattach",
            handle.as_str(),
            "--storagectl",
            DVD_CONTROLLER,
            "--port",
            "0",
            "--device",
            "0",
            "--type",
            "dvddrive",
            "--medium",
            "emptydrive",
        ])
        .await?;

        Ok(())
    }

    async fn set_hardware(
        &self,
        handle: &MachineHandle,
        hardware: &HardwareSettings,
    ) -> VboxcoreResult<()> {
        let _guard = self.locks.lock(&handle.to_string()).await;

        let current = self.show(handle).await?.into_machine_info(Vec::new())?;
        if current.state == MachineState::Running {
            return Err(VboxcoreError::Hypervisor(format!(
                "cannot change the hardware of running machine {handle}"
            )));
        }

        self.run(modifyvm_args(handle, &current, hardware)).await?;
        Ok(())
    }

    async fn start_machine(
        &self,
        handle: &MachineHandle,
        execution_type: ExecutionType,
    ) -> VboxcoreResult<()> {
        let _guard = self.locks.lock(&handle.to_string()).await;

        self.run(["startvm", handle.as_str(), "--type", execution_type.as_str()])
            .await?;

        tracing::debug!(%handle, %execution_type, "started machine");
        Ok(())
    }

    async fn stop_machine(&self, handle: &MachineHandle) -> VboxcoreResult<()> {
        let _guard = self.locks.lock(&handle.to_string()).await;

        self.run(["controlvm", handle.as_str(), "poweroff"]).await?;
        Ok(())
    }

    async fn acpi_shutdown(&self, handle: &MachineHandle) -> VboxcoreResult<()> {
        let _guard = self.locks.lock(&handle.to_string()).await;

        self.run(["controlvm", handle.as_str(), "acpipowerbutton"])
            .await?;
        Ok(())
    }

    async fn get_state(&self, handle: &MachineHandle) -> VboxcoreResult<MachineState> {
        let info = self.show(handle).await?;
        Ok(MachineState::from_vboxmanage(
            info.get("VMState").unwrap_or_default(),
        ))
    }

    async fn machine_info(&self, handle: &MachineHandle) -> VboxcoreResult<MachineInfo> {
        let info = self.show(handle).await?;
        let addresses = self.guest_addresses(handle).await;
        info.into_machine_info(addresses)
    }

    async fn clone_machine(
        &self,
        source: &MachineHandle,
        name: &str,
        mode: CloneMode,
    ) -> VboxcoreResult<MachineHandle> {
        let _guard = self.locks.lock(&source.to_string()).await;
        let handle = MachineHandle::new(uuid::Uuid::new_v4().to_string());

        match mode {
            CloneMode::Linked => {
                if !self.has_snapshot(source, CLONE_BASE_SNAPSHOT).await {
                    self.run(["snapshot", source.as_str(), "take", CLONE_BASE_SNAPSHOT])
                        .await?;
                    tracing::debug!(%source, "took clone base snapshot");
                }

                self.run([
                    "clonevm",
                    source.as_str(),
                    "--snapshot",
                    CLONE_BASE_SNAPSHOT,
                    "--options",
                    "link",
                    "--name",
                    name,
                    "--uuid",
                    handle.as_str(),
                    "--register",
                ])
                .await?;
            }
            CloneMode::Full => {
                self.run([
                    "clonevm",
                    source.as_str(),
                    "--mode",
                    "machine",
                    "--name",
                    name,
                    "--uuid",
                    handle.as_str(),
                    "--register",
                ])
                .await?;
            }
        }

        tracing::debug!(%source, %handle, name, %mode, "cloned machine");
        Ok(handle)
    }

    async fn delete_machine(&self, handle: &MachineHandle) -> VboxcoreResult<()> {
        let _guard = self.locks.lock(&handle.to_string()).await;

        self.run(["unregistervm", handle.as_str(), "--delete"])
            .await?;

        tracing::debug!(%handle, "deleted machine");
        Ok(())
    }

    async fn list_machines(&self) -> VboxcoreResult<Vec<MachineHandle>> {
        let output = self.run(["list", "vms"]).await?;
        Ok(parse_vm_list(&output)
            .into_iter()
            .map(|(_, handle)| handle)
            .collect())
    }

    async fn find_by_name(&self, name: &str) -> VboxcoreResult<Option<MachineHandle>> {
        let output = self.run(["list", "vms"]).await?;
        Ok(parse_vm_list(&output)
            .into_iter()
            .find(|(vm, _)| vm == name)
            .map(|(_, handle)| handle))
    }

    async fn set_extra_data(
        &self,
        handle: &MachineHandle,
        key: &str,
        value: &str,
    ) -> VboxcoreResult<()> {
        let _guard = self.locks.lock(&handle.to_string()).await;

        self.run(["setextradata", handle.as_str(), key, value])
            .await?;
        Ok(())
    }

    async fn get_extra_data(
        &self,
        handle: &MachineHandle,
        key: &str,
    ) -> VboxcoreResult<Option<String>> {
        let output = self.run(["getextradata", handle.as_str(), key]).await?;
        Ok(parse_extra_data_value(&output))
    }

    async fn type_keys(&self, handle: &MachineHandle, text: &str) -> VboxcoreResult<()> {
        let actions = encode(text)?;
        let _guard = self.locks.lock(&handle.to_string()).await;

        for action in actions {
            match action {
                KeyAction::Scancodes(codes) => {
                    for chunk in codes.chunks(SCANCODES_PER_CALL) {
                        let mut args = vec![
                            "controlvm".to_string(),
                            handle.to_string(),
                            "keyboardputscancode".to_string(),
                        ];
                        args.extend(chunk.iter().map(|code| format!("{code:02x}")));
                        self.run(args).await?;
                    }
                }
                KeyAction::Wait(duration) => tokio::time::sleep(duration).await,
            }
        }

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::PortForward;

    #[test]
    fn test_modifyvm_args_replace_forwards_and_clear_unused_slots() {
        let handle = MachineHandle::new("6d5a");
        let current = MachineInfo::builder()
            .handle(handle.clone())
            .name("n1")
            .state(MachineState::PoweredOff)
            .nics(vec![NetworkAttachment::nat_with_ssh(40022)])
            .build();
        let hardware = HardwareSettings::builder()
            .cpus(2)
            .memory_mib(2048)
            .nics(vec![
                NetworkAttachment::Nat {
                    forwards: vec![PortForward::ssh(40100)],
                },
                NetworkAttachment::HostOnly {
                    interface: "vboxnet0".to_string(),
                },
            ])
            .build();

        let args = modifyvm_args(&handle, &current, &hardware);
        let joined = args.join(" ");

        assert!(joined.starts_with("modifyvm 6d5a --cpus 2 --memory 2048"));
        assert!(joined.contains("--natpf1 delete ssh"));
        assert!(joined.contains("--nic1 nat --natpf1 ssh,tcp,127.0.0.1,40100,,22"));
        assert!(joined.contains("--nic2 hostonly --hostonlyadapter2 vboxnet0"));
        assert!(joined.contains("--nic3 none"));
        assert!(joined.ends_with("--nic8 none"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_reports_stderr_tail() -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir()?;
        let script = dir.path().join("VBoxManage");
        std::fs::write(
            &script,
            "#!/bin/sh\necho \"VBoxManage: error: Could not find a registered machine named '$2'\" >&2\nexit 1\n",
        )?;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))?;

        let vbox = VBoxManage::new(&script);
        let error = vbox
            .get_state(&MachineHandle::new("missing"))
            .await
            .unwrap_err();

        assert!(matches!(error, VboxcoreError::Hypervisor(_)));
        assert!(error.to_string().contains("showvminfo"));
        assert!(error.to_string().contains("named 'missing'"));

        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_find_by_name_parses_list_output() -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir()?;
        let script = dir.path().join("VBoxManage");
        std::fs::write(
            &script,
            "#!/bin/sh\necho '\"master-ubuntu\" {0b1c}'\necho '\"n1\" {9f8e}'\n",
        )?;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))?;

        let vbox = VBoxManage::new(&script);
        assert_eq!(
            vbox.find_by_name("n1").await?,
            Some(MachineHandle::new("9f8e"))
        );
        assert_eq!(vbox.find_by_name("n2").await?, None);
        assert_eq!(vbox.list_machines().await?.len(), 2);

        Ok(())
    }
}
