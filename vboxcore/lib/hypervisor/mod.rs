//! The hypervisor capability.
//!
//! Everything vboxcore does to a machine goes through [`Hypervisor`]. Two bindings exist:
//! [`VBoxManage`], which drives VirtualBox's command-line front end, and
//! [`SimulatedHypervisor`], an in-memory stand-in used by tests and `--simulate` runs.

mod machinereadable;
mod scancode;
mod simulated;
mod types;
mod vboxmanage;

use std::{path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{utils, VboxcoreError, VboxcoreResult};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use scancode::*;
pub use simulated::*;
pub use types::*;
pub use vboxmanage::*;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The extra-data key marking a finished master.
pub const INSTALL_STATE_KEY: &str = "vboxcore/install-state";

/// The [`INSTALL_STATE_KEY`] value of a finished master.
pub const INSTALL_STATE_COMPLETE: &str = "complete";

/// The extra-data key recording the image a master or node was built from.
pub const IMAGE_ID_KEY: &str = "vboxcore/image-id";

/// The extra-data key recording the host port forwarded to the guest's ssh port.
pub const SSH_PORT_KEY: &str = "vboxcore/ssh-port";

/// The endpoint scheme selecting the [`VBoxManage`] binding.
pub const VBOXMANAGE_ENDPOINT: &str = "vboxmanage";

/// The endpoint selecting the [`SimulatedHypervisor`].
pub const SIMULATED_ENDPOINT: &str = "simulated";

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Operations on machines registered with a hypervisor.
///
/// Writes to the same machine are serialized by the binding. Listing may run concurrently with
/// anything.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Registers a new, empty machine.
    async fn create_machine(&self, name: &str, os_type: &str) -> VboxcoreResult<MachineHandle>;

    /// Creates a dynamically sized disk in the machine's folder and returns its path.
    async fn create_hard_disk(
        &self,
        handle: &MachineHandle,
        size_mib: u64,
    ) -> VboxcoreResult<std::path::PathBuf>;

    /// Attaches a disk as the machine's primary hard disk.
    async fn attach_hard_disk(&self, handle: &MachineHandle, path: &Path) -> VboxcoreResult<()>;

    /// Inserts an ISO into the machine's DVD drive.
    async fn attach_iso(&self, handle: &MachineHandle, path: &Path) -> VboxcoreResult<()>;

    /// Ejects whatever is in the machine's DVD drive.
    async fn detach_iso(&self, handle: &MachineHandle) -> VboxcoreResult<()>;

    /// Sets vCPUs, memory and network adapters. The machine must not be running.
    async fn set_hardware(
        &self,
        handle: &MachineHandle,
        hardware: &HardwareSettings,
    ) -> VboxcoreResult<()>;

    /// Powers the machine on.
    async fn start_machine(
        &self,
        handle: &MachineHandle,
        execution_type: ExecutionType,
    ) -> VboxcoreResult<()>;

    /// Powers the machine off immediately.
    async fn stop_machine(&self, handle: &MachineHandle) -> VboxcoreResult<()>;

    /// Presses the machine's ACPI power button.
    async fn acpi_shutdown(&self, handle: &MachineHandle) -> VboxcoreResult<()>;

    /// The machine's native state.
    async fn get_state(&self, handle: &MachineHandle) -> VboxcoreResult<MachineState>;

    /// Everything the hypervisor knows about the machine.
    async fn machine_info(&self, handle: &MachineHandle) -> VboxcoreResult<MachineInfo>;

    /// Clones a powered-off machine under a new name.
    async fn clone_machine(
        &self,
        source: &MachineHandle,
        name: &str,
        mode: CloneMode,
    ) -> VboxcoreResult<MachineHandle>;

    /// Unregisters the machine and deletes its files.
    async fn delete_machine(&self, handle: &MachineHandle) -> VboxcoreResult<()>;

    /// Every registered machine.
    async fn list_machines(&self) -> VboxcoreResult<Vec<MachineHandle>>;

    /// The machine with this name, if any.
    async fn find_by_name(&self, name: &str) -> VboxcoreResult<Option<MachineHandle>>;

    /// Stores a string tag on the machine.
    async fn set_extra_data(
        &self,
        handle: &MachineHandle,
        key: &str,
        value: &str,
    ) -> VboxcoreResult<()>;

    /// Reads a string tag from the machine.
    async fn get_extra_data(
        &self,
        handle: &MachineHandle,
        key: &str,
    ) -> VboxcoreResult<Option<String>>;

    /// Types a boot command on the machine's keyboard. See [`encode`] for the syntax.
    async fn type_keys(&self, handle: &MachineHandle, text: &str) -> VboxcoreResult<()>;
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Selects the hypervisor binding for an endpoint.
///
/// Accepted endpoints are `vboxmanage` (found on `PATH`), `vboxmanage:/path/to/VBoxManage` and
/// `simulated`.
pub fn connect(endpoint: &str) -> VboxcoreResult<Arc<dyn Hypervisor>> {
    let endpoint = endpoint.trim();

    if endpoint.eq_ignore_ascii_case(SIMULATED_ENDPOINT) {
        tracing::info!("using the simulated hypervisor");
        return Ok(Arc::new(SimulatedHypervisor::new(SimulationOptions::default())));
    }

    let (scheme, path) = match endpoint.split_once(':') {
        Some((scheme, path)) => (scheme, Some(path)),
        None => (endpoint, None),
    };

    if !scheme.eq_ignore_ascii_case(VBOXMANAGE_ENDPOINT) {
        return Err(VboxcoreError::Hypervisor(format!(
            "unsupported hypervisor endpoint {endpoint:?}"
        )));
    }

    let binding = match path {
        Some(path) if !path.is_empty() => VBoxManage::new(path),
        _ => VBoxManage::discover()?,
    };

    tracing::info!(binary = %binding.binary().display(), "using VBoxManage");
    Ok(Arc::new(binding))
}

/// Polls the machine every `interval` until it reaches `target` or `timeout` elapses.
///
/// Returns whether the state was reached.
pub async fn wait_for_state(
    hypervisor: &dyn Hypervisor,
    handle: &MachineHandle,
    target: MachineState,
    interval: Duration,
    timeout: Duration,
) -> VboxcoreResult<bool> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut ticker = utils::poll_ticker(interval);

    loop {
        if tokio::time::timeout_at(deadline, ticker.tick()).await.is_err() {
            return Ok(hypervisor.get_state(handle).await? == target);
        }

        if hypervisor.get_state(handle).await? == target {
            return Ok(true);
        }
    }
}

/// Powers the machine off if needed and deletes it, logging failures instead of returning them.
pub async fn force_remove(hypervisor: &dyn Hypervisor, handle: &MachineHandle) {
    match hypervisor.get_state(handle).await {
        Ok(MachineState::PoweredOff | MachineState::Null | MachineState::Aborted) => {}
        Ok(_) => {
            if let Err(e) = hypervisor.stop_machine(handle).await {
                tracing::warn!(%handle, error = %e, "failed to power off machine before removal");
            }
        }
        Err(e) => {
            tracing::warn!(%handle, error = %e, "failed to query machine before removal");
        }
    }

    if let Err(e) = hypervisor.delete_machine(handle).await {
        tracing::warn!(%handle, error = %e, "failed to delete machine");
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
