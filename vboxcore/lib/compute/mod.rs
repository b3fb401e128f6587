//! The compute façade.
//!
//! [`ComputeAdapter`] is the one entry point front ends talk to. It owns the catalogue, the
//! hypervisor binding, the master cache and the node creator, and dispatches the node, image,
//! hardware and master operations to them.

mod masters;
mod nodes;

use std::{sync::Arc, time::Duration};

use crate::{
    catalogue::{HardwareProfile, ImageCatalogue, ImageSpec},
    config::{ProviderConfig, DEFAULT_POLL_INTERVAL},
    fetch::FileFetcher,
    hypervisor::{
        self, ExecutionType, Hypervisor, MachineHandle, MachineState, SIMULATED_ENDPOINT,
    },
    master::{MasterBuilder, MasterCache},
    node::NodeCreator,
    preseed::PreseedServer,
    ssh::{BannerProbe, SshClient},
    VboxcoreResult,
};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use masters::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A cloud-like compute API over a local VirtualBox host.
pub struct ComputeAdapter {
    /// The hypervisor all machines live on.
    hypervisor: Arc<dyn Hypervisor>,

    /// The images and hardware profiles on offer.
    catalogue: Arc<ImageCatalogue>,

    /// The masters built by this process.
    masters: Arc<MasterCache>,

    /// Turns node requests into running clones.
    creator: NodeCreator,

    /// How machines are started.
    execution_type: ExecutionType,

    /// How long a guest gets to honour an ACPI shutdown.
    shutdown_timeout: Duration,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ComputeAdapter {
    /// Loads the catalogue and connects to the hypervisor named by `config`.
    ///
    /// With `simulate` the in-memory hypervisor is used whatever the configured endpoint is, and
    /// masters count as installed as soon as their guest powers off.
    pub async fn from_config(config: &ProviderConfig, simulate: bool) -> VboxcoreResult<Self> {
        let catalogue = ImageCatalogue::load(&config.catalogue_path()).await?;

        if simulate {
            let mut config = config.clone();
            config.timeouts.min_install = Duration::ZERO.into();
            let hypervisor = hypervisor::connect(SIMULATED_ENDPOINT)?;
            return Ok(Self::new(&config, catalogue, hypervisor));
        }

        let hypervisor = hypervisor::connect(&config.hypervisor.endpoint)?;
        Ok(Self::new(config, catalogue, hypervisor))
    }

    /// Wires the components for `config` around an already connected hypervisor.
    pub fn new(
        config: &ProviderConfig,
        catalogue: ImageCatalogue,
        hypervisor: Arc<dyn Hypervisor>,
    ) -> Self {
        Self::with_ssh(config, catalogue, hypervisor, Arc::new(BannerProbe))
    }

    /// Like [`new`](Self::new), deciding ssh readiness with `ssh`.
    pub fn with_ssh(
        config: &ProviderConfig,
        catalogue: ImageCatalogue,
        hypervisor: Arc<dyn Hypervisor>,
        ssh: Arc<dyn SshClient>,
    ) -> Self {
        let catalogue = Arc::new(catalogue);

        let builder = MasterBuilder::from_config(
            config,
            Arc::clone(&hypervisor),
            Arc::new(FileFetcher::new()),
            PreseedServer::new(config.preseed.clone()),
            Arc::clone(&ssh),
        );
        let masters = Arc::new(MasterCache::new(Arc::new(builder)));

        let creator = NodeCreator::builder()
            .hypervisor(Arc::clone(&hypervisor))
            .masters(Arc::clone(&masters))
            .catalogue(Arc::clone(&catalogue))
            .ssh(ssh)
            .execution_type(config.execution.execution_type)
            .default_clone_mode(config.clone.default_mode)
            .node_running_timeout(config.node_running_timeout())
            .build();

        Self {
            hypervisor,
            catalogue,
            masters,
            creator,
            execution_type: config.execution.execution_type,
            shutdown_timeout: config.timeouts.shutdown.get(),
        }
    }

    /// The images nodes can be created from, in catalogue order.
    pub fn list_images(&self) -> &[ImageSpec] {
        self.catalogue.images()
    }

    /// The hardware profiles nodes can be created with.
    pub fn list_hardware_profiles(&self) -> Vec<HardwareProfile> {
        self.catalogue.hardware_profiles()
    }

    /// The catalogue the adapter serves.
    pub fn catalogue(&self) -> &ImageCatalogue {
        &self.catalogue
    }

    /// Asks the guest to shut down and forces it off if it has not within the shutdown timeout.
    ///
    /// Only `PoweredOff` and `Aborted` machines count as off. A machine in a state VirtualBox does
    /// not accept ACPI requests in (paused, saved) is powered off directly, and a refusal is left
    /// for the following operation to report.
    async fn power_down(&self, handle: &MachineHandle) -> VboxcoreResult<()> {
        match self.hypervisor.get_state(handle).await? {
            MachineState::PoweredOff | MachineState::Aborted => return Ok(()),
            MachineState::Running => {
                self.hypervisor.acpi_shutdown(handle).await?;

                let stopped = hypervisor::wait_for_state(
                    self.hypervisor.as_ref(),
                    handle,
                    MachineState::PoweredOff,
                    DEFAULT_POLL_INTERVAL,
                    self.shutdown_timeout,
                )
                .await?;

                if stopped {
                    return Ok(());
                }

                tracing::warn!(%handle, timeout = ?self.shutdown_timeout, "guest ignored ACPI shutdown");
            }
            _ => {}
        }

        match self.hypervisor.get_state(handle).await? {
            MachineState::PoweredOff | MachineState::Aborted => Ok(()),
            MachineState::Null => {
                tracing::info!(%handle, "powering off machine in unrecognized state");
                if let Err(e) = self.hypervisor.stop_machine(handle).await {
                    tracing::warn!(%handle, error = %e, "power off refused");
                }
                Ok(())
            }
            state => {
                tracing::info!(%handle, %state, "powering machine off");
                self.hypervisor.stop_machine(handle).await
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl std::fmt::Debug for ComputeAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeAdapter")
            .field("images", &self.catalogue.images().len())
            .field("masters", &self.masters)
            .field("execution_type", &self.execution_type)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
