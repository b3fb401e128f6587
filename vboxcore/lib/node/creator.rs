use std::{sync::Arc, time::Duration};

use typed_builder::TypedBuilder;

use crate::{
    catalogue::ImageCatalogue,
    config::{DEFAULT_NODE_RUNNING_TIMEOUT, MASTER_NAME_PREFIX},
    hypervisor::{
        self, CloneMode, ExecutionType, Hypervisor, MachineHandle, IMAGE_ID_KEY, SSH_PORT_KEY,
    },
    master::{Master, MasterCache},
    ssh::{self, SshClient, SshEndpoint},
    utils::{self, KeyedLocks},
    VboxcoreError, VboxcoreResult,
};

use super::{NodeAndInitialCredentials, NodeMetadata, NodeSpec};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Creates nodes by cloning the master of their image.
#[derive(TypedBuilder)]
pub struct NodeCreator {
    /// The hypervisor nodes are created on.
    hypervisor: Arc<dyn Hypervisor>,

    /// The masters nodes are cloned from.
    masters: Arc<MasterCache>,

    /// The images nodes may be created from.
    catalogue: Arc<ImageCatalogue>,

    /// Decides when a node is usable.
    ssh: Arc<dyn SshClient>,

    /// How nodes are started.
    #[builder(default)]
    execution_type: ExecutionType,

    /// The clone mode of requests that do not name one.
    #[builder(default)]
    default_clone_mode: CloneMode,

    /// The ceiling on waiting for a node to answer on ssh.
    #[builder(default = DEFAULT_NODE_RUNNING_TIMEOUT)]
    node_running_timeout: Duration,

    /// Serializes creation per node name.
    #[builder(default, setter(skip))]
    names: KeyedLocks<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl NodeCreator {
    /// Creates a node and waits until it answers on ssh.
    ///
    /// A node that never answers is left in place for diagnosis and reported as
    /// [`VboxcoreError::NodeUnreachable`]. Any other failure after cloning removes the clone.
    pub async fn create(&self, spec: NodeSpec) -> VboxcoreResult<NodeAndInitialCredentials> {
        validate_name(&spec.name)?;

        let image = self.catalogue.image(&spec.image_id).ok_or_else(|| {
            VboxcoreError::Catalogue(format!("unknown image {:?}", spec.image_id))
        })?;

        let master = self.masters.get(image).await?;

        let name_guard = self.names.lock(&spec.name).await;
        if let Some(existing) = self.hypervisor.find_by_name(&spec.name).await? {
            tracing::debug!(name = spec.name, %existing, "node name taken");
            return Err(VboxcoreError::NameCollision(spec.name));
        }

        let mode = spec.clone_mode.unwrap_or(self.default_clone_mode);
        let handle = self
            .hypervisor
            .clone_machine(master.get_machine_handle(), &spec.name, mode)
            .await?;
        drop(name_guard);

        tracing::info!(name = spec.name, %handle, %mode, image_id = spec.image_id, "cloned node");

        let ssh_port = match self.configure_and_start(&spec, &handle).await {
            Ok(port) => port,
            Err(e) => {
                tracing::warn!(name = spec.name, %handle, error = %e, "node start failed, removing clone");
                hypervisor::force_remove(self.hypervisor.as_ref(), &handle).await;
                return Err(e);
            }
        };

        let endpoint = SshEndpoint::loopback(ssh_port);
        if !ssh::wait_for_ssh(self.ssh.as_ref(), &endpoint, self.node_running_timeout).await {
            tracing::warn!(name = spec.name, %handle, %endpoint, "node did not answer on ssh");
            return Err(VboxcoreError::NodeUnreachable {
                name: spec.name,
                timeout: self.node_running_timeout,
            });
        }

        let node = self.describe(&spec, &handle, &master, ssh_port).await?;
        tracing::info!(name = node.name, state = %node.state, %endpoint, "node ready");

        Ok(NodeAndInitialCredentials {
            node_id: node.id.clone(),
            node,
            credentials: master.get_login_credentials().clone(),
        })
    }

    /// Gives the clone its hardware and an ssh forward, tags it and powers it on. The forwarded
    /// port goes back to the pool when any step fails.
    async fn configure_and_start(
        &self,
        spec: &NodeSpec,
        handle: &MachineHandle,
    ) -> VboxcoreResult<u16> {
        let ssh_port = utils::free_local_port()?;

        match self.apply(spec, handle, ssh_port).await {
            Ok(()) => Ok(ssh_port),
            Err(e) => {
                utils::release_local_port(ssh_port);
                Err(e)
            }
        }
    }

    async fn apply(
        &self,
        spec: &NodeSpec,
        handle: &MachineHandle,
        ssh_port: u16,
    ) -> VboxcoreResult<()> {
        self.hypervisor
            .set_hardware(handle, &spec.hardware.settings_with_ssh(ssh_port))
            .await?;
        self.hypervisor
            .set_extra_data(handle, IMAGE_ID_KEY, &spec.image_id)
            .await?;
        self.hypervisor
            .set_extra_data(handle, SSH_PORT_KEY, &ssh_port.to_string())
            .await?;
        self.hypervisor
            .start_machine(handle, self.execution_type)
            .await?;

        Ok(())
    }

    async fn describe(
        &self,
        spec: &NodeSpec,
        handle: &MachineHandle,
        master: &Master,
        ssh_port: u16,
    ) -> VboxcoreResult<NodeMetadata> {
        let info = self.hypervisor.machine_info(handle).await?;

        Ok(NodeMetadata::from_machine(
            info,
            Some(spec.image_id.clone()),
            Some(master.get_login_credentials().clone()),
            Some(ssh_port),
        ))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn validate_name(name: &str) -> VboxcoreResult<()> {
    if name.trim().is_empty() {
        return Err(VboxcoreError::Config("node name must not be empty".to_string()));
    }

    if name.starts_with(MASTER_NAME_PREFIX) {
        return Err(VboxcoreError::NameCollision(format!(
            "{name} (names starting with {MASTER_NAME_PREFIX} are reserved for masters)"
        )));
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
