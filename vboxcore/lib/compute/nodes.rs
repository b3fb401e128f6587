use crate::{
    config::MASTER_NAME_PREFIX,
    hypervisor::{MachineHandle, MachineState, IMAGE_ID_KEY, SSH_PORT_KEY},
    node::{NodeAndInitialCredentials, NodeMetadata, NodeSpec},
    utils, VboxcoreError, VboxcoreResult,
};

use super::ComputeAdapter;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ComputeAdapter {
    /// Lists every node, ordered by name. Masters are not nodes and are left out.
    pub async fn list_nodes(&self) -> VboxcoreResult<Vec<NodeMetadata>> {
        let mut nodes = Vec::new();

        for handle in self.hypervisor.list_machines().await? {
            match self.describe(&handle).await {
                Ok(node) if node.name.starts_with(MASTER_NAME_PREFIX) => {}
                Ok(node) => nodes.push(node),
                Err(e) => {
                    // Machines may vanish between listing and inspection.
                    tracing::debug!(%handle, error = %e, "skipping machine");
                }
            }
        }

        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(nodes)
    }

    /// Creates a node from a master of its image and waits until it answers on ssh.
    pub async fn create_node(&self, spec: NodeSpec) -> VboxcoreResult<NodeAndInitialCredentials> {
        self.creator.create(spec).await
    }

    /// Looks a node up by name.
    pub async fn get_node(&self, name: &str) -> VboxcoreResult<Option<NodeMetadata>> {
        if name.starts_with(MASTER_NAME_PREFIX) {
            return Ok(None);
        }

        match self.hypervisor.find_by_name(name).await? {
            Some(handle) => self.describe(&handle).await.map(Some),
            None => Ok(None),
        }
    }

    /// Shuts a node down and deletes it along with its disk.
    pub async fn destroy_node(&self, name: &str) -> VboxcoreResult<()> {
        let handle = self.node_handle(name).await?;
        let ssh_port = self.ssh_port(&handle).await?;

        self.power_down(&handle).await?;
        self.hypervisor.delete_machine(&handle).await?;

        if let Some(port) = ssh_port {
            utils::release_local_port(port);
        }

        tracing::info!(name, %handle, "node destroyed");
        Ok(())
    }

    /// Shuts a node down and starts it again.
    pub async fn reboot_node(&self, name: &str) -> VboxcoreResult<NodeMetadata> {
        let handle = self.node_handle(name).await?;

        self.power_down(&handle).await?;
        self.hypervisor
            .start_machine(&handle, self.execution_type)
            .await?;

        tracing::info!(name, %handle, "node rebooted");
        self.describe(&handle).await
    }

    /// Shuts a node down, keeping it around to be resumed.
    pub async fn suspend_node(&self, name: &str) -> VboxcoreResult<NodeMetadata> {
        let handle = self.node_handle(name).await?;

        self.power_down(&handle).await?;

        tracing::info!(name, %handle, "node suspended");
        self.describe(&handle).await
    }

    /// Starts a suspended node. Running nodes are left alone, and nodes in any other state are
    /// powered down first.
    pub async fn resume_node(&self, name: &str) -> VboxcoreResult<NodeMetadata> {
        let handle = self.node_handle(name).await?;

        if self.hypervisor.get_state(&handle).await? != MachineState::Running {
            self.power_down(&handle).await?;
            self.hypervisor
                .start_machine(&handle, self.execution_type)
                .await?;
            tracing::info!(name, %handle, "node resumed");
        }

        self.describe(&handle).await
    }

    async fn node_handle(&self, name: &str) -> VboxcoreResult<MachineHandle> {
        let handle = if name.starts_with(MASTER_NAME_PREFIX) {
            None
        } else {
            self.hypervisor.find_by_name(name).await?
        };

        handle.ok_or_else(|| VboxcoreError::NotFound(format!("node {name}")))
    }

    async fn ssh_port(&self, handle: &MachineHandle) -> VboxcoreResult<Option<u16>> {
        Ok(self
            .hypervisor
            .get_extra_data(handle, SSH_PORT_KEY)
            .await?
            .and_then(|port| port.parse::<u16>().ok()))
    }

    /// Reads a machine's record and the tags vboxcore left on it.
    async fn describe(&self, handle: &MachineHandle) -> VboxcoreResult<NodeMetadata> {
        let info = self.hypervisor.machine_info(handle).await?;
        let image_id = self.hypervisor.get_extra_data(handle, IMAGE_ID_KEY).await?;
        let ssh_port = self.ssh_port(handle).await?;

        let login_credentials = image_id
            .as_deref()
            .and_then(|id| self.catalogue.image(id))
            .map(|image| image.get_login_credentials().clone());

        Ok(NodeMetadata::from_machine(
            info,
            image_id,
            login_credentials,
            ssh_port,
        ))
    }
}
