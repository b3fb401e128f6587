use serde::{Deserialize, Serialize};

use crate::{
    config::{master_name, MASTER_NAME_PREFIX},
    hypervisor::{IMAGE_ID_KEY, INSTALL_STATE_COMPLETE, INSTALL_STATE_KEY},
    node::NodeState,
    VboxcoreError, VboxcoreResult,
};

use super::ComputeAdapter;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A master machine registered with the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterSummary {
    /// The image the master was installed from.
    pub image_id: String,

    /// The machine name.
    pub name: String,

    /// The hypervisor's identifier of the machine.
    pub id: String,

    /// The abstract state of the machine.
    pub state: NodeState,

    /// Whether the install finished.
    pub complete: bool,

    /// Whether this process holds the master in its cache.
    pub cached: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ComputeAdapter {
    /// Lists the master machines, finished or not, ordered by image id.
    pub async fn list_masters(&self) -> VboxcoreResult<Vec<MasterSummary>> {
        let mut masters = Vec::new();

        for handle in self.hypervisor.list_machines().await? {
            let info = match self.hypervisor.machine_info(&handle).await {
                Ok(info) => info,
                Err(e) => {
                    tracing::debug!(%handle, error = %e, "skipping machine");
                    continue;
                }
            };

            let Some(suffix) = info.name.strip_prefix(MASTER_NAME_PREFIX) else {
                continue;
            };

            let image_id = self
                .hypervisor
                .get_extra_data(&handle, IMAGE_ID_KEY)
                .await?
                .unwrap_or_else(|| suffix.to_string());
            let complete = self
                .hypervisor
                .get_extra_data(&handle, INSTALL_STATE_KEY)
                .await?
                .as_deref()
                == Some(INSTALL_STATE_COMPLETE);

            masters.push(MasterSummary {
                cached: self.masters.peek(&image_id).is_some(),
                image_id,
                name: info.name.clone(),
                id: handle.to_string(),
                state: info.state.into(),
                complete,
            });
        }

        masters.sort_by(|a, b| a.image_id.cmp(&b.image_id));
        Ok(masters)
    }

    /// Forgets the master of `image_id` and deletes its machine.
    ///
    /// The next node created from the image installs a fresh master.
    pub async fn destroy_master(&self, image_id: &str) -> VboxcoreResult<()> {
        let cached = self.masters.invalidate(image_id);
        let name = master_name(image_id);

        let Some(handle) = self.hypervisor.find_by_name(&name).await? else {
            if cached.is_some() {
                tracing::info!(image_id, name, "master machine already gone");
                return Ok(());
            }
            return Err(VboxcoreError::NotFound(format!("master of image {image_id}")));
        };

        self.power_down(&handle).await?;
        self.hypervisor.delete_machine(&handle).await?;

        tracing::info!(image_id, name, %handle, "master destroyed");
        Ok(())
    }
}
