//! Master machines.
//!
//! A master is the installed golden machine of one catalogue image. Nodes are cloned from it.
//! [`MasterBuilder`] installs a master from scratch and [`MasterCache`] makes sure each image's
//! master is built at most once at a time.

mod builder;
mod cache;

use std::path::PathBuf;

use async_trait::async_trait;
use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    catalogue::{ImageSpec, LoginCredentials},
    hypervisor::MachineHandle,
    VboxcoreResult,
};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use builder::*;
pub use cache::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An installed, powered-off machine nodes of one image are cloned from.
///
/// Masters are never modified once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder, Getters)]
#[builder(builder_type(name = MasterRecordBuilder))]
#[getset(get = "pub with_prefix")]
pub struct Master {
    /// The image the master was installed from.
    #[builder(setter(into))]
    image_id: String,

    /// The master machine.
    machine_handle: MachineHandle,

    /// The disk linked clones are layered over.
    #[builder(setter(into))]
    source_hard_disk_path: PathBuf,

    /// How to log into the master and its clones.
    login_credentials: LoginCredentials,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Produces the master of an image.
#[async_trait]
pub trait BuildMaster: Send + Sync {
    /// Builds, or adopts an already finished, master for `spec`.
    async fn build(&self, spec: &ImageSpec) -> VboxcoreResult<Master>;
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
