use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::config::DEFAULT_DISK_MIB;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A named hardware shape nodes can be created with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub with_prefix")]
pub struct HardwareProfile {
    /// The profile identifier.
    #[builder(setter(into))]
    pub(super) id: String,

    /// The number of vCPUs.
    #[serde(alias = "cpu")]
    pub(super) cpus: u32,

    /// The amount of RAM in MiB.
    #[serde(alias = "mem", alias = "memory")]
    pub(super) memory_mib: u32,

    /// The advisory disk size in MiB. Clones inherit the master's disk.
    #[serde(default = "default_disk_mib")]
    #[builder(default = DEFAULT_DISK_MIB)]
    pub(super) disk_mib: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HardwareProfile {
    /// The profiles offered when the catalogue declares none.
    pub fn builtin() -> Vec<HardwareProfile> {
        vec![
            HardwareProfile::builder()
                .id("small")
                .cpus(1)
                .memory_mib(1024)
                .disk_mib(8192)
                .build(),
            HardwareProfile::builder()
                .id("medium")
                .cpus(2)
                .memory_mib(2048)
                .disk_mib(16384)
                .build(),
            HardwareProfile::builder()
                .id("large")
                .cpus(4)
                .memory_mib(4096)
                .disk_mib(32768)
                .build(),
        ]
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn default_disk_mib() -> u64 {
    DEFAULT_DISK_MIB
}
