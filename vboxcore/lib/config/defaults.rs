use std::{path::PathBuf, sync::LazyLock, time::Duration};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The directory, relative to the user's home, where vboxcore keeps its files.
pub const VBOXCORE_HOME_DIR: &str = ".vboxcore";

/// The environment variable that overrides the vboxcore home directory.
pub const VBOXCORE_HOME_ENV_VAR: &str = "VBOXCORE_HOME";

/// The configuration file looked up in the vboxcore home directory.
pub const CONFIG_FILENAME: &str = "config.toml";

/// The image catalogue looked up in the vboxcore home directory.
pub const CATALOGUE_FILENAME: &str = "images.yaml";

/// The sub directory of the home directory where install media are cached.
pub const DOWNLOAD_SUBDIR: &str = "isos";

/// The hypervisor endpoint used when none is configured.
pub const DEFAULT_HYPERVISOR_ENDPOINT: &str = "vboxmanage";

/// The address the preseed server binds to.
pub const DEFAULT_PRESEED_BIND_HOST: &str = "0.0.0.0";

/// The port the preseed server binds to. Zero picks an ephemeral port.
pub const DEFAULT_PRESEED_PORT: u16 = 0;

/// The host guests use to reach the preseed server. This is the gateway of VirtualBox's NAT
/// network.
pub const DEFAULT_PRESEED_ADVERTISE_HOST: &str = "10.0.2.2";

/// The ceiling on a master install.
pub const DEFAULT_INSTALL_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// A guest that powers off sooner than this after boot has not finished installing.
pub const DEFAULT_MIN_INSTALL_TIME: Duration = Duration::from_secs(60);

/// The ceiling on waiting for a fresh node to answer on ssh.
pub const DEFAULT_NODE_RUNNING_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// How long a guest gets to honour an ACPI shutdown before it is powered off.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

/// The cadence of every readiness and state polling loop.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// The number of vCPUs a master is installed with.
pub const DEFAULT_MASTER_CPUS: u32 = 1;

/// The amount of RAM in MiB a master is installed with.
pub const DEFAULT_MASTER_MEMORY_MIB: u32 = 1024;

/// The size in MiB of a master's disk when the image does not say.
pub const DEFAULT_DISK_MIB: u64 = 8192;

/// The prefix of every master machine name.
pub const MASTER_NAME_PREFIX: &str = "master-";

/// The guest port probed for ssh readiness.
pub const SSH_GUEST_PORT: u16 = 22;

/// The name of the NAT rule forwarding a host port to the guest's ssh port.
pub const SSH_FORWARD_RULE: &str = "ssh";

/// The path the preseed document is served under.
pub const PRESEED_PATH: &str = "/preseed.cfg";

/// The path where all vboxcore global data is stored.
pub static DEFAULT_VBOXCORE_HOME: LazyLock<PathBuf> = LazyLock::new(|| {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(VBOXCORE_HOME_DIR)
});

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the vboxcore home directory, honouring `VBOXCORE_HOME`.
pub fn get_vboxcore_home_path() -> PathBuf {
    match std::env::var(VBOXCORE_HOME_ENV_VAR) {
        Ok(path) if !path.is_empty() => PathBuf::from(path),
        _ => DEFAULT_VBOXCORE_HOME.clone(),
    }
}

/// Returns the machine name of the master built for an image.
pub fn master_name(image_id: &str) -> String {
    format!("{MASTER_NAME_PREFIX}{image_id}")
}
