//! The provider configuration file.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    hypervisor::{CloneMode, ExecutionType},
    VboxcoreError, VboxcoreResult,
};

use super::{
    get_vboxcore_home_path, ConfigDuration, CATALOGUE_FILENAME, CONFIG_FILENAME,
    DEFAULT_HYPERVISOR_ENDPOINT, DEFAULT_INSTALL_TIMEOUT, DEFAULT_MIN_INSTALL_TIME,
    DEFAULT_NODE_RUNNING_TIMEOUT, DEFAULT_PRESEED_ADVERTISE_HOST, DEFAULT_PRESEED_BIND_HOST,
    DEFAULT_PRESEED_PORT, DEFAULT_SHUTDOWN_TIMEOUT, DOWNLOAD_SUBDIR,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The provider configuration, usually read from `$VBOXCORE_HOME/config.toml`.
///
/// Every key is optional. Keys may be written in snake case or in the camel case used by older
/// configuration files (`bindHost`, `nodeRunning`, ...).
///
/// ## Examples
///
/// ```
/// use std::time::Duration;
/// use vboxcore::config::ProviderConfig;
///
/// let config: ProviderConfig = toml::from_str(r#"
///     [timeouts]
///     node_running = "10s"
///
///     [clone]
///     default_mode = "full"
/// "#).unwrap();
///
/// assert_eq!(config.timeouts.node_running.get(), Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderConfig {
    /// Where the hypervisor lives.
    pub hypervisor: HypervisorSection,

    /// Where install media are cached.
    pub download: DownloadSection,

    /// How the preseed server is exposed.
    pub preseed: PreseedSection,

    /// Ceilings on blocking operations.
    pub timeouts: TimeoutsSection,

    /// How machines are started.
    pub execution: ExecutionSection,

    /// How nodes are cloned.
    pub clone: CloneSection,

    /// Where the image catalogue lives.
    pub catalogue: CatalogueSection,

    /// How master builds behave.
    pub master: MasterSection,
}

/// The `[hypervisor]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HypervisorSection {
    /// Selects the hypervisor binding: `vboxmanage`, `vboxmanage:/path/to/VBoxManage` or
    /// `simulated`.
    pub endpoint: String,
}

/// The `[download]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DownloadSection {
    /// The install media cache. Defaults to `$VBOXCORE_HOME/isos`.
    pub dir: Option<PathBuf>,
}

/// The `[preseed]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PreseedSection {
    /// The interface the preseed server binds to.
    #[serde(alias = "bindHost")]
    pub bind_host: String,

    /// The port the preseed server binds to. Zero picks an ephemeral port.
    pub port: u16,

    /// The host name or address guests use to reach the preseed server.
    #[serde(alias = "advertiseHost")]
    pub advertise_host: String,
}

/// The `[timeouts]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutsSection {
    /// The ceiling on a master install.
    pub install: ConfigDuration,

    /// A guest powering off before this much time has passed has not finished installing.
    #[serde(alias = "minInstall")]
    pub min_install: ConfigDuration,

    /// The ceiling on waiting for a node to answer on ssh.
    #[serde(alias = "nodeRunning")]
    pub node_running: ConfigDuration,

    /// How long a guest gets to honour an ACPI shutdown.
    pub shutdown: ConfigDuration,
}

/// The `[execution]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutionSection {
    /// The front end machines are started with.
    #[serde(rename = "type")]
    pub execution_type: ExecutionType,
}

/// The `[clone]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CloneSection {
    /// The clone mode used when a request does not name one.
    #[serde(alias = "defaultMode")]
    pub default_mode: CloneMode,
}

/// The `[catalogue]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CatalogueSection {
    /// The image catalogue. Defaults to `$VBOXCORE_HOME/images.yaml`.
    pub path: Option<PathBuf>,
}

/// The `[master]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MasterSection {
    /// Keep machines of failed master installs around for diagnosis.
    #[serde(alias = "keepPartials")]
    pub keep_partials: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ProviderConfig {
    /// Loads the configuration.
    ///
    /// An explicit `path` must exist. Without one, `$VBOXCORE_HOME/config.toml` is read when it
    /// exists and the defaults are used otherwise.
    pub async fn load(path: Option<&Path>) -> VboxcoreResult<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let path = get_vboxcore_home_path().join(CONFIG_FILENAME);
                if !tokio::fs::try_exists(&path).await? {
                    tracing::debug!(path = %path.display(), "no configuration file, using defaults");
                    return Ok(Self::default());
                }
                path
            }
        };

        let contents = tokio::fs::read_to_string(&path).await.map_err(|e| {
            VboxcoreError::Config(format!("failed to read {}: {e}", path.display()))
        })?;

        let config = Self::parse(&contents)
            .map_err(|e| VboxcoreError::Config(format!("{}: {e}", path.display())))?;

        tracing::debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Parses a TOML configuration document.
    pub fn parse(contents: &str) -> VboxcoreResult<Self> {
        toml::from_str(contents).map_err(|e| VboxcoreError::Config(e.to_string()))
    }

    /// The install media cache directory.
    pub fn download_dir(&self) -> PathBuf {
        self.download
            .dir
            .clone()
            .unwrap_or_else(|| get_vboxcore_home_path().join(DOWNLOAD_SUBDIR))
    }

    /// The image catalogue path.
    pub fn catalogue_path(&self) -> PathBuf {
        self.catalogue
            .path
            .clone()
            .unwrap_or_else(|| get_vboxcore_home_path().join(CATALOGUE_FILENAME))
    }

    /// The ceiling on a master install.
    pub fn install_timeout(&self) -> Duration {
        self.timeouts.install.get()
    }

    /// The ceiling on waiting for a node to answer on ssh.
    pub fn node_running_timeout(&self) -> Duration {
        self.timeouts.node_running.get()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for HypervisorSection {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_HYPERVISOR_ENDPOINT.to_string(),
        }
    }
}

impl Default for PreseedSection {
    fn default() -> Self {
        Self {
            bind_host: DEFAULT_PRESEED_BIND_HOST.to_string(),
            port: DEFAULT_PRESEED_PORT,
            advertise_host: DEFAULT_PRESEED_ADVERTISE_HOST.to_string(),
        }
    }
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            install: DEFAULT_INSTALL_TIMEOUT.into(),
            min_install: DEFAULT_MIN_INSTALL_TIME.into(),
            node_running: DEFAULT_NODE_RUNNING_TIMEOUT.into(),
            shutdown: DEFAULT_SHUTDOWN_TIMEOUT.into(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
