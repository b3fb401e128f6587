use std::path::PathBuf;

use getset::Getters;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{config::DEFAULT_DISK_MIB, VboxcoreError, VboxcoreResult};

use super::{Slot, Template, TemplateContext, DEFAULT_BOOT_COMMAND, DEFAULT_PRESEED_TEMPLATE};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const DEFAULT_OS_FAMILY: &str = "ubuntu";
const DEFAULT_OS_ARCH: &str = "amd64";
const DEFAULT_USERNAME: &str = "vboxcore";
const DEFAULT_PASSWORD: &str = "vboxcore";
const SHA256_HEX_LEN: usize = 64;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An installable operating system image, as declared in the catalogue.
///
/// ## Examples
///
/// ```yaml
/// id: ubuntu-22-amd64
/// os_family: ubuntu
/// os_version: "22.04"
/// iso: http://releases.ubuntu.com/22.04/ubuntu-22.04-live-server-amd64.iso
/// sha256: 5e38b55d57d94ff029719342357325ed3bda38fa80054f9330dc789cd2d43931
/// login_credentials:
///   username: ops
///   password: ops
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub with_prefix")]
pub struct ImageSpec {
    /// The catalogue key.
    #[builder(setter(into))]
    pub(super) id: String,

    /// The operating system family, e.g. `ubuntu`.
    #[serde(default = "default_os_family")]
    #[builder(default = DEFAULT_OS_FAMILY.to_string(), setter(into))]
    pub(super) os_family: String,

    /// The operating system version, e.g. `22.04`.
    #[serde(default)]
    #[builder(default, setter(into))]
    pub(super) os_version: String,

    /// The guest architecture, e.g. `amd64`.
    #[serde(default = "default_os_arch")]
    #[builder(default = DEFAULT_OS_ARCH.to_string(), setter(into))]
    pub(super) os_arch: String,

    /// The VirtualBox OS type id. Derived from the family and architecture when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option, into))]
    pub(super) os_type_hint: Option<String>,

    /// Where the install ISO is downloaded from.
    #[serde(alias = "iso")]
    #[builder(setter(into))]
    pub(super) install_medium_uri: String,

    /// The lowercase hex sha256 of the install ISO.
    #[serde(default, alias = "sha256", skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option, into))]
    pub(super) install_medium_sha256: Option<String>,

    /// The unattended-install document served to the installer.
    #[serde(default = "default_preseed_template")]
    #[builder(default = default_preseed_template())]
    pub(super) preseed_template: Template,

    /// The keystrokes typed into the boot loader.
    #[serde(default = "default_boot_command", alias = "keystroke_sequence")]
    #[builder(default = default_boot_command())]
    pub(super) boot_command: Template,

    /// How to log in once the image is installed.
    #[serde(default)]
    #[builder(default)]
    pub(super) login_credentials: LoginCredentials,

    /// The size of the master's disk in MiB.
    #[serde(default = "default_disk_mib")]
    #[builder(default = DEFAULT_DISK_MIB)]
    pub(super) disk_mib: u64,
}

/// The account created by the unattended install.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TypedBuilder, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub with_prefix")]
pub struct LoginCredentials {
    /// The login user.
    #[builder(setter(into))]
    pub(crate) username: String,

    /// The login password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option, into))]
    pub(crate) password: Option<String>,

    /// The private key to log in with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option, into))]
    pub(crate) private_key_path: Option<PathBuf>,

    /// The public key authorized for the user during the install.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option, into))]
    pub(crate) authorized_key: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ImageSpec {
    /// The install ISO location as a URL.
    pub fn install_medium_url(&self) -> VboxcoreResult<Url> {
        Url::parse(&self.install_medium_uri).map_err(|e| {
            VboxcoreError::Catalogue(format!("invalid uri {:?}: {e}", self.install_medium_uri))
        })
    }

    /// The VirtualBox OS type the master is created with.
    pub fn os_type(&self) -> String {
        if let Some(hint) = &self.os_type_hint {
            return hint.clone();
        }

        let family = match self.os_family.to_ascii_lowercase().as_str() {
            "ubuntu" => "Ubuntu",
            "debian" => "Debian",
            "fedora" => "Fedora",
            "centos" | "rhel" | "redhat" => "RedHat",
            "opensuse" | "suse" => "OpenSUSE",
            _ => "Linux26",
        };

        match self.os_arch.to_ascii_lowercase().as_str() {
            "amd64" | "x86_64" | "x64" | "arm64" | "aarch64" => format!("{family}_64"),
            _ => family.to_string(),
        }
    }

    /// The values substituted into this image's templates.
    pub fn template_context(&self, hostname: &str, preseed_url: Option<&str>) -> TemplateContext {
        TemplateContext {
            hostname: hostname.to_string(),
            username: self.login_credentials.username.clone(),
            password: self.login_credentials.password.clone().unwrap_or_default(),
            ssh_key: self
                .login_credentials
                .authorized_key
                .clone()
                .unwrap_or_default(),
            preseed_url: preseed_url.map(str::to_string),
        }
    }

    /// Checks everything serde cannot.
    pub fn validate(&self) -> VboxcoreResult<()> {
        let invalid =
            |message: String| VboxcoreError::Catalogue(format!("image {}: {message}", self.id));

        if self.id.trim().is_empty() {
            return Err(VboxcoreError::Catalogue("image id must not be empty".to_string()));
        }

        let url = Url::parse(&self.install_medium_uri)
            .map_err(|e| invalid(format!("invalid uri {:?}: {e}", self.install_medium_uri)))?;
        if !matches!(url.scheme(), "http" | "https" | "file") {
            return Err(invalid(format!(
                "unsupported install medium scheme {:?}",
                url.scheme()
            )));
        }

        if let Some(digest) = &self.install_medium_sha256 {
            if digest.len() != SHA256_HEX_LEN || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(invalid(format!("{digest:?} is not a sha256 hex digest")));
            }
        }

        if self.preseed_template.uses(Slot::PreseedUrl) {
            return Err(invalid(format!(
                "{} may only be used in the boot command",
                Slot::PreseedUrl
            )));
        }

        self.login_credentials.validate().map_err(invalid)
    }
}

impl LoginCredentials {
    fn validate(&self) -> Result<(), String> {
        if self.username.trim().is_empty() {
            return Err("login username must not be empty".to_string());
        }

        if self.password.is_none() && self.private_key_path.is_none() {
            return Err("login credentials need a password or a private key path".to_string());
        }

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn default_os_family() -> String {
    DEFAULT_OS_FAMILY.to_string()
}

fn default_os_arch() -> String {
    DEFAULT_OS_ARCH.to_string()
}

fn default_disk_mib() -> u64 {
    DEFAULT_DISK_MIB
}

fn default_preseed_template() -> Template {
    Template::parse(DEFAULT_PRESEED_TEMPLATE)
        .unwrap_or_else(|_| Template::verbatim(DEFAULT_PRESEED_TEMPLATE))
}

fn default_boot_command() -> Template {
    Template::parse(DEFAULT_BOOT_COMMAND).unwrap_or_else(|_| Template::verbatim(DEFAULT_BOOT_COMMAND))
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for LoginCredentials {
    fn default() -> Self {
        Self {
            username: DEFAULT_USERNAME.to_string(),
            password: Some(DEFAULT_PASSWORD.to_string()),
            private_key_path: None,
            authorized_key: None,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
