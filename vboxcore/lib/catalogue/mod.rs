//! The image catalogue.
//!
//! The catalogue is a YAML document listing the images nodes can be created from and, optionally,
//! the hardware profiles they can be created with:
//!
//! ```yaml
//! images:
//!   - id: ubuntu-22-amd64
//!     iso: http://releases.ubuntu.com/22.04/ubuntu-22.04-live-server-amd64.iso
//!
//! hardware:
//!   - id: medium
//!     cpus: 2
//!     memory_mib: 2048
//! ```
//!
//! The catalogue is validated as a whole when it is loaded and is immutable afterwards.

mod hardware;
mod image;
mod template;

use std::{collections::HashSet, path::Path};

use serde::{Deserialize, Serialize};

use crate::{VboxcoreError, VboxcoreResult};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use hardware::*;
pub use image::*;
pub use template::*;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The family preferred when no image is requested explicitly.
pub const PREFERRED_OS_FAMILY: &str = "ubuntu";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A validated set of images and hardware profiles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageCatalogue {
    images: Vec<ImageSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    hardware: Vec<HardwareProfile>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ImageCatalogue {
    /// Creates a catalogue from already parsed records.
    pub fn new(images: Vec<ImageSpec>, hardware: Vec<HardwareProfile>) -> VboxcoreResult<Self> {
        let catalogue = Self { images, hardware };
        catalogue.validate()?;
        Ok(catalogue)
    }

    /// Reads and validates the catalogue at `path`.
    pub async fn load(path: &Path) -> VboxcoreResult<Self> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            VboxcoreError::Catalogue(format!("failed to read {}: {e}", path.display()))
        })?;

        let catalogue = Self::parse(&contents)?;
        tracing::debug!(
            path = %path.display(),
            images = catalogue.images.len(),
            profiles = catalogue.hardware.len(),
            "loaded image catalogue"
        );

        Ok(catalogue)
    }

    /// Parses and validates a YAML catalogue document.
    pub fn parse(contents: &str) -> VboxcoreResult<Self> {
        let catalogue: Self = serde_yaml::from_str(contents)
            .map_err(|e| VboxcoreError::Catalogue(e.to_string()))?;

        catalogue.validate()?;
        Ok(catalogue)
    }

    /// The images, in declaration order.
    pub fn images(&self) -> &[ImageSpec] {
        &self.images
    }

    /// Looks up an image by id.
    pub fn image(&self, id: &str) -> Option<&ImageSpec> {
        self.images.iter().find(|image| image.id == id)
    }

    /// The image used when none is requested: the first `ubuntu` image, else the first image.
    pub fn default_image(&self) -> Option<&ImageSpec> {
        self.images
            .iter()
            .find(|image| image.os_family.eq_ignore_ascii_case(PREFERRED_OS_FAMILY))
            .or_else(|| self.images.first())
    }

    /// The hardware profiles: the declared ones, or the built-in ones when none are declared.
    pub fn hardware_profiles(&self) -> Vec<HardwareProfile> {
        if self.hardware.is_empty() {
            HardwareProfile::builtin()
        } else {
            self.hardware.clone()
        }
    }

    /// Looks up a hardware profile by id.
    pub fn hardware_profile(&self, id: &str) -> Option<HardwareProfile> {
        self.hardware_profiles()
            .into_iter()
            .find(|profile| profile.id == id)
    }

    fn validate(&self) -> VboxcoreResult<()> {
        let mut image_ids = HashSet::new();
        for image in &self.images {
            image.validate()?;
            if !image_ids.insert(image.id.as_str()) {
                return Err(VboxcoreError::Catalogue(format!(
                    "duplicate image id {:?}",
                    image.id
                )));
            }
        }

        let mut profile_ids = HashSet::new();
        for profile in &self.hardware {
            if profile.cpus == 0 || profile.memory_mib == 0 {
                return Err(VboxcoreError::Catalogue(format!(
                    "hardware profile {:?} needs at least one cpu and some memory",
                    profile.id
                )));
            }

            if !profile_ids.insert(profile.id.as_str()) {
                return Err(VboxcoreError::Catalogue(format!(
                    "duplicate hardware profile id {:?}",
                    profile.id
                )));
            }
        }

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOGUE: &str = r#"
images:
  - id: debian-12-amd64
    os_family: debian
    os_version: "12"
    iso: http://mirror.local/debian-12.iso
  - id: ubuntu-22-amd64
    os_family: ubuntu
    os_version: "22.04"
    iso: http://mirror.local/ubuntu.iso
    sha256: 5e38b55d57d94ff029719342357325ed3bda38fa80054f9330dc789cd2d43931
    boot_command: "<esc><wait>auto url={{preseed_url}}<enter>"
    login_credentials:
      username: ops
      password: hunter2
    disk_mib: 16384

hardware:
  - id: tiny
    cpu: 1
    mem: 512
  - id: medium
    cpus: 2
    memory_mib: 2048
"#;

    #[test]
    fn test_catalogue_parse() -> anyhow::Result<()> {
        let catalogue = ImageCatalogue::parse(CATALOGUE)?;

        assert_eq!(catalogue.images().len(), 2);

        let ubuntu = catalogue.image("ubuntu-22-amd64").unwrap();
        assert_eq!(ubuntu.get_install_medium_uri(), "http://mirror.local/ubuntu.iso");
        assert_eq!(ubuntu.get_disk_mib(), &16384);
        assert_eq!(ubuntu.get_login_credentials().get_username(), "ops");
        assert!(ubuntu.get_boot_command().uses(Slot::PreseedUrl));

        let debian = catalogue.image("debian-12-amd64").unwrap();
        assert_eq!(debian.get_disk_mib(), &8192);
        assert_eq!(debian.get_login_credentials(), &LoginCredentials::default());

        let tiny = catalogue.hardware_profile("tiny").unwrap();
        assert_eq!(tiny.get_memory_mib(), &512);
        assert!(catalogue.hardware_profile("small").is_none());

        Ok(())
    }

    #[test]
    fn test_catalogue_default_image_prefers_ubuntu() -> anyhow::Result<()> {
        let catalogue = ImageCatalogue::parse(CATALOGUE)?;
        assert_eq!(catalogue.default_image().unwrap().get_id(), "ubuntu-22-amd64");

        let only_debian = ImageCatalogue::parse(
            "images:\n  - id: debian\n    os_family: debian\n    iso: http://mirror.local/d.iso\n",
        )?;
        assert_eq!(only_debian.default_image().unwrap().get_id(), "debian");

        Ok(())
    }

    #[test]
    fn test_catalogue_builtin_hardware_profiles() -> anyhow::Result<()> {
        let catalogue =
            ImageCatalogue::parse("images:\n  - id: ubuntu\n    iso: http://mirror.local/u.iso\n")?;

        let ids = catalogue
            .hardware_profiles()
            .iter()
            .map(|profile| profile.get_id().clone())
            .collect::<Vec<_>>();
        assert_eq!(ids, ["small", "medium", "large"]);

        let large = catalogue.hardware_profile("large").unwrap();
        assert_eq!(
            (large.get_cpus(), large.get_memory_mib(), large.get_disk_mib()),
            (&4, &4096, &32768)
        );

        Ok(())
    }

    #[test]
    fn test_catalogue_rejects_duplicates_and_unknown_fields() {
        let duplicate = r#"
images:
  - id: ubuntu
    iso: http://mirror.local/a.iso
  - id: ubuntu
    iso: http://mirror.local/b.iso
"#;
        assert!(matches!(
            ImageCatalogue::parse(duplicate),
            Err(VboxcoreError::Catalogue(_))
        ));

        let unknown = r#"
images:
  - id: ubuntu
    iso: http://mirror.local/a.iso
    flavour: server
"#;
        assert!(matches!(
            ImageCatalogue::parse(unknown),
            Err(VboxcoreError::Catalogue(_))
        ));

        let bad_slot = r#"
images:
  - id: ubuntu
    iso: http://mirror.local/a.iso
    preseed_template: "d-i netcfg/get_domain string {{domain}}"
"#;
        assert!(matches!(
            ImageCatalogue::parse(bad_slot),
            Err(VboxcoreError::Catalogue(_))
        ));

        let duplicate_profile = r#"
images: []
hardware:
  - { id: small, cpus: 1, memory_mib: 512 }
  - { id: small, cpus: 2, memory_mib: 1024 }
"#;
        assert!(ImageCatalogue::parse(duplicate_profile).is_err());
    }

    #[test]
    fn test_example_catalogue_parses() -> anyhow::Result<()> {
        let catalogue = ImageCatalogue::parse(include_str!("../../images.example.yaml"))?;

        assert_eq!(catalogue.images().len(), 2);
        assert_eq!(
            catalogue.default_image().map(|image| image.get_id().as_str()),
            Some("ubuntu-18-amd64")
        );
        assert_eq!(catalogue.hardware_profiles().len(), 2);

        Ok(())
    }
}
