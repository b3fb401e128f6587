use std::{
    fmt::{self, Display},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::{VboxcoreError, VboxcoreResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const SLOT_OPEN: &str = "{{";
const SLOT_CLOSE: &str = "}}";

/// The preseed document used when an image does not declare one. It creates the login user,
/// installs an ssh server and powers the guest off once the install is finished.
pub const DEFAULT_PRESEED_TEMPLATE: &str = r#"d-i debian-installer/locale string en_US.UTF-8
d-i keyboard-configuration/xkb-keymap select us
d-i netcfg/choose_interface select auto
d-i netcfg/get_hostname string {{hostname}}
d-i netcfg/get_domain string localdomain
d-i mirror/country string manual
d-i mirror/http/hostname string archive.ubuntu.com
d-i mirror/http/directory string /ubuntu
d-i mirror/http/proxy string
d-i clock-setup/utc boolean true
d-i time/zone string UTC
d-i partman-auto/method string regular
d-i partman-auto/choose_recipe select atomic
d-i partman/confirm_write_new_label boolean true
d-i partman/choose_partition select finish
d-i partman/confirm boolean true
d-i partman/confirm_nooverwrite boolean true
d-i passwd/root-login boolean false
d-i passwd/user-fullname string {{username}}
d-i passwd/username string {{username}}
d-i passwd/user-password password {{password}}
d-i passwd/user-password-again password {{password}}
d-i user-setup/allow-password-weak boolean true
d-i user-setup/encrypt-home boolean false
d-i pkgsel/include string openssh-server sudo
d-i pkgsel/update-policy select none
d-i grub-installer/only_debian boolean true
d-i preseed/late_command string in-target sh -c 'mkdir -p /home/{{username}}/.ssh && echo "{{ssh_key}}" >> /home/{{username}}/.ssh/authorized_keys && echo "{{username}} ALL=(ALL) NOPASSWD: ALL" > /etc/sudoers.d/{{username}}'
d-i finish-install/reboot_in_progress note
d-i debian-installer/exit/poweroff boolean true
"#;

/// The keystrokes typed into the boot loader when an image does not declare them. They start the
/// installer in automatic mode pointed at the preseed server.
pub const DEFAULT_BOOT_COMMAND: &str = "<esc><wait><esc><wait><enter><wait>/install/vmlinuz noapic preseed/url={{preseed_url}} debian-installer=en_US auto locale=en_US kbd-chooser/method=us hostname={{hostname}} fb=false debconf/frontend=noninteractive keyboard-configuration/layout=USA keyboard-configuration/variant=USA console-setup/ask_detect=false initrd=/install/initrd.gz -- <enter>";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A named placeholder in a [`Template`]. The set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// `{{hostname}}`
    Hostname,

    /// `{{username}}`
    Username,

    /// `{{password}}`
    Password,

    /// `{{ssh_key}}`
    SshKey,

    /// `{{preseed_url}}`
    PreseedUrl,
}

/// A text template with `{{slot}}` placeholders, validated when parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Template {
    source: String,
    parts: Vec<Part>,
}

/// The values substituted into a [`Template`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateContext {
    /// The guest host name.
    pub hostname: String,

    /// The login user.
    pub username: String,

    /// The login password, empty when the image only uses a key.
    pub password: String,

    /// The public key authorized for the login user, empty when none is configured.
    pub ssh_key: String,

    /// The URL of the preseed document. Only known once the preseed server is up.
    pub preseed_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Text(String),
    Slot(Slot),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Slot {
    /// Every slot.
    pub const ALL: [Slot; 5] = [
        Slot::Hostname,
        Slot::Username,
        Slot::Password,
        Slot::SshKey,
        Slot::PreseedUrl,
    ];

    /// The name written between the braces.
    pub fn name(&self) -> &'static str {
        match self {
            Slot::Hostname => "hostname",
            Slot::Username => "username",
            Slot::Password => "password",
            Slot::SshKey => "ssh_key",
            Slot::PreseedUrl => "preseed_url",
        }
    }
}

impl Template {
    /// Parses a template, rejecting unknown slots and unterminated braces.
    pub fn parse(source: &str) -> VboxcoreResult<Self> {
        let mut parts = Vec::new();
        let mut rest = source;

        while let Some(open) = rest.find(SLOT_OPEN) {
            if open > 0 {
                parts.push(Part::Text(rest[..open].to_string()));
            }

            let after_open = &rest[open + SLOT_OPEN.len()..];
            let close = after_open.find(SLOT_CLOSE).ok_or_else(|| {
                VboxcoreError::Catalogue(format!(
                    "unterminated template slot near {:?}",
                    truncate(&rest[open..])
                ))
            })?;

            let name = after_open[..close].trim();
            let slot = name.parse::<Slot>()?;
            parts.push(Part::Slot(slot));

            rest = &after_open[close + SLOT_CLOSE.len()..];
        }

        if !rest.is_empty() {
            parts.push(Part::Text(rest.to_string()));
        }

        Ok(Self {
            source: source.to_string(),
            parts,
        })
    }

    /// A template with no slots. Braces are kept as written.
    pub fn verbatim(source: &str) -> Self {
        Self {
            source: source.to_string(),
            parts: vec![Part::Text(source.to_string())],
        }
    }

    /// Whether the template references `slot`.
    pub fn uses(&self, slot: Slot) -> bool {
        self.parts.iter().any(|part| *part == Part::Slot(slot))
    }

    /// The template as written.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Substitutes every slot.
    ///
    /// Fails with an invariant error when the template references `{{preseed_url}}` and the
    /// context does not carry one.
    pub fn render(&self, context: &TemplateContext) -> VboxcoreResult<String> {
        let mut rendered = String::with_capacity(self.source.len());
        for part in &self.parts {
            match part {
                Part::Text(text) => rendered.push_str(text),
                Part::Slot(Slot::Hostname) => rendered.push_str(&context.hostname),
                Part::Slot(Slot::Username) => rendered.push_str(&context.username),
                Part::Slot(Slot::Password) => rendered.push_str(&context.password),
                Part::Slot(Slot::SshKey) => rendered.push_str(&context.ssh_key),
                Part::Slot(Slot::PreseedUrl) => {
                    let url = context.preseed_url.as_deref().ok_or_else(|| {
                        VboxcoreError::Invariant(
                            "template needs a preseed url but none was provided".to_string(),
                        )
                    })?;
                    rendered.push_str(url);
                }
            }
        }

        Ok(rendered)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn truncate(s: &str) -> &str {
    match s.char_indices().nth(24) {
        Some((index, _)) => &s[..index],
        None => s,
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for Slot {
    type Err = VboxcoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Slot::ALL
            .into_iter()
            .find(|slot| slot.name() == s)
            .ok_or_else(|| VboxcoreError::Catalogue(format!("unknown template slot {{{{{s}}}}}")))
    }
}

impl Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{{{}}}}}", self.name())
    }
}

impl FromStr for Template {
    type Err = VboxcoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Template {
    type Error = VboxcoreError;

    fn try_from(source: String) -> Result<Self, Self::Error> {
        Self::parse(&source)
    }
}

impl From<Template> for String {
    fn from(template: Template) -> Self {
        template.source
    }
}

impl Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
