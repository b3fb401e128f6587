use std::{
    error::Error,
    fmt::{self, Display},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a vboxcore-related operation.
pub type VboxcoreResult<T> = Result<T, VboxcoreError>;

/// An error that occurred while provisioning or managing machines.
#[derive(pretty_error_debug::Debug, Error)]
pub enum VboxcoreError {
    /// The image catalogue is malformed or references something that does not exist.
    #[error("catalogue error: {0}")]
    Catalogue(String),

    /// The provider configuration is malformed.
    #[error("configuration error: {0}")]
    Config(String),

    /// A remote resource could not be transferred.
    #[error("network error fetching {uri}: {message}")]
    Network {
        /// The URI being fetched.
        uri: String,

        /// What went wrong.
        message: String,
    },

    /// A downloaded file did not match its expected digest.
    #[error("integrity check failed for {path}: expected sha256 {expected}, got {actual}")]
    Integrity {
        /// The file that failed verification.
        path: String,

        /// The digest declared in the catalogue.
        expected: String,

        /// The digest of the bytes actually received.
        actual: String,
    },

    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The hypervisor rejected or failed an operation.
    #[error("hypervisor error: {0}")]
    Hypervisor(String),

    /// A master install did not finish before the configured ceiling.
    #[error("install of master {image_id} did not complete within {timeout:?}")]
    InstallTimeout {
        /// The image being installed.
        image_id: String,

        /// The ceiling that was crossed.
        timeout: Duration,
    },

    /// A machine with the requested name already exists.
    #[error("a machine named {0} already exists")]
    NameCollision(String),

    /// A node never answered on ssh.
    #[error("node {name} did not respond to ssh within {timeout:?}")]
    NodeUnreachable {
        /// The node name.
        name: String,

        /// The ceiling that was crossed.
        timeout: Duration,
    },

    /// A shared resource is held with incompatible parameters.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The operation was abandoned before it finished.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// An internal invariant did not hold.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// The named node, image or profile does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An error raised while building the master of an image.
    #[error("image {image_id}: {source}")]
    Image {
        /// The image whose master build failed.
        image_id: String,

        /// The underlying failure.
        #[source]
        source: Box<VboxcoreError>,
    },

    /// An error observed by several waiters of the same operation.
    #[error(transparent)]
    Shared(Arc<VboxcoreError>),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),
}

/// The category of a [`VboxcoreError`], used for reporting and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`VboxcoreError::Catalogue`].
    Catalogue,

    /// See [`VboxcoreError::Config`].
    Config,

    /// See [`VboxcoreError::Network`].
    Network,

    /// See [`VboxcoreError::Integrity`].
    Integrity,

    /// See [`VboxcoreError::Io`].
    Io,

    /// See [`VboxcoreError::Hypervisor`].
    Hypervisor,

    /// See [`VboxcoreError::InstallTimeout`].
    InstallTimeout,

    /// See [`VboxcoreError::NameCollision`].
    NameCollision,

    /// See [`VboxcoreError::NodeUnreachable`].
    NodeUnreachable,

    /// See [`VboxcoreError::Conflict`].
    Conflict,

    /// See [`VboxcoreError::Cancelled`].
    Cancelled,

    /// See [`VboxcoreError::Invariant`].
    Invariant,

    /// See [`VboxcoreError::NotFound`].
    NotFound,

    /// Anything else.
    Other,
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VboxcoreError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> VboxcoreError {
        VboxcoreError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Creates a hypervisor error from anything printable.
    pub fn hypervisor(message: impl Display) -> VboxcoreError {
        VboxcoreError::Hypervisor(message.to_string())
    }

    /// Tags the error with the image it was raised for. Already tagged errors are left alone.
    pub fn with_image(self, image_id: impl Into<String>) -> VboxcoreError {
        match self {
            tagged @ VboxcoreError::Image { .. } => tagged,
            other => VboxcoreError::Image {
                image_id: image_id.into(),
                source: Box::new(other),
            },
        }
    }

    /// Returns the category of the error, looking through image tags and shared wrappers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            VboxcoreError::Catalogue(_) => ErrorKind::Catalogue,
            VboxcoreError::Config(_) => ErrorKind::Config,
            VboxcoreError::Network { .. } => ErrorKind::Network,
            VboxcoreError::Integrity { .. } => ErrorKind::Integrity,
            VboxcoreError::Io(_) => ErrorKind::Io,
            VboxcoreError::Hypervisor(_) => ErrorKind::Hypervisor,
            VboxcoreError::InstallTimeout { .. } => ErrorKind::InstallTimeout,
            VboxcoreError::NameCollision(_) => ErrorKind::NameCollision,
            VboxcoreError::NodeUnreachable { .. } => ErrorKind::NodeUnreachable,
            VboxcoreError::Conflict(_) => ErrorKind::Conflict,
            VboxcoreError::Cancelled(_) => ErrorKind::Cancelled,
            VboxcoreError::Invariant(_) => ErrorKind::Invariant,
            VboxcoreError::NotFound(_) => ErrorKind::NotFound,
            VboxcoreError::Image { source, .. } => source.kind(),
            VboxcoreError::Shared(inner) => inner.kind(),
            VboxcoreError::Custom(_) => ErrorKind::Other,
        }
    }

    /// Returns the image the error was raised for, if any.
    pub fn image_id(&self) -> Option<&str> {
        match self {
            VboxcoreError::Image { image_id, .. } => Some(image_id),
            VboxcoreError::InstallTimeout { image_id, .. } => Some(image_id),
            VboxcoreError::Shared(inner) => inner.image_id(),
            _ => None,
        }
    }

    /// The process exit code for the error: 2 for user errors, 3 for environment errors,
    /// 4 for timeouts and 1 for anything else.
    pub fn exit_code(&self) -> u8 {
        self.kind().exit_code()
    }

    /// Renders the error as `<kind>: <message>`.
    pub fn report(&self) -> String {
        format!("{}: {self}", self.kind())
    }
}

impl ErrorKind {
    /// The stable tag printed next to user-visible errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Catalogue => "CATALOGUE",
            ErrorKind::Config => "CONFIG",
            ErrorKind::Network => "NETWORK",
            ErrorKind::Integrity => "INTEGRITY",
            ErrorKind::Io => "IO",
            ErrorKind::Hypervisor => "HYPERVISOR",
            ErrorKind::InstallTimeout => "INSTALL_TIMEOUT",
            ErrorKind::NameCollision => "NAME_COLLISION",
            ErrorKind::NodeUnreachable => "NODE_UNREACHABLE",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Invariant => "INVARIANT",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Other => "OTHER",
        }
    }

    /// See [`VboxcoreError::exit_code`].
    pub fn exit_code(&self) -> u8 {
        match self {
            ErrorKind::Catalogue
            | ErrorKind::Config
            | ErrorKind::NameCollision
            | ErrorKind::NotFound
            | ErrorKind::Conflict => 2,
            ErrorKind::Hypervisor
            | ErrorKind::Network
            | ErrorKind::Integrity
            | ErrorKind::Io => 3,
            ErrorKind::InstallTimeout | ErrorKind::NodeUnreachable => 4,
            ErrorKind::Cancelled | ErrorKind::Invariant | ErrorKind::Other => 1,
        }
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `VboxcoreResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> VboxcoreResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_looks_through_wrappers() {
        let error = VboxcoreError::Integrity {
            path: "/tmp/ubuntu.iso".into(),
            expected: "aa".into(),
            actual: "bb".into(),
        }
        .with_image("ubuntu-22-amd64");

        assert_eq!(error.kind(), ErrorKind::Integrity);
        assert_eq!(error.image_id(), Some("ubuntu-22-amd64"));

        let shared = VboxcoreError::Shared(Arc::new(error));
        assert_eq!(shared.kind(), ErrorKind::Integrity);
        assert_eq!(shared.image_id(), Some("ubuntu-22-amd64"));
    }

    #[test]
    fn test_with_image_does_not_double_tag() {
        let error = VboxcoreError::hypervisor("boom")
            .with_image("first")
            .with_image("second");

        assert_eq!(error.image_id(), Some("first"));
        assert_eq!(error.to_string(), "image first: hypervisor error: boom");
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(VboxcoreError::NameCollision("n1".into()).exit_code(), 2);
        assert_eq!(VboxcoreError::NotFound("n1".into()).exit_code(), 2);
        assert_eq!(VboxcoreError::hypervisor("unreachable").exit_code(), 3);
        assert_eq!(
            VboxcoreError::NodeUnreachable {
                name: "n1".into(),
                timeout: Duration::from_secs(10),
            }
            .exit_code(),
            4
        );
        assert_eq!(VboxcoreError::Invariant("no handle".into()).exit_code(), 1);
    }

    #[test]
    fn test_report_leads_with_kind() {
        let error = VboxcoreError::NotFound("node n1".into());
        assert_eq!(error.report(), "NOT_FOUND: not found: node n1");
    }
}
