//! Capability contracts implemented by chan extensions.
//!
//! # Responsibility
//! - Define the four capability traits a chan backend provides.
//! - Define the explicit link context handed to capability constructors.
//! - Provide the built-in default capabilities used as fallback.
//!
//! # Invariants
//! - Constructors receive their chan name and resources explicitly; there is
//!   no ambient pending-initialization state.
//! - `init()` runs exactly once, after construction and before publication.

use crate::extension::descriptor::EXTENSION_NAME_CLIENT;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Configuration option key: backend refuses to be archived by mirrors.
pub const OPTION_HIDDEN_DISALLOW_ARCHIVATION: &str = "hidden_disallow_archivation";

/// Read access to one extension package's bundled resources.
pub trait ResourceHandle: Send + Sync + Debug {
    /// Reads one resource by its declared reference.
    fn read(&self, reference: &str) -> std::io::Result<Vec<u8>>;
}

/// Resources of a package with no resource directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyResources;

impl ResourceHandle for EmptyResources {
    fn read(&self, reference: &str) -> std::io::Result<Vec<u8>> {
        Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no resources available for `{reference}`"),
        ))
    }
}

/// Directory-backed package resources.
///
/// References are relative paths; absolute paths and `..` components are
/// rejected so a package can only read its own resources.
#[derive(Debug, Clone)]
pub struct PackageResources {
    root: PathBuf,
}

impl PackageResources {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ResourceHandle for PackageResources {
    fn read(&self, reference: &str) -> std::io::Result<Vec<u8>> {
        let relative = Path::new(reference);
        let confined = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if reference.is_empty() || !confined {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("resource reference escapes package: `{reference}`"),
            ));
        }
        std::fs::read(self.root.join(relative))
    }
}

/// Context handed to every capability constructor.
#[derive(Debug, Clone)]
pub struct LinkContext {
    chan_name: String,
    resources: Arc<dyn ResourceHandle>,
}

impl LinkContext {
    pub fn new(chan_name: impl Into<String>, resources: Arc<dyn ResourceHandle>) -> Self {
        Self {
            chan_name: chan_name.into(),
            resources,
        }
    }

    pub fn chan_name(&self) -> &str {
        &self.chan_name
    }

    pub fn resources(&self) -> &Arc<dyn ResourceHandle> {
        &self.resources
    }
}

/// Capability construction or setup failure reported by extension code.
#[derive(Debug)]
pub enum LinkError {
    /// No constructor is known for the identifier.
    ClassNotFound(String),
    /// The constructor or `init()` failed.
    Failed {
        message: String,
        source: Option<Box<dyn Error + Send + Sync>>,
    },
}

impl LinkError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl Into<Box<dyn Error + Send + Sync>>,
    ) -> Self {
        Self::Failed {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

impl Display for LinkError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ClassNotFound(identifier) => write!(f, "class not found: {identifier}"),
            Self::Failed { message, .. } => write!(f, "{message}"),
        }
    }
}

impl Error for LinkError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::ClassNotFound(_) => None,
            Self::Failed { source, .. } => source
                .as_deref()
                .map(|source| source as &(dyn Error + 'static)),
        }
    }
}

/// Shared surface of every capability object.
pub trait Linked: Send + Sync {
    /// Name of the extension this object belongs to.
    fn chan_name(&self) -> &str;

    /// Finishes setup after construction.
    fn init(&mut self) -> Result<(), LinkError> {
        Ok(())
    }
}

/// Archive mirror declaration: hosts this backend serves archived content for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Archivation {
    pub hosts: Vec<String>,
}

/// Static backend configuration.
pub trait ChanConfiguration: Linked {
    fn archivation(&self) -> Option<Archivation> {
        None
    }

    /// Returns a boolean configuration option; unknown options read as `false`.
    fn option(&self, _key: &str) -> bool {
        false
    }
}

/// Backend request executor.
pub trait ChanPerformer: Linked {}

/// Backend host and URI mapping.
pub trait ChanLocator: Linked {
    fn is_chan_host(&self, host: &str) -> bool;
}

/// Backend markup conversion.
pub trait ChanMarkup: Linked {}

/// Capability slot of a chan bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityKind {
    Configuration,
    Performer,
    Locator,
    Markup,
}

impl CapabilityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Performer => "performer",
            Self::Locator => "locator",
            Self::Markup => "markup",
        }
    }
}

/// Freshly constructed capability, before `init()` and publication.
pub enum CapabilityInstance {
    Configuration(Box<dyn ChanConfiguration>),
    Performer(Box<dyn ChanPerformer>),
    Locator(Box<dyn ChanLocator>),
    Markup(Box<dyn ChanMarkup>),
}

impl CapabilityInstance {
    pub fn configuration(value: impl ChanConfiguration + 'static) -> Self {
        Self::Configuration(Box::new(value))
    }

    pub fn performer(value: impl ChanPerformer + 'static) -> Self {
        Self::Performer(Box::new(value))
    }

    pub fn locator(value: impl ChanLocator + 'static) -> Self {
        Self::Locator(Box::new(value))
    }

    pub fn markup(value: impl ChanMarkup + 'static) -> Self {
        Self::Markup(Box::new(value))
    }

    pub fn kind(&self) -> CapabilityKind {
        match self {
            Self::Configuration(_) => CapabilityKind::Configuration,
            Self::Performer(_) => CapabilityKind::Performer,
            Self::Locator(_) => CapabilityKind::Locator,
            Self::Markup(_) => CapabilityKind::Markup,
        }
    }

    pub(crate) fn init(&mut self) -> Result<(), LinkError> {
        match self {
            Self::Configuration(value) => value.init(),
            Self::Performer(value) => value.init(),
            Self::Locator(value) => value.init(),
            Self::Markup(value) => value.init(),
        }
    }

    pub(crate) fn chan_name(&self) -> &str {
        match self {
            Self::Configuration(value) => value.chan_name(),
            Self::Performer(value) => value.chan_name(),
            Self::Locator(value) => value.chan_name(),
            Self::Markup(value) => value.chan_name(),
        }
    }
}

impl Debug for CapabilityInstance {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityInstance")
            .field("kind", &self.kind())
            .field("chan_name", &self.chan_name())
            .finish()
    }
}

/// Shared handle to one published capability.
#[derive(Clone)]
pub enum Capability {
    Configuration(Arc<dyn ChanConfiguration>),
    Performer(Arc<dyn ChanPerformer>),
    Locator(Arc<dyn ChanLocator>),
    Markup(Arc<dyn ChanMarkup>),
}

impl Capability {
    pub fn kind(&self) -> CapabilityKind {
        match self {
            Self::Configuration(_) => CapabilityKind::Configuration,
            Self::Performer(_) => CapabilityKind::Performer,
            Self::Locator(_) => CapabilityKind::Locator,
            Self::Markup(_) => CapabilityKind::Markup,
        }
    }

    pub fn chan_name(&self) -> &str {
        match self {
            Self::Configuration(value) => value.chan_name(),
            Self::Performer(value) => value.chan_name(),
            Self::Locator(value) => value.chan_name(),
            Self::Markup(value) => value.chan_name(),
        }
    }
}

impl Debug for Capability {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capability")
            .field("kind", &self.kind())
            .field("chan_name", &self.chan_name())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct DefaultConfiguration;

impl Linked for DefaultConfiguration {
    fn chan_name(&self) -> &str {
        EXTENSION_NAME_CLIENT
    }
}

impl ChanConfiguration for DefaultConfiguration {}

#[derive(Debug, Default)]
pub struct DefaultPerformer;

impl Linked for DefaultPerformer {
    fn chan_name(&self) -> &str {
        EXTENSION_NAME_CLIENT
    }
}

impl ChanPerformer for DefaultPerformer {}

/// Fallback locator; claims no host.
#[derive(Debug, Default)]
pub struct DefaultLocator;

impl Linked for DefaultLocator {
    fn chan_name(&self) -> &str {
        EXTENSION_NAME_CLIENT
    }
}

impl ChanLocator for DefaultLocator {
    fn is_chan_host(&self, _host: &str) -> bool {
        false
    }
}

#[derive(Debug, Default)]
pub struct DefaultMarkup;

impl Linked for DefaultMarkup {
    fn chan_name(&self) -> &str {
        EXTENSION_NAME_CLIENT
    }
}

impl ChanMarkup for DefaultMarkup {}

#[cfg(test)]
mod tests {
    use super::{
        CapabilityInstance, CapabilityKind, ChanConfiguration, DefaultConfiguration,
        DefaultLocator, EmptyResources, LinkError, PackageResources, ResourceHandle,
        OPTION_HIDDEN_DISALLOW_ARCHIVATION,
    };
    use std::error::Error;

    #[test]
    fn package_resources_read_inside_root_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("drawable")).unwrap();
        std::fs::write(dir.path().join("drawable/icon.png"), b"png").unwrap();

        let resources = PackageResources::new(dir.path());
        assert_eq!(resources.read("drawable/icon.png").unwrap(), b"png");

        for reference in ["", "../secret", "/etc/passwd", "drawable/../../x"] {
            let err = resources.read(reference).expect_err("escape must fail");
            assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput, "{reference}");
        }
        assert_eq!(
            resources.read("drawable/missing.png").unwrap_err().kind(),
            std::io::ErrorKind::NotFound
        );
    }

    #[test]
    fn empty_resources_report_not_found() {
        let err = EmptyResources.read("icon").unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn default_capabilities_are_inert() {
        let configuration = DefaultConfiguration;
        assert!(configuration.archivation().is_none());
        assert!(!configuration.option(OPTION_HIDDEN_DISALLOW_ARCHIVATION));

        let mut instance = CapabilityInstance::locator(DefaultLocator);
        assert_eq!(instance.kind(), CapabilityKind::Locator);
        assert_eq!(instance.chan_name(), "client");
        instance.init().expect("default init succeeds");
    }

    #[test]
    fn link_error_keeps_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = LinkError::with_source("cannot open board list", io);
        assert_eq!(err.to_string(), "cannot open board list");
        assert_eq!(err.source().expect("source").to_string(), "disk gone");
        assert!(LinkError::failed("x").source().is_none());
    }
}
