//! Dynamic capability loading for trusted chan extensions.
//!
//! # Responsibility
//! - Build the isolated load context of one extension package.
//! - Construct and initialize the four capabilities through a pluggable factory.
//! - Contain every failure (errors and panics) to the extension being loaded.
//!
//! # Invariants
//! - Only supported chan descriptors are ever loaded.
//! - A bundle is published only when all four capabilities constructed and
//!   initialized successfully.
//! - Icon resolution is best-effort and never fails a load.

use crate::extension::capability::{
    Capability, CapabilityInstance, CapabilityKind, ChanConfiguration, ChanLocator, ChanMarkup,
    ChanPerformer, DefaultConfiguration, DefaultLocator, DefaultMarkup, DefaultPerformer,
    EmptyResources, LinkContext, LinkError, PackageResources, ResourceHandle,
};
use crate::extension::descriptor::{expand_class_name, ExtensionDescriptor, ExtensionKind};
use crate::logging::{describe_error, panic_message};
use log::{debug, error, info};
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Isolated load context for one extension package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadContext {
    package_name: String,
    source_dir: PathBuf,
    native_library_dir: Option<PathBuf>,
}

impl LoadContext {
    /// Builds the context of a descriptor's package. A declared native library
    /// directory that does not exist is treated as absent.
    pub fn for_descriptor(descriptor: &ExtensionDescriptor) -> Self {
        Self {
            package_name: descriptor.package.package_name.clone(),
            source_dir: descriptor.location.source_dir.clone(),
            native_library_dir: descriptor
                .location
                .native_library_dir
                .clone()
                .filter(|dir| dir.exists()),
        }
    }

    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    pub fn native_library_dir(&self) -> Option<&Path> {
        self.native_library_dir.as_deref()
    }
}

/// Constructs capability instances from stable type identifiers.
pub trait CapabilityFactory: Send + Sync {
    fn construct(
        &self,
        context: &LoadContext,
        identifier: &str,
        link: LinkContext,
    ) -> Result<CapabilityInstance, LinkError>;
}

type Constructor = Arc<dyn Fn(LinkContext) -> Result<CapabilityInstance, LinkError> + Send + Sync>;

/// In-process factory backed by registered constructors.
///
/// Lookups search the loading package's own scope first and fall back to the
/// shared host scope.
#[derive(Default)]
pub struct ConstructorTable {
    scoped: HashMap<(String, String), Constructor>,
    shared: HashMap<String, Constructor>,
}

impl ConstructorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a constructor visible only to `package_name`. Relative
    /// identifiers are expanded against the package name.
    pub fn register<F>(&mut self, package_name: &str, identifier: &str, constructor: F) -> &mut Self
    where
        F: Fn(LinkContext) -> Result<CapabilityInstance, LinkError> + Send + Sync + 'static,
    {
        let identifier = expand_class_name(identifier, package_name);
        self.scoped.insert(
            (package_name.to_string(), identifier),
            Arc::new(constructor),
        );
        self
    }

    /// Registers a constructor visible to every package.
    pub fn register_shared<F>(&mut self, identifier: &str, constructor: F) -> &mut Self
    where
        F: Fn(LinkContext) -> Result<CapabilityInstance, LinkError> + Send + Sync + 'static,
    {
        self.shared
            .insert(identifier.to_string(), Arc::new(constructor));
        self
    }

    pub fn len(&self) -> usize {
        self.scoped.len() + self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scoped.is_empty() && self.shared.is_empty()
    }
}

impl Debug for ConstructorTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConstructorTable")
            .field("scoped", &self.scoped.len())
            .field("shared", &self.shared.len())
            .finish()
    }
}

impl CapabilityFactory for ConstructorTable {
    fn construct(
        &self,
        context: &LoadContext,
        identifier: &str,
        link: LinkContext,
    ) -> Result<CapabilityInstance, LinkError> {
        let key = (context.package_name.clone(), identifier.to_string());
        let constructor = self
            .scoped
            .get(&key)
            .or_else(|| self.shared.get(identifier))
            .ok_or_else(|| LinkError::ClassNotFound(identifier.to_string()))?;
        constructor(link)
    }
}

/// The four capabilities of one loaded chan extension.
#[derive(Clone)]
pub struct CapabilityBundle {
    configuration: Arc<dyn ChanConfiguration>,
    performer: Arc<dyn ChanPerformer>,
    locator: Arc<dyn ChanLocator>,
    markup: Arc<dyn ChanMarkup>,
    icon: Option<Arc<[u8]>>,
}

impl CapabilityBundle {
    pub fn new(
        configuration: Arc<dyn ChanConfiguration>,
        performer: Arc<dyn ChanPerformer>,
        locator: Arc<dyn ChanLocator>,
        markup: Arc<dyn ChanMarkup>,
        icon: Option<Arc<[u8]>>,
    ) -> Self {
        Self {
            configuration,
            performer,
            locator,
            markup,
            icon,
        }
    }

    /// Built-in bundle backed by no extension code.
    pub fn default_bundle() -> Self {
        Self::new(
            Arc::new(DefaultConfiguration),
            Arc::new(DefaultPerformer),
            Arc::new(DefaultLocator),
            Arc::new(DefaultMarkup),
            None,
        )
    }

    pub fn chan_name(&self) -> &str {
        self.configuration.chan_name()
    }

    pub fn configuration(&self) -> &Arc<dyn ChanConfiguration> {
        &self.configuration
    }

    pub fn performer(&self) -> &Arc<dyn ChanPerformer> {
        &self.performer
    }

    pub fn locator(&self) -> &Arc<dyn ChanLocator> {
        &self.locator
    }

    pub fn markup(&self) -> &Arc<dyn ChanMarkup> {
        &self.markup
    }

    pub fn icon(&self) -> Option<&Arc<[u8]>> {
        self.icon.as_ref()
    }

    pub fn capability(&self, kind: CapabilityKind) -> Capability {
        match kind {
            CapabilityKind::Configuration => Capability::Configuration(self.configuration.clone()),
            CapabilityKind::Performer => Capability::Performer(self.performer.clone()),
            CapabilityKind::Locator => Capability::Locator(self.locator.clone()),
            CapabilityKind::Markup => Capability::Markup(self.markup.clone()),
        }
    }
}

impl Debug for CapabilityBundle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityBundle")
            .field("chan_name", &self.chan_name())
            .field("icon_bytes", &self.icon.as_ref().map(|icon| icon.len()))
            .finish()
    }
}

/// Chan extension load failures.
#[derive(Debug)]
pub enum LoadError {
    NotChanExtension(String),
    Unsupported {
        name: String,
        version: Option<i64>,
    },
    Link {
        kind: CapabilityKind,
        identifier: String,
        source: LinkError,
    },
    KindMismatch {
        identifier: String,
        expected: CapabilityKind,
        actual: CapabilityKind,
    },
    ChanNameMismatch {
        identifier: String,
        expected: String,
        actual: String,
    },
    Panicked {
        kind: CapabilityKind,
        identifier: String,
        message: String,
    },
}

impl LoadError {
    /// Stable code used in diagnostic log lines.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotChanExtension(_) => "not_chan_extension",
            Self::Unsupported { .. } => "unsupported_version",
            Self::Link {
                source: LinkError::ClassNotFound(_),
                ..
            } => "class_not_found",
            Self::Link { .. } => "link_failed",
            Self::KindMismatch { .. } => "kind_mismatch",
            Self::ChanNameMismatch { .. } => "chan_name_mismatch",
            Self::Panicked { .. } => "panicked",
        }
    }
}

impl Display for LoadError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotChanExtension(name) => write!(f, "extension is not a chan extension: {name}"),
            Self::Unsupported { name, version } => match version {
                Some(version) => write!(f, "extension {name} declares unsupported version {version}"),
                None => write!(f, "extension {name} declares no version"),
            },
            Self::Link {
                kind, identifier, ..
            } => write!(f, "cannot link {} `{identifier}`", kind.as_str()),
            Self::KindMismatch {
                identifier,
                expected,
                actual,
            } => write!(
                f,
                "`{identifier}` constructed a {} where a {} was declared",
                actual.as_str(),
                expected.as_str()
            ),
            Self::ChanNameMismatch {
                identifier,
                expected,
                actual,
            } => write!(
                f,
                "`{identifier}` reports chan name `{actual}` instead of `{expected}`"
            ),
            Self::Panicked {
                kind,
                identifier,
                message,
            } => write!(f, "{} `{identifier}` panicked: {message}", kind.as_str()),
        }
    }
}

impl Error for LoadError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Link { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Loads chan capability bundles through a `CapabilityFactory`.
pub struct DynamicLoader {
    factory: Arc<dyn CapabilityFactory>,
}

impl DynamicLoader {
    pub fn new(factory: Arc<dyn CapabilityFactory>) -> Self {
        Self { factory }
    }

    /// Loads one chan extension, logging and swallowing any failure.
    pub fn load(&self, descriptor: &ExtensionDescriptor) -> Option<CapabilityBundle> {
        let started_at = Instant::now();
        match self.try_load(descriptor) {
            Ok(bundle) => {
                info!(
                    "event=chan_load module=extension status=ok name={} package={} icon={} duration_ms={}",
                    descriptor.name,
                    descriptor.package_name(),
                    bundle.icon.is_some(),
                    started_at.elapsed().as_millis()
                );
                Some(bundle)
            }
            Err(err) => {
                error!(
                    "event=chan_load module=extension status=error name={} package={} duration_ms={} error_code={} error={}",
                    descriptor.name,
                    descriptor.package_name(),
                    started_at.elapsed().as_millis(),
                    err.code(),
                    describe_error(&err)
                );
                None
            }
        }
    }

    /// Loads one chan extension, returning the failure to the caller.
    pub fn try_load(&self, descriptor: &ExtensionDescriptor) -> Result<CapabilityBundle, LoadError> {
        let entry_points = match (descriptor.kind, descriptor.entry_points.as_ref()) {
            (ExtensionKind::Chan, Some(entry_points)) => entry_points,
            _ => return Err(LoadError::NotChanExtension(descriptor.name.clone())),
        };
        if !descriptor.supported {
            return Err(LoadError::Unsupported {
                name: descriptor.name.clone(),
                version: descriptor.version,
            });
        }

        let context = LoadContext::for_descriptor(descriptor);
        let resources: Arc<dyn ResourceHandle> = match &descriptor.location.resources_dir {
            Some(dir) => Arc::new(PackageResources::new(dir)),
            None => Arc::new(EmptyResources),
        };
        let link = LinkContext::new(descriptor.name.as_str(), resources.clone());

        let configuration = match self.instantiate(
            &context,
            &link,
            CapabilityKind::Configuration,
            &entry_points.configuration,
        )? {
            CapabilityInstance::Configuration(value) => Arc::from(value),
            other => {
                return Err(kind_mismatch(
                    &entry_points.configuration,
                    CapabilityKind::Configuration,
                    &other,
                ))
            }
        };
        let performer = match self.instantiate(
            &context,
            &link,
            CapabilityKind::Performer,
            &entry_points.performer,
        )? {
            CapabilityInstance::Performer(value) => Arc::from(value),
            other => {
                return Err(kind_mismatch(
                    &entry_points.performer,
                    CapabilityKind::Performer,
                    &other,
                ))
            }
        };
        let locator = match self.instantiate(
            &context,
            &link,
            CapabilityKind::Locator,
            &entry_points.locator,
        )? {
            CapabilityInstance::Locator(value) => Arc::from(value),
            other => {
                return Err(kind_mismatch(
                    &entry_points.locator,
                    CapabilityKind::Locator,
                    &other,
                ))
            }
        };
        let markup = match self.instantiate(
            &context,
            &link,
            CapabilityKind::Markup,
            &entry_points.markup,
        )? {
            CapabilityInstance::Markup(value) => Arc::from(value),
            other => {
                return Err(kind_mismatch(
                    &entry_points.markup,
                    CapabilityKind::Markup,
                    &other,
                ))
            }
        };

        let icon = descriptor
            .icon
            .as_deref()
            .and_then(|reference| load_icon(descriptor, resources.as_ref(), reference));

        Ok(CapabilityBundle::new(
            configuration,
            performer,
            locator,
            markup,
            icon,
        ))
    }

    fn instantiate(
        &self,
        context: &LoadContext,
        link: &LinkContext,
        kind: CapabilityKind,
        identifier: &str,
    ) -> Result<CapabilityInstance, LoadError> {
        let construct = || -> Result<Result<CapabilityInstance, CapabilityInstance>, LinkError> {
            let mut instance = self.factory.construct(context, identifier, link.clone())?;
            if instance.kind() != kind {
                return Ok(Err(instance));
            }
            instance.init()?;
            Ok(Ok(instance))
        };

        let instance = match catch_unwind(AssertUnwindSafe(construct)) {
            Ok(Ok(Ok(instance))) => instance,
            Ok(Ok(Err(mismatched))) => return Err(kind_mismatch(identifier, kind, &mismatched)),
            Ok(Err(source)) => {
                return Err(LoadError::Link {
                    kind,
                    identifier: identifier.to_string(),
                    source,
                })
            }
            Err(payload) => {
                return Err(LoadError::Panicked {
                    kind,
                    identifier: identifier.to_string(),
                    message: panic_message(payload.as_ref()),
                })
            }
        };

        if instance.chan_name() != link.chan_name() {
            return Err(LoadError::ChanNameMismatch {
                identifier: identifier.to_string(),
                expected: link.chan_name().to_string(),
                actual: instance.chan_name().to_string(),
            });
        }
        Ok(instance)
    }
}

impl Debug for DynamicLoader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicLoader").finish_non_exhaustive()
    }
}

fn kind_mismatch(
    identifier: &str,
    expected: CapabilityKind,
    actual: &CapabilityInstance,
) -> LoadError {
    LoadError::KindMismatch {
        identifier: identifier.to_string(),
        expected,
        actual: actual.kind(),
    }
}

fn load_icon(
    descriptor: &ExtensionDescriptor,
    resources: &dyn ResourceHandle,
    reference: &str,
) -> Option<Arc<[u8]>> {
    match resources.read(reference) {
        Ok(bytes) if !bytes.is_empty() => Some(Arc::from(bytes)),
        Ok(_) => None,
        Err(err) => {
            debug!(
                "event=chan_icon module=extension status=skipped name={} reference={} error={}",
                descriptor.name, reference, err
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CapabilityBundle, ConstructorTable, DynamicLoader, LoadContext, LoadError};
    use crate::extension::capability::{
        CapabilityInstance, CapabilityKind, ChanConfiguration, ChanLocator, ChanMarkup,
        ChanPerformer, LinkContext, LinkError, Linked,
    };
    use crate::extension::descriptor::{
        EntryPoints, ExtensionDescriptor, ExtensionKind, PackageIdentity, PackageLocation,
    };
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const PACKAGE: &str = "org.example.abcd";

    struct Part {
        chan_name: String,
        fail_init: bool,
    }

    impl Part {
        fn new(link: &LinkContext) -> Self {
            Self {
                chan_name: link.chan_name().to_string(),
                fail_init: false,
            }
        }
    }

    impl Linked for Part {
        fn chan_name(&self) -> &str {
            &self.chan_name
        }

        fn init(&mut self) -> Result<(), LinkError> {
            if self.fail_init {
                return Err(LinkError::failed("init refused"));
            }
            Ok(())
        }
    }

    impl ChanConfiguration for Part {}
    impl ChanPerformer for Part {}
    impl ChanMarkup for Part {}
    impl ChanLocator for Part {
        fn is_chan_host(&self, host: &str) -> bool {
            host == "abcd.example.org"
        }
    }

    fn descriptor(resources_dir: Option<PathBuf>, icon: Option<&str>) -> ExtensionDescriptor {
        ExtensionDescriptor {
            name: "abcd".to_string(),
            kind: ExtensionKind::Chan,
            package: PackageIdentity {
                package_name: PACKAGE.to_string(),
                version_code: 1,
                version_name: None,
            },
            location: PackageLocation {
                source_dir: PathBuf::from("/data/abcd"),
                native_library_dir: Some(PathBuf::from("/definitely/missing/native")),
                resources_dir,
            },
            version: Some(1),
            supported: true,
            icon: icon.map(str::to_string),
            update_uri: None,
            entry_points: Some(EntryPoints {
                configuration: format!("{PACKAGE}.Configuration"),
                performer: format!("{PACKAGE}.Performer"),
                locator: format!("{PACKAGE}.Locator"),
                markup: format!("{PACKAGE}.Markup"),
            }),
        }
    }

    fn full_table() -> ConstructorTable {
        let mut table = ConstructorTable::new();
        table
            .register(PACKAGE, ".Configuration", |link| {
                Ok(CapabilityInstance::configuration(Part::new(&link)))
            })
            .register(PACKAGE, ".Performer", |link| {
                Ok(CapabilityInstance::performer(Part::new(&link)))
            })
            .register(PACKAGE, ".Locator", |link| {
                Ok(CapabilityInstance::locator(Part::new(&link)))
            })
            .register(PACKAGE, ".Markup", |link| {
                Ok(CapabilityInstance::markup(Part::new(&link)))
            });
        table
    }

    #[test]
    fn loads_complete_bundle_and_icon() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("icon.png"), b"icon-bytes").unwrap();

        let loader = DynamicLoader::new(Arc::new(full_table()));
        let bundle = loader
            .load(&descriptor(Some(dir.path().to_path_buf()), Some("icon.png")))
            .expect("bundle should load");
        assert_eq!(bundle.chan_name(), "abcd");
        assert!(bundle.locator().is_chan_host("abcd.example.org"));
        assert_eq!(bundle.icon().map(|icon| &icon[..]), Some(&b"icon-bytes"[..]));
    }

    #[test]
    fn missing_icon_is_not_an_error() {
        let loader = DynamicLoader::new(Arc::new(full_table()));
        let bundle = loader
            .load(&descriptor(None, Some("icon.png")))
            .expect("bundle should load without icon");
        assert!(bundle.icon().is_none());
    }

    #[test]
    fn missing_constructor_fails_load() {
        let mut table = ConstructorTable::new();
        table.register(PACKAGE, ".Configuration", |link| {
            Ok(CapabilityInstance::configuration(Part::new(&link)))
        });
        let loader = DynamicLoader::new(Arc::new(table));
        let err = loader
            .try_load(&descriptor(None, None))
            .expect_err("performer is missing");
        assert_eq!(err.code(), "class_not_found");
        assert!(loader.load(&descriptor(None, None)).is_none());
    }

    #[test]
    fn scoped_constructors_are_invisible_to_other_packages_but_shared_ones_are_not() {
        let mut table = full_table();
        table.register_shared("org.shared.Locator", |link| {
            Ok(CapabilityInstance::locator(Part::new(&link)))
        });

        let mut other = descriptor(None, None);
        other.package.package_name = "org.example.other".to_string();
        let loader = DynamicLoader::new(Arc::new(table));
        let err = loader.try_load(&other).expect_err("scoped classes are private");
        assert_eq!(err.code(), "class_not_found");

        let mut table = full_table();
        table.register_shared("org.shared.Locator", |link| {
            Ok(CapabilityInstance::locator(Part::new(&link)))
        });
        let mut shared = descriptor(None, None);
        shared.entry_points.as_mut().unwrap().locator = "org.shared.Locator".to_string();
        let loader = DynamicLoader::new(Arc::new(table));
        assert!(loader.try_load(&shared).is_ok());
    }

    #[test]
    fn init_failure_and_panic_are_contained() {
        let mut table = full_table();
        table.register(PACKAGE, ".Markup", |link| {
            let mut part = Part::new(&link);
            part.fail_init = true;
            Ok(CapabilityInstance::markup(part))
        });
        let loader = DynamicLoader::new(Arc::new(table));
        let err = loader.try_load(&descriptor(None, None)).unwrap_err();
        assert!(matches!(
            err,
            LoadError::Link {
                kind: CapabilityKind::Markup,
                ..
            }
        ));

        let mut table = full_table();
        table.register(PACKAGE, ".Performer", |_link| -> Result<CapabilityInstance, LinkError> {
            panic!("extension bug")
        });
        let loader = DynamicLoader::new(Arc::new(table));
        match loader.try_load(&descriptor(None, None)).unwrap_err() {
            LoadError::Panicked { kind, message, .. } => {
                assert_eq!(kind, CapabilityKind::Performer);
                assert_eq!(message, "extension bug");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn wrong_kind_and_wrong_chan_name_are_rejected() {
        let mut table = full_table();
        table.register(PACKAGE, ".Locator", |link| {
            Ok(CapabilityInstance::markup(Part::new(&link)))
        });
        let loader = DynamicLoader::new(Arc::new(table));
        assert_eq!(
            loader.try_load(&descriptor(None, None)).unwrap_err().code(),
            "kind_mismatch"
        );

        let mut table = full_table();
        table.register(PACKAGE, ".Configuration", |_link| {
            Ok(CapabilityInstance::configuration(Part {
                chan_name: "impostor".to_string(),
                fail_init: false,
            }))
        });
        let loader = DynamicLoader::new(Arc::new(table));
        assert_eq!(
            loader.try_load(&descriptor(None, None)).unwrap_err().code(),
            "chan_name_mismatch"
        );
    }

    #[test]
    fn unsupported_or_library_descriptors_are_never_constructed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut table = ConstructorTable::new();
        let counter = calls.clone();
        table.register_shared(&format!("{PACKAGE}.Configuration"), move |link| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(CapabilityInstance::configuration(Part::new(&link)))
        });
        let loader = DynamicLoader::new(Arc::new(table));

        let mut unsupported = descriptor(None, None);
        unsupported.supported = false;
        unsupported.version = Some(2);
        assert_eq!(
            loader.try_load(&unsupported).unwrap_err().code(),
            "unsupported_version"
        );

        let mut library = descriptor(None, None);
        library.kind = ExtensionKind::Library;
        library.entry_points = None;
        assert_eq!(
            loader.try_load(&library).unwrap_err().code(),
            "not_chan_extension"
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn load_context_drops_missing_native_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut with_native = descriptor(None, None);
        with_native.location.native_library_dir = Some(dir.path().to_path_buf());
        assert_eq!(
            LoadContext::for_descriptor(&with_native).native_library_dir(),
            Some(dir.path())
        );
        assert!(LoadContext::for_descriptor(&descriptor(None, None))
            .native_library_dir()
            .is_none());
    }

    #[test]
    fn default_bundle_belongs_to_client() {
        let bundle = CapabilityBundle::default_bundle();
        assert_eq!(bundle.chan_name(), "client");
        assert!(!bundle.locator().is_chan_host("anything"));
        assert!(bundle.icon().is_none());
    }
}
