//! Extension descriptor model and declaration parsing.
//!
//! # Responsibility
//! - Turn one installed package record into an immutable extension descriptor.
//! - Enforce naming, uniqueness, version and entry-point declaration rules.
//!
//! # Invariants
//! - Accepted names match `[a-z][a-z0-9]{3,14}` and are not reserved.
//! - A name is unique within one parser pass; the first declarant wins.
//! - Chan descriptors always carry all four fully-qualified entry points.
//! - Descriptors never change after parsing; trust lives in the registry.

use crate::package::{
    InstalledPackage, FEATURE_CHAN_EXTENSION, FEATURE_LIB_EXTENSION,
    META_CHAN_EXTENSION_CLASS_CONFIGURATION, META_CHAN_EXTENSION_CLASS_LOCATOR,
    META_CHAN_EXTENSION_CLASS_MARKUP, META_CHAN_EXTENSION_CLASS_PERFORMER,
    META_CHAN_EXTENSION_ICON, META_CHAN_EXTENSION_NAME, META_CHAN_EXTENSION_SOURCE,
    META_CHAN_EXTENSION_VERSION, META_LIB_EXTENSION_NAME, META_LIB_EXTENSION_SOURCE,
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

/// Highest chan extension API version this host can load.
pub const MAX_VERSION: i64 = 1;
/// Lowest chan extension API version this host can load.
pub const MIN_VERSION: i64 = 1;

/// Name owned by the host client itself.
pub const EXTENSION_NAME_CLIENT: &str = "client";
/// Name of the built-in media decoding library.
pub const EXTENSION_NAME_LIB_WEBM: &str = "webm";
/// Names used by host preference sections.
pub const SPECIAL_EXTENSION_NAMES: &[&str] = &["general", "favorites", "history"];

static VALID_EXTENSION_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9]{3,14}$").expect("valid extension name regex"));

/// Returns whether `name` matches the extension identifier pattern.
pub fn is_valid_extension_name(name: &str) -> bool {
    VALID_EXTENSION_NAME_RE.is_match(name)
}

/// Extension category declared by feature flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtensionKind {
    /// Imageboard backend exposing the four chan capabilities.
    Chan,
    /// Native add-on library.
    Library,
}

impl ExtensionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chan => "chan",
            Self::Library => "library",
        }
    }
}

/// Trust decision attached to one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrustState {
    Untrusted,
    Trusted,
    Discarded,
}

impl TrustState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Untrusted => "untrusted",
            Self::Trusted => "trusted",
            Self::Discarded => "discarded",
        }
    }
}

/// Identity of the installed package owning an extension.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageIdentity {
    pub package_name: String,
    pub version_code: i64,
    pub version_name: Option<String>,
}

/// Code and resource locations of the owning package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageLocation {
    pub source_dir: PathBuf,
    pub native_library_dir: Option<PathBuf>,
    pub resources_dir: Option<PathBuf>,
}

/// Fully-qualified capability type identifiers of a chan extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoints {
    pub configuration: String,
    pub performer: String,
    pub locator: String,
    pub markup: String,
}

/// Immutable, validated extension declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionDescriptor {
    pub name: String,
    pub kind: ExtensionKind,
    pub package: PackageIdentity,
    pub location: PackageLocation,
    /// Declared API version. Always `Some` for chan extensions.
    pub version: Option<i64>,
    /// Whether the declared version is loadable by this host.
    pub supported: bool,
    /// Resource reference of the extension icon.
    pub icon: Option<String>,
    pub update_uri: Option<String>,
    /// Present for chan extensions only.
    pub entry_points: Option<EntryPoints>,
}

impl ExtensionDescriptor {
    pub fn is_chan(&self) -> bool {
        self.kind == ExtensionKind::Chan
    }

    pub fn is_library(&self) -> bool {
        self.kind == ExtensionKind::Library
    }

    pub fn package_name(&self) -> &str {
        self.package.package_name.as_str()
    }
}

/// Reason a package declaration was not accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorRejection {
    InvalidName(Option<String>),
    NameConflict(String),
    InvalidVersion,
    UndefinedClass(&'static str),
}

impl DescriptorRejection {
    /// Stable code used in diagnostic log lines.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidName(_) => "invalid_name",
            Self::NameConflict(_) => "name_conflict",
            Self::InvalidVersion => "invalid_version",
            Self::UndefinedClass(_) => "undefined_class",
        }
    }
}

impl Display for DescriptorRejection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidName(Some(name)) => write!(f, "invalid extension name: {name}"),
            Self::InvalidName(None) => write!(f, "invalid extension name: <missing>"),
            Self::NameConflict(name) => {
                write!(f, "extension names conflict: {name} already exists")
            }
            Self::InvalidVersion => write!(f, "invalid extension version"),
            Self::UndefinedClass(entry) => write!(f, "undefined extension class: {entry}"),
        }
    }
}

impl Error for DescriptorRejection {}

/// Parser for one enumeration pass.
///
/// Holds the set of names already claimed in this pass, so a fresh parser must
/// be used for every full enumeration.
#[derive(Debug)]
pub struct DescriptorParser {
    used_names: HashSet<String>,
    reserved_chan_names: HashSet<String>,
    reserved_names: HashSet<String>,
}

impl Default for DescriptorParser {
    fn default() -> Self {
        Self::new()
    }
}

impl DescriptorParser {
    pub fn new() -> Self {
        let reserved_names: HashSet<String> = std::iter::once(EXTENSION_NAME_CLIENT)
            .chain(SPECIAL_EXTENSION_NAMES.iter().copied())
            .map(str::to_string)
            .collect();
        let mut reserved_chan_names = reserved_names.clone();
        reserved_chan_names.insert(EXTENSION_NAME_LIB_WEBM.to_string());
        Self {
            used_names: HashSet::new(),
            reserved_chan_names,
            reserved_names,
        }
    }

    /// Parses the extension declaration of one package.
    ///
    /// Returns `None` when the package declares no extension feature. Only the
    /// first extension feature flag of a package is considered.
    pub fn parse(
        &mut self,
        package: &InstalledPackage,
    ) -> Option<Result<ExtensionDescriptor, DescriptorRejection>> {
        let kind = package.features.iter().find_map(|feature| match feature.as_str() {
            FEATURE_CHAN_EXTENSION => Some(ExtensionKind::Chan),
            FEATURE_LIB_EXTENSION => Some(ExtensionKind::Library),
            _ => None,
        })?;

        let result = self.parse_kind(package, kind);
        if let Ok(descriptor) = &result {
            self.used_names.insert(descriptor.name.clone());
        }
        Some(result)
    }

    fn parse_kind(
        &self,
        package: &InstalledPackage,
        kind: ExtensionKind,
    ) -> Result<ExtensionDescriptor, DescriptorRejection> {
        let data = &package.metadata;
        let (name_key, reserved) = match kind {
            ExtensionKind::Chan => (META_CHAN_EXTENSION_NAME, &self.reserved_chan_names),
            ExtensionKind::Library => (META_LIB_EXTENSION_NAME, &self.reserved_names),
        };
        let name = match data.string(name_key) {
            Some(name) if is_valid_extension_name(name) && !reserved.contains(name) => name,
            other => {
                return Err(DescriptorRejection::InvalidName(other.map(str::to_string)));
            }
        };
        if self.used_names.contains(name) {
            return Err(DescriptorRejection::NameConflict(name.to_string()));
        }

        let package_identity = PackageIdentity {
            package_name: package.package_name.clone(),
            version_code: package.version_code,
            version_name: package.version_name.clone(),
        };
        let location = PackageLocation {
            source_dir: package.source_dir.clone(),
            native_library_dir: package.native_library_dir.clone(),
            resources_dir: package.resources_dir.clone(),
        };

        match kind {
            ExtensionKind::Chan => {
                let version = data
                    .int(META_CHAN_EXTENSION_VERSION)
                    .ok_or(DescriptorRejection::InvalidVersion)?;
                let entry_points = EntryPoints {
                    configuration: required_class(
                        package,
                        META_CHAN_EXTENSION_CLASS_CONFIGURATION,
                        "configuration",
                    )?,
                    performer: required_class(
                        package,
                        META_CHAN_EXTENSION_CLASS_PERFORMER,
                        "performer",
                    )?,
                    locator: required_class(package, META_CHAN_EXTENSION_CLASS_LOCATOR, "locator")?,
                    markup: required_class(package, META_CHAN_EXTENSION_CLASS_MARKUP, "markup")?,
                };
                Ok(ExtensionDescriptor {
                    name: name.to_string(),
                    kind,
                    package: package_identity,
                    location,
                    version: Some(version),
                    supported: (MIN_VERSION..=MAX_VERSION).contains(&version),
                    icon: non_empty(data.string(META_CHAN_EXTENSION_ICON)),
                    update_uri: non_empty(data.string(META_CHAN_EXTENSION_SOURCE)),
                    entry_points: Some(entry_points),
                })
            }
            ExtensionKind::Library => Ok(ExtensionDescriptor {
                name: name.to_string(),
                kind,
                package: package_identity,
                location,
                version: None,
                supported: true,
                icon: None,
                update_uri: non_empty(data.string(META_LIB_EXTENSION_SOURCE)),
                entry_points: None,
            }),
        }
    }
}

fn required_class(
    package: &InstalledPackage,
    key: &str,
    entry: &'static str,
) -> Result<String, DescriptorRejection> {
    match package.metadata.string(key).map(str::trim) {
        Some(value) if !value.is_empty() && value != "." => {
            Ok(expand_class_name(value, &package.package_name))
        }
        _ => Err(DescriptorRejection::UndefinedClass(entry)),
    }
}

/// Expands a relative identifier (leading `.`) against the package namespace.
pub fn expand_class_name(class_name: &str, package_name: &str) -> String {
    if class_name.starts_with('.') {
        format!("{package_name}{class_name}")
    } else {
        class_name.to_string()
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
