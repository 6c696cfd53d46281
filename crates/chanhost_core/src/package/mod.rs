//! Installed package index contracts.
//!
//! # Responsibility
//! - Describe one installed package as seen by extension discovery.
//! - Define the package metadata keys and feature flags extensions declare.
//! - Abstract the host package index behind `PackageIndex`.
//!
//! # Invariants
//! - Package records are untrusted input; nothing here validates them.
//! - A metadata key with an unexpected value type reads as absent.

use crate::extension::signature::Signature;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::sync::RwLock;

mod directory;

pub use directory::{DirectoryPackageIndex, PACKAGE_MANIFEST_FILE_NAME};

/// Feature flag declared by imageboard backend packages.
pub const FEATURE_CHAN_EXTENSION: &str = "chan.extension";
/// Feature flag declared by native library add-on packages.
pub const FEATURE_LIB_EXTENSION: &str = "lib.extension";

pub const META_CHAN_EXTENSION_NAME: &str = "chan.extension.name";
pub const META_CHAN_EXTENSION_VERSION: &str = "chan.extension.version";
pub const META_CHAN_EXTENSION_ICON: &str = "chan.extension.icon";
pub const META_CHAN_EXTENSION_SOURCE: &str = "chan.extension.source";
pub const META_CHAN_EXTENSION_CLASS_CONFIGURATION: &str = "chan.extension.class.configuration";
pub const META_CHAN_EXTENSION_CLASS_PERFORMER: &str = "chan.extension.class.performer";
pub const META_CHAN_EXTENSION_CLASS_LOCATOR: &str = "chan.extension.class.locator";
pub const META_CHAN_EXTENSION_CLASS_MARKUP: &str = "chan.extension.class.markup";

pub const META_LIB_EXTENSION_NAME: &str = "lib.extension.name";
pub const META_LIB_EXTENSION_SOURCE: &str = "lib.extension.source";

/// One declared metadata value.
///
/// Values of any other JSON type are kept as `Other` and read as absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Int(i64),
    Bool(bool),
    Str(String),
    Other(serde_json::Value),
}

/// Key/value metadata declared by a package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataBag(BTreeMap<String, MetaValue>);

impl MetadataBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: MetaValue) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: MetaValue) {
        self.0.insert(key.into(), value);
    }

    pub fn string(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(MetaValue::Str(value)) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn int(&self, key: &str) -> Option<i64> {
        match self.0.get(key) {
            Some(MetaValue::Int(value)) => Some(*value),
            _ => None,
        }
    }
}

/// Installed package record exposed by the host package index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPackage {
    pub package_name: String,
    pub version_code: i64,
    pub version_name: Option<String>,
    /// Declared feature flags, in declaration order.
    pub features: Vec<String>,
    pub metadata: MetadataBag,
    /// `None` when the index could not provide a signer list.
    pub signatures: Option<Vec<Signature>>,
    /// Directory holding the package code.
    pub source_dir: PathBuf,
    pub native_library_dir: Option<PathBuf>,
    pub resources_dir: Option<PathBuf>,
}

impl InstalledPackage {
    pub fn new(package_name: impl Into<String>, source_dir: impl Into<PathBuf>) -> Self {
        Self {
            package_name: package_name.into(),
            version_code: 1,
            version_name: None,
            features: Vec::new(),
            metadata: MetadataBag::new(),
            signatures: None,
            source_dir: source_dir.into(),
            native_library_dir: None,
            resources_dir: None,
        }
    }

    pub fn declares_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|value| value == feature)
    }

    /// Returns whether this package declares any extension feature flag.
    pub fn declares_extension(&self) -> bool {
        self.declares_feature(FEATURE_CHAN_EXTENSION) || self.declares_feature(FEATURE_LIB_EXTENSION)
    }
}

pub type PackageIndexResult<T> = Result<T, PackageIndexError>;

/// Package index access errors.
#[derive(Debug)]
pub enum PackageIndexError {
    Io { path: PathBuf, source: std::io::Error },
    Unavailable(String),
}

impl Display for PackageIndexError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "package index io error at `{}`: {source}", path.display())
            }
            Self::Unavailable(message) => write!(f, "package index unavailable: {message}"),
        }
    }
}

impl Error for PackageIndexError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Unavailable(_) => None,
        }
    }
}

/// Read access to installed packages.
pub trait PackageIndex: Send + Sync {
    /// Lists every installed package in index order.
    fn installed_packages(&self) -> PackageIndexResult<Vec<InstalledPackage>>;

    /// Looks up one installed package by name.
    fn package(&self, package_name: &str) -> PackageIndexResult<Option<InstalledPackage>>;
}

/// In-memory package index for embedding hosts and tests.
#[derive(Debug, Default)]
pub struct StaticPackageIndex {
    packages: RwLock<Vec<InstalledPackage>>,
}

impl StaticPackageIndex {
    pub fn new(packages: Vec<InstalledPackage>) -> Self {
        Self {
            packages: RwLock::new(packages),
        }
    }

    /// Installs or replaces a package, keeping its original index position on
    /// replacement.
    pub fn install(&self, package: InstalledPackage) {
        let mut packages = self
            .packages
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match packages
            .iter_mut()
            .find(|existing| existing.package_name == package.package_name)
        {
            Some(existing) => *existing = package,
            None => packages.push(package),
        }
    }

    /// Removes a package. Returns whether it was present.
    pub fn uninstall(&self, package_name: &str) -> bool {
        let mut packages = self
            .packages
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = packages.len();
        packages.retain(|package| package.package_name != package_name);
        packages.len() != before
    }
}

impl PackageIndex for StaticPackageIndex {
    fn installed_packages(&self) -> PackageIndexResult<Vec<InstalledPackage>> {
        Ok(self
            .packages
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone())
    }

    fn package(&self, package_name: &str) -> PackageIndexResult<Option<InstalledPackage>> {
        Ok(self
            .packages
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .find(|package| package.package_name == package_name)
            .cloned())
    }
}
