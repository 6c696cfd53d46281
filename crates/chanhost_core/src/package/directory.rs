//! Directory-backed package index.
//!
//! # Responsibility
//! - Expose packages installed as sub-directories of one root directory.
//! - Read each package record from its `package.json` manifest.
//!
//! # Invariants
//! - Packages are listed in directory-name order.
//! - A malformed or unreadable manifest skips that package only.
//! - Relative package directories resolve against the package directory.

use super::{InstalledPackage, MetadataBag, PackageIndex, PackageIndexError, PackageIndexResult};
use crate::extension::signature::Signature;
use log::{debug, warn};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Manifest file name inside each package directory.
pub const PACKAGE_MANIFEST_FILE_NAME: &str = "package.json";

#[derive(Debug, Deserialize)]
struct PackageManifest {
    package_name: String,
    #[serde(default = "default_version_code")]
    version_code: i64,
    #[serde(default)]
    version_name: Option<String>,
    #[serde(default)]
    features: Vec<String>,
    #[serde(default)]
    metadata: MetadataBag,
    #[serde(default)]
    signatures: Option<Vec<Signature>>,
    #[serde(default)]
    native_library_dir: Option<PathBuf>,
    #[serde(default)]
    resources_dir: Option<PathBuf>,
}

fn default_version_code() -> i64 {
    1
}

/// Package index over `<root>/<package-dir>/package.json`.
#[derive(Debug, Clone)]
pub struct DirectoryPackageIndex {
    root: PathBuf,
}

impl DirectoryPackageIndex {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn package_dirs(&self) -> PackageIndexResult<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(
                    "event=package_scan module=package status=skipped reason=root_missing root={}",
                    self.root.display()
                );
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(PackageIndexError::Io {
                    path: self.root.clone(),
                    source: err,
                })
            }
        };

        let mut dirs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| PackageIndexError::Io {
                path: self.root.clone(),
                source: err,
            })?;
            let path = entry.path();
            if path.is_dir() {
                dirs.push(path);
            }
        }
        dirs.sort();
        Ok(dirs)
    }
}

impl PackageIndex for DirectoryPackageIndex {
    fn installed_packages(&self) -> PackageIndexResult<Vec<InstalledPackage>> {
        Ok(self
            .package_dirs()?
            .iter()
            .filter_map(|dir| read_package(dir))
            .collect())
    }

    fn package(&self, package_name: &str) -> PackageIndexResult<Option<InstalledPackage>> {
        Ok(self
            .installed_packages()?
            .into_iter()
            .find(|package| package.package_name == package_name))
    }
}

fn read_package(dir: &Path) -> Option<InstalledPackage> {
    let manifest_path = dir.join(PACKAGE_MANIFEST_FILE_NAME);
    let raw = match fs::read_to_string(&manifest_path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
        Err(err) => {
            warn!(
                "event=package_read module=package status=error path={} error={}",
                manifest_path.display(),
                err
            );
            return None;
        }
    };

    let manifest: PackageManifest = match serde_json::from_str(&raw) {
        Ok(manifest) => manifest,
        Err(err) => {
            warn!(
                "event=package_read module=package status=error path={} error_code=invalid_manifest error={}",
                manifest_path.display(),
                err
            );
            return None;
        }
    };

    let package_name = manifest.package_name.trim().to_string();
    if package_name.is_empty() {
        warn!(
            "event=package_read module=package status=error path={} error_code=empty_package_name",
            manifest_path.display()
        );
        return None;
    }

    Some(InstalledPackage {
        package_name,
        version_code: manifest.version_code,
        version_name: manifest.version_name,
        features: manifest.features,
        metadata: manifest.metadata,
        signatures: manifest.signatures,
        source_dir: dir.to_path_buf(),
        native_library_dir: manifest.native_library_dir.map(|path| resolve(dir, path)),
        resources_dir: manifest.resources_dir.map(|path| resolve(dir, path)),
    })
}

fn resolve(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}
