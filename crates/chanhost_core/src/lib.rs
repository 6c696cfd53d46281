//! Extension discovery, trust and registry engine for chan backends.
//! This crate is the single source of truth for extension lifecycle invariants.

pub mod config;
pub mod db;
pub mod extension;
pub mod logging;
pub mod package;
pub mod registry;
pub mod store;

pub use config::{ConfigError, ManagerConfig};
pub use extension::{
    CapabilityBundle, CapabilityFactory, CapabilityKind, ConstructorTable, ExtensionDescriptor,
    ExtensionKind, InstallSubscription, InstallWatcher, LinkContext, LinkError, Signature,
    TrustState,
};
pub use logging::{default_log_level, describe_error, init_logging, logging_status};
pub use package::{DirectoryPackageIndex, InstalledPackage, PackageIndex, StaticPackageIndex};
pub use registry::{
    ExtensionInfo, ExtensionManager, LibraryHook, ManagerServices, RegistryError, RegistryResult,
};
pub use store::{OrderStore, SqliteExtensionStore, StoreError, TrustStore};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
