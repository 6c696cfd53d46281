//! Extension registry: the long-lived owner of every extension decision.
//!
//! # Responsibility
//! - Enumerate installed packages into descriptors with resolved trust.
//! - Load trusted chan extensions and own their capability bundles.
//! - Maintain the available chan order, host ownership and archive mirrors.
//! - Apply user trust and order decisions.
//!
//! # Invariants
//! - Every available chan name has a loaded bundle and vice versa.
//! - Archive map keys and values are drawn from loaded bundles only.
//! - Derived state is published complete under the write lock.
//! - Extension code is constructed outside the state lock; publication
//!   re-validates that the same descriptor is still `Trusted`.
//! - Mutations that load extension code are serialized by one writer lock.
//!
//! # See also
//! - `crate::extension::loader` for capability construction.
//! - `crate::store` for durable trust and order decisions.

mod archive;
mod library;
mod order;

pub use library::{LibraryHook, LoggingLibraryHook};
pub use order::reconcile_order;

use crate::extension::capability::{
    Capability, CapabilityKind, ChanConfiguration, ChanLocator, ChanMarkup, ChanPerformer,
    OPTION_HIDDEN_DISALLOW_ARCHIVATION,
};
use crate::extension::descriptor::{
    DescriptorParser, ExtensionDescriptor, ExtensionKind, TrustState,
};
use crate::extension::loader::{CapabilityBundle, CapabilityFactory, DynamicLoader};
use crate::extension::signature::{signers_match, Signature};
use crate::extension::watcher::InstallWatcher;
use crate::logging::describe_error;
use crate::package::{InstalledPackage, PackageIndex, PackageIndexError};
use crate::store::{OrderStore, StoreError, TrustStore};
use indexmap::{IndexMap, IndexSet};
use log::{debug, error, info, warn};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Registry operation error.
#[derive(Debug)]
pub enum RegistryError {
    /// A chan was requested by name without fallback and is not loaded.
    UnsupportedOperation(String),
    PackageIndex(PackageIndexError),
    Store(StoreError),
}

impl Display for RegistryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedOperation(name) => write!(f, "chan extension is not loaded: {name}"),
            Self::PackageIndex(err) => write!(f, "{err}"),
            Self::Store(err) => write!(f, "{err}"),
        }
    }
}

impl Error for RegistryError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::UnsupportedOperation(_) => None,
            Self::PackageIndex(err) => Some(err),
            Self::Store(err) => Some(err),
        }
    }
}

impl From<PackageIndexError> for RegistryError {
    fn from(value: PackageIndexError) -> Self {
        Self::PackageIndex(value)
    }
}

impl From<StoreError> for RegistryError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

/// One enumerated extension with its current trust decision.
#[derive(Debug, Clone)]
pub struct ExtensionInfo {
    pub descriptor: Arc<ExtensionDescriptor>,
    pub trust: TrustState,
}

impl ExtensionInfo {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}

/// Collaborators the registry is built from.
pub struct ManagerServices {
    pub package_index: Arc<dyn PackageIndex>,
    pub factory: Arc<dyn CapabilityFactory>,
    pub trust_store: Arc<dyn TrustStore>,
    pub order_store: Arc<dyn OrderStore>,
    pub library_hook: Arc<dyn LibraryHook>,
    /// Signer set of the host application; packages signed by exactly this
    /// set are trusted automatically.
    pub host_signatures: HashSet<Signature>,
}

impl ManagerServices {
    /// Builds services over one store handling both trust and order.
    pub fn new<S>(
        package_index: Arc<dyn PackageIndex>,
        factory: Arc<dyn CapabilityFactory>,
        store: Arc<S>,
    ) -> Self
    where
        S: TrustStore + OrderStore + 'static,
    {
        Self {
            package_index,
            factory,
            trust_store: store.clone(),
            order_store: store,
            library_hook: Arc::new(LoggingLibraryHook),
            host_signatures: HashSet::new(),
        }
    }

    pub fn with_host_signatures(mut self, signatures: impl IntoIterator<Item = Signature>) -> Self {
        self.host_signatures = signatures.into_iter().collect();
        self
    }

    pub fn with_library_hook(mut self, library_hook: Arc<dyn LibraryHook>) -> Self {
        self.library_hook = library_hook;
        self
    }
}

#[derive(Default)]
struct RegistryState {
    extensions: IndexMap<String, ExtensionInfo>,
    /// Loaded bundles in registration order.
    bundles: IndexMap<String, CapabilityBundle>,
    available: IndexSet<String>,
    archive_map: IndexMap<String, Vec<String>>,
}

impl RegistryState {
    /// Rebuilds the available order and the archive map from `bundles`.
    fn rebuild_derived(&mut self, persisted_order: &[String]) {
        let loaded: IndexSet<String> = self
            .available
            .iter()
            .filter(|name| self.bundles.contains_key(*name))
            .cloned()
            .chain(self.bundles.keys().cloned())
            .collect();
        self.available = reconcile_order(persisted_order, &loaded);
        self.archive_map = archive::compute_archive_map(&self.bundles);
    }
}

/// Owner of extension discovery, trust, loading and ordering.
///
/// Created once at startup and shared through `Arc`; every query and
/// mutation is safe to call concurrently.
pub struct ExtensionManager {
    package_index: Arc<dyn PackageIndex>,
    trust_store: Arc<dyn TrustStore>,
    order_store: Arc<dyn OrderStore>,
    library_hook: Arc<dyn LibraryHook>,
    host_signatures: HashSet<Signature>,
    loader: DynamicLoader,
    default_bundle: CapabilityBundle,
    watcher: InstallWatcher,
    state: RwLock<RegistryState>,
    writer: Mutex<()>,
}

impl ExtensionManager {
    /// Builds the registry and runs the initial enumeration.
    ///
    /// # Errors
    /// - Returns `PackageIndex` when installed packages cannot be listed.
    pub fn new(services: ManagerServices) -> RegistryResult<Self> {
        let started_at = Instant::now();
        let manager = Self {
            package_index: services.package_index,
            trust_store: services.trust_store,
            order_store: services.order_store,
            library_hook: services.library_hook,
            host_signatures: services.host_signatures,
            loader: DynamicLoader::new(services.factory),
            default_bundle: CapabilityBundle::default_bundle(),
            watcher: InstallWatcher::new(),
            state: RwLock::new(RegistryState::default()),
            writer: Mutex::new(()),
        };

        if let Err(err) = manager.rescan() {
            error!(
                "event=registry_init module=registry status=error duration_ms={} error={}",
                started_at.elapsed().as_millis(),
                describe_error(&err)
            );
            return Err(err);
        }

        info!(
            "event=registry_init module=registry status=ok host_signers={} duration_ms={}",
            manager.host_signatures.len(),
            started_at.elapsed().as_millis()
        );
        Ok(manager)
    }

    /// Re-enumerates installed packages.
    ///
    /// Decisions made this session survive for packages whose identity is
    /// unchanged. Bundles of unchanged trusted chans are kept, newly trusted
    /// chans are loaded, and bundles of vanished or changed packages leave
    /// the registry.
    pub fn rescan(&self) -> RegistryResult<()> {
        let _writer = self.writer();
        let started_at = Instant::now();
        let mut extensions = self.enumerate()?;

        let mut bundles = IndexMap::new();
        {
            let state = self.read_state();
            for (name, info) in extensions.iter_mut() {
                let Some(previous) = state.extensions.get(name) else {
                    continue;
                };
                if !same_package(&previous.descriptor, &info.descriptor) {
                    continue;
                }
                if info.trust == TrustState::Untrusted {
                    info.trust = previous.trust;
                }
            }
            for (name, bundle) in &state.bundles {
                let kept = extensions.get(name).is_some_and(|info| {
                    info.trust == TrustState::Trusted
                        && state
                            .extensions
                            .get(name)
                            .is_some_and(|previous| same_package(&previous.descriptor, &info.descriptor))
                });
                if kept {
                    bundles.insert(name.clone(), bundle.clone());
                }
            }
        }

        let pending: Vec<Arc<ExtensionDescriptor>> = extensions
            .values()
            .filter(|info| {
                info.trust == TrustState::Trusted
                    && info.descriptor.is_chan()
                    && info.descriptor.supported
                    && !bundles.contains_key(info.name())
            })
            .map(|info| info.descriptor.clone())
            .collect();
        let kept = bundles.len();
        for descriptor in &pending {
            if let Some(bundle) = self.loader.load(descriptor) {
                bundles.insert(descriptor.name.clone(), bundle);
            }
        }

        let mut state = self.write_state();
        let persisted = self.persisted_order();
        let mut next = RegistryState {
            extensions,
            bundles,
            available: std::mem::take(&mut state.available),
            archive_map: IndexMap::new(),
        };
        next.rebuild_derived(&persisted);
        *state = next;

        info!(
            "event=registry_scan module=registry status=ok extensions={} kept={} loaded={} available={} duration_ms={}",
            state.extensions.len(),
            kept,
            state.bundles.len() - kept,
            state.available.len(),
            started_at.elapsed().as_millis()
        );
        Ok(())
    }

    /// Returns one capability of a loaded chan.
    ///
    /// # Errors
    /// - Returns `UnsupportedOperation` when `name` is not loaded and
    ///   `default_if_not_found` is false.
    pub fn capability(
        &self,
        kind: CapabilityKind,
        name: &str,
        default_if_not_found: bool,
    ) -> RegistryResult<Capability> {
        Ok(self.lookup(name, default_if_not_found)?.capability(kind))
    }

    pub fn configuration(
        &self,
        name: &str,
        default_if_not_found: bool,
    ) -> RegistryResult<Arc<dyn ChanConfiguration>> {
        Ok(self.lookup(name, default_if_not_found)?.configuration().clone())
    }

    pub fn performer(
        &self,
        name: &str,
        default_if_not_found: bool,
    ) -> RegistryResult<Arc<dyn ChanPerformer>> {
        Ok(self.lookup(name, default_if_not_found)?.performer().clone())
    }

    pub fn locator(
        &self,
        name: &str,
        default_if_not_found: bool,
    ) -> RegistryResult<Arc<dyn ChanLocator>> {
        Ok(self.lookup(name, default_if_not_found)?.locator().clone())
    }

    pub fn markup(
        &self,
        name: &str,
        default_if_not_found: bool,
    ) -> RegistryResult<Arc<dyn ChanMarkup>> {
        Ok(self.lookup(name, default_if_not_found)?.markup().clone())
    }

    /// Returns the loaded bundle of `name`, if any.
    pub fn bundle(&self, name: &str) -> Option<CapabilityBundle> {
        self.read_state().bundles.get(name).cloned()
    }

    /// Built-in bundle used as fallback for unknown names.
    pub fn default_bundle(&self) -> &CapabilityBundle {
        &self.default_bundle
    }

    /// Returns the icon bytes of a loaded chan.
    pub fn icon(&self, name: &str) -> Option<Arc<[u8]>> {
        self.read_state()
            .bundles
            .get(name)
            .and_then(|bundle| bundle.icon().cloned())
    }

    /// Loaded chan names in the current user order.
    pub fn available_chan_names(&self) -> Vec<String> {
        self.read_state().available.iter().cloned().collect()
    }

    /// Loaded chan names in registration order.
    pub fn all_chan_names(&self) -> Vec<String> {
        self.read_state().bundles.keys().cloned().collect()
    }

    /// First available chan in the current order.
    pub fn default_chan_name(&self) -> Option<String> {
        self.read_state().available.first().cloned()
    }

    /// Compares two chan names by their position in the available order.
    ///
    /// Names that are not available sort as position -1, before every
    /// available name.
    pub fn compare_order(&self, lhs: &str, rhs: &str) -> Ordering {
        let state = self.read_state();
        let position = |name: &str| {
            state
                .available
                .get_index_of(name)
                .map_or(-1, |index| index as i64)
        };
        position(lhs).cmp(&position(rhs))
    }

    /// Persists a user-defined chan order and applies the reconciled result.
    ///
    /// # Errors
    /// - Returns `Store` when the order cannot be persisted; the current
    ///   order is left unchanged.
    pub fn set_order<I>(&self, names: I) -> RegistryResult<Vec<String>>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut state = self.write_state();
        let reconciled = reconcile_order(names, &state.available);
        let ordered: Vec<String> = reconciled.iter().cloned().collect();

        match self.order_store.set_chan_order(&ordered) {
            Ok(()) => {
                state.available = reconciled;
                info!(
                    "event=chan_order module=registry status=ok available={}",
                    ordered.len()
                );
                Ok(ordered)
            }
            Err(err) => {
                error!(
                    "event=chan_order module=registry status=error error_code=store_write_failed error={}",
                    describe_error(&err)
                );
                Err(RegistryError::Store(err))
            }
        }
    }

    /// Returns the first loaded chan, in registration order, claiming `host`.
    pub fn host_owner(&self, host: &str) -> Option<String> {
        let state = self.read_state();
        archive::host_owner(&state.bundles, host).map(str::to_string)
    }

    /// Returns whether content of `name` may be archived.
    pub fn can_archive(&self, name: &str) -> bool {
        if self.read_state().archive_map.contains_key(name) {
            return true;
        }
        !self
            .bundle_or_default(name)
            .configuration()
            .option(OPTION_HIDDEN_DISALLOW_ARCHIVATION)
    }

    /// Owner chan name to the chans mirroring its hosts.
    pub fn archive_map(&self) -> IndexMap<String, Vec<String>> {
        self.read_state().archive_map.clone()
    }

    pub fn recompute_archive_map(&self) {
        let mut state = self.write_state();
        state.archive_map = archive::compute_archive_map(&state.bundles);
        debug!(
            "event=archive_map module=registry status=ok owners={}",
            state.archive_map.len()
        );
    }

    /// Resolves an `Untrusted` extension.
    ///
    /// Trusting a library runs the library hook; trusting a supported chan
    /// loads and publishes it. Trust is persisted after loading. Discarding
    /// is kept in memory only. Unknown or already resolved extensions are
    /// left untouched.
    ///
    /// # Errors
    /// - Returns `Store` when the trust decision cannot be persisted; the
    ///   decision still holds for this session.
    pub fn set_extension_trust(&self, name: &str, trusted: bool) -> RegistryResult<()> {
        let _writer = self.writer();
        let descriptor = {
            let mut state = self.write_state();
            let Some(info) = state.extensions.get_mut(name) else {
                debug!(
                    "event=extension_trust module=registry status=skipped reason=unknown name={}",
                    name
                );
                return Ok(());
            };
            if info.trust != TrustState::Untrusted {
                debug!(
                    "event=extension_trust module=registry status=skipped reason=resolved name={} trust={}",
                    name,
                    info.trust.as_str()
                );
                return Ok(());
            }
            if !trusted {
                info.trust = TrustState::Discarded;
                info!(
                    "event=extension_trust module=registry status=ok name={} trust=discarded",
                    name
                );
                return Ok(());
            }
            info.trust = TrustState::Trusted;
            info.descriptor.clone()
        };

        match descriptor.kind {
            ExtensionKind::Library => self.library_hook.load_library(&descriptor),
            ExtensionKind::Chan if descriptor.supported => {
                if let Some(bundle) = self.loader.load(&descriptor) {
                    self.publish(&descriptor, bundle);
                }
            }
            ExtensionKind::Chan => debug!(
                "event=chan_load module=registry status=skipped reason=unsupported name={}",
                name
            ),
        }

        match self.trust_store.set_trusted(descriptor.package_name()) {
            Ok(()) => {
                info!(
                    "event=extension_trust module=registry status=ok name={} package={} trust=trusted",
                    name,
                    descriptor.package_name()
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    "event=extension_trust module=registry status=error name={} package={} error_code=store_write_failed error={}",
                    name,
                    descriptor.package_name(),
                    describe_error(&err)
                );
                Err(RegistryError::Store(err))
            }
        }
    }

    /// Returns the trust state of an enumerated extension.
    pub fn trust_state(&self, name: &str) -> Option<TrustState> {
        self.read_state().extensions.get(name).map(|info| info.trust)
    }

    pub fn extension(&self, name: &str) -> Option<ExtensionInfo> {
        self.read_state().extensions.get(name).cloned()
    }

    /// All enumerated extensions in enumeration order.
    pub fn extensions(&self) -> Vec<ExtensionInfo> {
        self.filtered_extensions(|_| true)
    }

    pub fn chan_extensions(&self) -> Vec<ExtensionInfo> {
        self.filtered_extensions(|info| info.descriptor.is_chan())
    }

    pub fn library_extensions(&self) -> Vec<ExtensionInfo> {
        self.filtered_extensions(|info| info.descriptor.is_library())
    }

    /// Extensions still awaiting a user trust decision.
    pub fn untrusted_extensions(&self) -> Vec<ExtensionInfo> {
        self.filtered_extensions(|info| info.trust == TrustState::Untrusted)
    }

    pub fn library_extension(&self, name: &str) -> Option<ExtensionInfo> {
        self.read_state()
            .extensions
            .get(name)
            .filter(|info| info.descriptor.is_library())
            .cloned()
    }

    /// Returns whether `package_name` provides an enumerated extension.
    pub fn is_extension_package(&self, package_name: &str) -> bool {
        self.read_state()
            .extensions
            .values()
            .any(|info| info.descriptor.package_name() == package_name)
    }

    /// Runs the library hook for every trusted library extension.
    pub fn load_libraries(&self) {
        let libraries = self.filtered_extensions(|info| {
            info.descriptor.is_library() && info.trust == TrustState::Trusted
        });
        for library in &libraries {
            self.library_hook.load_library(&library.descriptor);
        }
    }

    pub fn install_watcher(&self) -> &InstallWatcher {
        &self.watcher
    }

    /// Forwards a package install event to the install watcher.
    ///
    /// The registry itself is not changed; call `rescan` to pick the package up.
    pub fn handle_package_added(&self, package_name: &str) -> bool {
        self.watcher
            .on_package_event(self.package_index.as_ref(), package_name)
    }

    fn enumerate(&self) -> RegistryResult<IndexMap<String, ExtensionInfo>> {
        let packages = match self.package_index.installed_packages() {
            Ok(packages) => packages,
            Err(err) => {
                error!(
                    "event=package_scan module=registry status=error error={}",
                    describe_error(&err)
                );
                return Err(err.into());
            }
        };

        let mut parser = DescriptorParser::new();
        let mut extensions = IndexMap::new();
        for package in &packages {
            match parser.parse(package) {
                None => {}
                Some(Err(rejection)) => warn!(
                    "event=descriptor_reject module=registry status=error package={} error_code={} error={}",
                    package.package_name,
                    rejection.code(),
                    rejection
                ),
                Some(Ok(descriptor)) => {
                    let trust = self.resolve_trust(package);
                    debug!(
                        "event=descriptor_parse module=registry status=ok name={} kind={} package={} supported={} trust={}",
                        descriptor.name,
                        descriptor.kind.as_str(),
                        package.package_name,
                        descriptor.supported,
                        trust.as_str()
                    );
                    extensions.insert(
                        descriptor.name.clone(),
                        ExtensionInfo {
                            descriptor: Arc::new(descriptor),
                            trust,
                        },
                    );
                }
            }
        }
        Ok(extensions)
    }

    fn resolve_trust(&self, package: &InstalledPackage) -> TrustState {
        let persisted = match self.trust_store.is_trusted(&package.package_name) {
            Ok(trusted) => trusted,
            Err(err) => {
                warn!(
                    "event=trust_read module=registry status=error package={} error={}",
                    package.package_name,
                    describe_error(&err)
                );
                false
            }
        };
        if persisted {
            return TrustState::Trusted;
        }
        if signers_match(&self.host_signatures, package.signatures.as_deref()) {
            debug!(
                "event=trust_resolve module=registry status=ok reason=signature_match package={} signers={}",
                package.package_name,
                signer_fingerprints(package)
            );
            return TrustState::Trusted;
        }
        TrustState::Untrusted
    }

    /// Inserts a loaded bundle if its descriptor is still current and trusted.
    fn publish(&self, descriptor: &Arc<ExtensionDescriptor>, bundle: CapabilityBundle) {
        let mut state = self.write_state();
        let current = state.extensions.get(&descriptor.name).is_some_and(|info| {
            Arc::ptr_eq(&info.descriptor, descriptor) && info.trust == TrustState::Trusted
        });
        if !current || state.bundles.contains_key(&descriptor.name) {
            warn!(
                "event=chan_publish module=registry status=skipped reason=stale name={}",
                descriptor.name
            );
            return;
        }

        let persisted = self.persisted_order();
        state.bundles.insert(descriptor.name.clone(), bundle);
        state.rebuild_derived(&persisted);
        info!(
            "event=chan_publish module=registry status=ok name={} available={}",
            descriptor.name,
            state.available.len()
        );
    }

    fn persisted_order(&self) -> Vec<String> {
        self.order_store.chan_order().unwrap_or_else(|err| {
            warn!(
                "event=chan_order_read module=registry status=error error={}",
                describe_error(&err)
            );
            Vec::new()
        })
    }

    fn bundle_or_default(&self, name: &str) -> CapabilityBundle {
        self.bundle(name)
            .unwrap_or_else(|| self.default_bundle.clone())
    }

    fn lookup(&self, name: &str, default_if_not_found: bool) -> RegistryResult<CapabilityBundle> {
        match self.bundle(name) {
            Some(bundle) => Ok(bundle),
            None if default_if_not_found => Ok(self.default_bundle.clone()),
            None => Err(RegistryError::UnsupportedOperation(name.to_string())),
        }
    }

    fn filtered_extensions(&self, keep: impl Fn(&ExtensionInfo) -> bool) -> Vec<ExtensionInfo> {
        self.read_state()
            .extensions
            .values()
            .filter(|&info| keep(info))
            .cloned()
            .collect()
    }

    fn read_state(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Debug for ExtensionManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.read_state();
        f.debug_struct("ExtensionManager")
            .field("extensions", &state.extensions.len())
            .field("available", &state.available)
            .field("archive_map", &state.archive_map)
            .finish()
    }
}

fn signer_fingerprints(package: &InstalledPackage) -> String {
    package
        .signatures
        .iter()
        .flatten()
        .map(Signature::fingerprint)
        .collect::<Vec<_>>()
        .join(",")
}

fn same_package(lhs: &ExtensionDescriptor, rhs: &ExtensionDescriptor) -> bool {
    lhs.kind == rhs.kind
        && lhs.package.package_name == rhs.package.package_name
        && lhs.package.version_code == rhs.package.version_code
}
