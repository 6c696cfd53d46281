#![allow(dead_code)]

use chanhost_core::extension::capability::{
    Archivation, CapabilityInstance, ChanConfiguration, ChanLocator, ChanMarkup, ChanPerformer,
    LinkContext, LinkError, Linked, OPTION_HIDDEN_DISALLOW_ARCHIVATION,
};
use chanhost_core::package::{
    MetaValue, MetadataBag, FEATURE_CHAN_EXTENSION, FEATURE_LIB_EXTENSION,
    META_CHAN_EXTENSION_CLASS_CONFIGURATION, META_CHAN_EXTENSION_CLASS_LOCATOR,
    META_CHAN_EXTENSION_CLASS_MARKUP, META_CHAN_EXTENSION_CLASS_PERFORMER,
    META_CHAN_EXTENSION_ICON, META_CHAN_EXTENSION_NAME, META_CHAN_EXTENSION_VERSION,
    META_LIB_EXTENSION_NAME,
};
use chanhost_core::registry::LibraryHook;
use chanhost_core::{
    ConstructorTable, ExtensionDescriptor, ExtensionManager, InstalledPackage, ManagerServices,
    Signature, SqliteExtensionStore, StaticPackageIndex,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

pub fn host_signature() -> Signature {
    Signature::new(b"host-release-key".to_vec())
}

pub fn foreign_signature() -> Signature {
    Signature::new(b"third-party-key".to_vec())
}

/// Chan package declaring relative entry points `.Configuration` etc.
pub fn chan_package(package_name: &str, chan_name: &str) -> InstalledPackage {
    let mut package = InstalledPackage::new(package_name, format!("/data/app/{package_name}"));
    package.features = vec![FEATURE_CHAN_EXTENSION.to_string()];
    package.metadata = MetadataBag::new()
        .with(META_CHAN_EXTENSION_NAME, MetaValue::Str(chan_name.to_string()))
        .with(META_CHAN_EXTENSION_VERSION, MetaValue::Int(1))
        .with(
            META_CHAN_EXTENSION_CLASS_CONFIGURATION,
            MetaValue::Str(".Configuration".to_string()),
        )
        .with(
            META_CHAN_EXTENSION_CLASS_PERFORMER,
            MetaValue::Str(".Performer".to_string()),
        )
        .with(
            META_CHAN_EXTENSION_CLASS_LOCATOR,
            MetaValue::Str(".Locator".to_string()),
        )
        .with(
            META_CHAN_EXTENSION_CLASS_MARKUP,
            MetaValue::Str(".Markup".to_string()),
        );
    package.signatures = Some(vec![foreign_signature()]);
    package
}

pub fn with_icon(mut package: InstalledPackage, resources_dir: &std::path::Path, icon: &str) -> InstalledPackage {
    package
        .metadata
        .insert(META_CHAN_EXTENSION_ICON, MetaValue::Str(icon.to_string()));
    package.resources_dir = Some(resources_dir.to_path_buf());
    package
}

pub fn library_package(package_name: &str, library_name: &str) -> InstalledPackage {
    let mut package = InstalledPackage::new(package_name, format!("/data/app/{package_name}"));
    package.features = vec![FEATURE_LIB_EXTENSION.to_string()];
    package.metadata = MetadataBag::new().with(
        META_LIB_EXTENSION_NAME,
        MetaValue::Str(library_name.to_string()),
    );
    package.signatures = Some(vec![foreign_signature()]);
    package
}

pub fn signed(mut package: InstalledPackage) -> InstalledPackage {
    package.signatures = Some(vec![host_signature()]);
    package
}

/// Blocks a configuration `init()` until the test releases it.
#[derive(Debug, Clone)]
pub struct InitGate {
    entered: Sender<()>,
    release: Arc<Mutex<Receiver<()>>>,
}

/// Test side of an `InitGate`.
pub struct InitGateControl {
    entered: Receiver<()>,
    release: Sender<()>,
}

pub fn init_gate() -> (InitGate, InitGateControl) {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let gate = InitGate {
        entered: entered_tx,
        release: Arc::new(Mutex::new(release_rx)),
    };
    let control = InitGateControl {
        entered: entered_rx,
        release: release_tx,
    };
    (gate, control)
}

impl InitGate {
    fn pass(&self) {
        self.entered.send(()).unwrap();
        self.release.lock().unwrap().recv().unwrap();
    }
}

impl InitGateControl {
    /// Waits until `init()` is blocked on the gate.
    pub fn wait_entered(&self) {
        self.entered
            .recv_timeout(std::time::Duration::from_secs(10))
            .unwrap();
    }

    pub fn release(&self) {
        self.release.send(()).unwrap();
    }
}

/// Behavior of the fake capabilities registered for one chan.
#[derive(Debug, Clone, Default)]
pub struct ChanSpec {
    pub hosts: Vec<String>,
    pub archive_hosts: Vec<String>,
    pub disallow_archivation: bool,
    pub fail_init: bool,
    pub panic_init: bool,
    /// Holds configuration `init()` until the gate is released.
    pub init_gate: Option<InitGate>,
    /// Counts configuration constructions.
    pub constructions: Arc<AtomicUsize>,
}

impl ChanSpec {
    pub fn hosts(hosts: &[&str]) -> Self {
        Self {
            hosts: hosts.iter().map(|host| host.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn gated(mut self, gate: InitGate) -> Self {
        self.init_gate = Some(gate);
        self
    }

    pub fn mirroring(mut self, hosts: &[&str]) -> Self {
        self.archive_hosts = hosts.iter().map(|host| host.to_string()).collect();
        self
    }

    pub fn construction_count(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }
}

pub struct FakeConfiguration {
    chan_name: String,
    spec: ChanSpec,
}

impl Linked for FakeConfiguration {
    fn chan_name(&self) -> &str {
        &self.chan_name
    }

    fn init(&mut self) -> Result<(), LinkError> {
        if let Some(gate) = &self.spec.init_gate {
            gate.pass();
        }
        if self.spec.panic_init {
            panic!("configuration init exploded");
        }
        if self.spec.fail_init {
            return Err(LinkError::failed("board list unavailable"));
        }
        Ok(())
    }
}

impl ChanConfiguration for FakeConfiguration {
    fn archivation(&self) -> Option<Archivation> {
        if self.spec.archive_hosts.is_empty() {
            return None;
        }
        Some(Archivation {
            hosts: self.spec.archive_hosts.clone(),
        })
    }

    fn option(&self, key: &str) -> bool {
        key == OPTION_HIDDEN_DISALLOW_ARCHIVATION && self.spec.disallow_archivation
    }
}

pub struct FakePerformer {
    chan_name: String,
}

impl Linked for FakePerformer {
    fn chan_name(&self) -> &str {
        &self.chan_name
    }
}

impl ChanPerformer for FakePerformer {}

pub struct FakeLocator {
    chan_name: String,
    hosts: Vec<String>,
}

impl Linked for FakeLocator {
    fn chan_name(&self) -> &str {
        &self.chan_name
    }
}

impl ChanLocator for FakeLocator {
    fn is_chan_host(&self, host: &str) -> bool {
        self.hosts.iter().any(|value| value == host)
    }
}

pub struct FakeMarkup {
    chan_name: String,
}

impl Linked for FakeMarkup {
    fn chan_name(&self) -> &str {
        &self.chan_name
    }
}

impl ChanMarkup for FakeMarkup {}

/// Registers the four relative entry points of `package_name`.
pub fn register_chan(table: &mut ConstructorTable, package_name: &str, spec: &ChanSpec) {
    let configuration_spec = spec.clone();
    table.register(package_name, ".Configuration", move |link: LinkContext| {
        configuration_spec
            .constructions
            .fetch_add(1, Ordering::SeqCst);
        Ok(CapabilityInstance::configuration(FakeConfiguration {
            chan_name: link.chan_name().to_string(),
            spec: configuration_spec.clone(),
        }))
    });
    table.register(package_name, ".Performer", |link: LinkContext| {
        Ok(CapabilityInstance::performer(FakePerformer {
            chan_name: link.chan_name().to_string(),
        }))
    });
    let hosts = spec.hosts.clone();
    table.register(package_name, ".Locator", move |link: LinkContext| {
        Ok(CapabilityInstance::locator(FakeLocator {
            chan_name: link.chan_name().to_string(),
            hosts: hosts.clone(),
        }))
    });
    table.register(package_name, ".Markup", |link: LinkContext| {
        Ok(CapabilityInstance::markup(FakeMarkup {
            chan_name: link.chan_name().to_string(),
        }))
    });
}

/// Library hook recording every load request.
#[derive(Debug, Default)]
pub struct RecordingLibraryHook {
    loaded: Mutex<Vec<String>>,
}

impl RecordingLibraryHook {
    pub fn loaded(&self) -> Vec<String> {
        self.loaded.lock().unwrap().clone()
    }
}

impl LibraryHook for RecordingLibraryHook {
    fn load_library(&self, descriptor: &ExtensionDescriptor) {
        self.loaded.lock().unwrap().push(descriptor.name.clone());
    }
}

pub fn build_manager(
    index: &Arc<StaticPackageIndex>,
    table: ConstructorTable,
    store: &Arc<SqliteExtensionStore>,
) -> ExtensionManager {
    let services = ManagerServices::new(index.clone(), Arc::new(table), store.clone())
        .with_host_signatures([host_signature()]);
    ExtensionManager::new(services).unwrap()
}
