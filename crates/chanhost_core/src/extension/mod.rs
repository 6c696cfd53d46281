//! Extension lifecycle building blocks.
//!
//! Descriptor parsing, signer comparison, capability contracts, dynamic
//! loading and install observation. The registry in `crate::registry` wires
//! these together.

pub mod capability;
pub mod descriptor;
pub mod loader;
pub mod signature;
pub mod watcher;

pub use capability::{
    Archivation, Capability, CapabilityInstance, CapabilityKind, ChanConfiguration, ChanLocator,
    ChanMarkup, ChanPerformer, LinkContext, LinkError, Linked, ResourceHandle,
    OPTION_HIDDEN_DISALLOW_ARCHIVATION,
};
pub use descriptor::{
    DescriptorParser, DescriptorRejection, ExtensionDescriptor, ExtensionKind, TrustState,
};
pub use loader::{
    CapabilityBundle, CapabilityFactory, ConstructorTable, DynamicLoader, LoadContext, LoadError,
};
pub use signature::{signers_match, Signature, SignatureParseError};
pub use watcher::{InstallSubscription, InstallWatcher};
