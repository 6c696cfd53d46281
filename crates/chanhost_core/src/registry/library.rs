//! Library extension load hook.

use crate::extension::descriptor::ExtensionDescriptor;
use log::info;

/// Loads the native payload of a trusted library extension.
pub trait LibraryHook: Send + Sync {
    fn load_library(&self, descriptor: &ExtensionDescriptor);
}

/// Hook that only records load requests in the diagnostic log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingLibraryHook;

impl LibraryHook for LoggingLibraryHook {
    fn load_library(&self, descriptor: &ExtensionDescriptor) {
        info!(
            "event=library_load module=registry status=skipped reason=no_native_loader name={} package={}",
            descriptor.name,
            descriptor.package_name()
        );
    }
}
