//! Host ownership and archive mirror mapping over loaded bundles.

use crate::extension::loader::CapabilityBundle;
use indexmap::IndexMap;

/// Returns the first bundle, in registration order, whose locator claims `host`.
pub(crate) fn host_owner<'a>(
    bundles: &'a IndexMap<String, CapabilityBundle>,
    host: &str,
) -> Option<&'a str> {
    bundles
        .iter()
        .find(|(_, bundle)| bundle.locator().is_chan_host(host))
        .map(|(name, _)| name.as_str())
}

/// Maps each owning chan to the chans that declare themselves its archive
/// mirror. Mirrors are listed once per owner in registration order and a chan
/// never mirrors itself.
pub(crate) fn compute_archive_map(
    bundles: &IndexMap<String, CapabilityBundle>,
) -> IndexMap<String, Vec<String>> {
    let mut archive_map: IndexMap<String, Vec<String>> = IndexMap::new();
    for (mirror, bundle) in bundles {
        let Some(archivation) = bundle.configuration().archivation() else {
            continue;
        };
        for host in &archivation.hosts {
            let Some(owner) = host_owner(bundles, host) else {
                continue;
            };
            if owner == mirror {
                continue;
            }
            let mirrors = archive_map.entry(owner.to_string()).or_default();
            if !mirrors.contains(mirror) {
                mirrors.push(mirror.clone());
            }
        }
    }
    archive_map
}
