//! Chan order reconciliation.

use indexmap::IndexSet;

/// Reconciles a requested order with the available chan set.
///
/// Requested names that are not available are dropped. Available names the
/// request does not mention are appended in their current relative order.
pub fn reconcile_order<I>(requested: I, available: &IndexSet<String>) -> IndexSet<String>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut ordered: IndexSet<String> = requested
        .into_iter()
        .filter(|name| available.contains(name.as_ref()))
        .map(|name| name.as_ref().to_string())
        .collect();
    for name in available {
        if !ordered.contains(name) {
            ordered.insert(name.clone());
        }
    }
    ordered
}
