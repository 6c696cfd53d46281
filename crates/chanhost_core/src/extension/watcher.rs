//! Install event observation.
//!
//! # Responsibility
//! - Detect newly installed packages that declare an extension feature.
//! - Raise a sticky "new extensions installed" flag and notify subscribers.
//!
//! # Invariants
//! - The watcher never loads or registers extensions itself.
//! - Subscribers are held weakly; a dropped `InstallSubscription` is never
//!   called again and is pruned on the next delivery.
//! - Observers run synchronously on the delivering thread.

use crate::package::{InstalledPackage, PackageIndex};
use log::{debug, info, warn};
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

type Observer = dyn Fn() + Send + Sync;

/// Watches install events for extension packages.
#[derive(Default)]
pub struct InstallWatcher {
    new_extensions_installed: AtomicBool,
    observers: Mutex<Vec<Weak<Observer>>>,
}

/// Keeps one install observer alive. Dropping it revokes the subscription.
#[must_use = "dropping the subscription revokes it immediately"]
pub struct InstallSubscription {
    _observer: Arc<Observer>,
}

impl Debug for InstallSubscription {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallSubscription").finish_non_exhaustive()
    }
}

impl InstallWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer for extension install events.
    pub fn subscribe<F>(&self, observer: F) -> InstallSubscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let observer: Arc<Observer> = Arc::new(observer);
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&observer));
        InstallSubscription {
            _observer: observer,
        }
    }

    /// Handles an install event for a package resolved from `index`.
    ///
    /// Returns whether the package declared an extension. A package missing
    /// from the index is ignored.
    pub fn on_package_event(&self, index: &dyn PackageIndex, package_name: &str) -> bool {
        match index.package(package_name) {
            Ok(Some(package)) => self.on_package_added(&package),
            Ok(None) => {
                debug!(
                    "event=package_added module=watcher status=skipped reason=not_installed package={}",
                    package_name
                );
                false
            }
            Err(err) => {
                warn!(
                    "event=package_added module=watcher status=error package={} error={}",
                    package_name, err
                );
                false
            }
        }
    }

    /// Handles an install event for an already resolved package.
    pub fn on_package_added(&self, package: &InstalledPackage) -> bool {
        if !package.declares_extension() {
            return false;
        }

        self.new_extensions_installed.store(true, Ordering::SeqCst);
        let delivered = self.notify();
        info!(
            "event=package_added module=watcher status=ok package={} observers={}",
            package.package_name, delivered
        );
        true
    }

    /// Returns whether extensions were installed since the last call, and
    /// clears the flag.
    pub fn check_new_extensions_installed(&self) -> bool {
        self.new_extensions_installed.swap(false, Ordering::SeqCst)
    }

    /// Returns the number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|observer| observer.strong_count() > 0)
            .count()
    }

    fn notify(&self) -> usize {
        // Upgrade under the lock, call outside it so observers may subscribe.
        let live: Vec<Arc<Observer>> = {
            let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
            observers.retain(|observer| observer.strong_count() > 0);
            observers.iter().filter_map(Weak::upgrade).collect()
        };
        for observer in &live {
            observer();
        }
        live.len()
    }
}

impl Debug for InstallWatcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallWatcher")
            .field(
                "new_extensions_installed",
                &self.new_extensions_installed.load(Ordering::SeqCst),
            )
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
