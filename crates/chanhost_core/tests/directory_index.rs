use chanhost_core::extension::descriptor::{DescriptorParser, DescriptorRejection};
use chanhost_core::package::{DirectoryPackageIndex, PackageIndex, FEATURE_CHAN_EXTENSION};
use chanhost_core::{InstallWatcher, Signature};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn write_manifest(root: &Path, dir: &str, manifest: &str) {
    let package_dir = root.join(dir);
    fs::create_dir_all(&package_dir).unwrap();
    fs::write(package_dir.join("package.json"), manifest).unwrap();
}

#[test]
fn lists_packages_in_directory_order_and_skips_malformed_ones() {
    let root = tempfile::tempdir().unwrap();
    write_manifest(
        root.path(),
        "b-chan",
        r#"{
            "package_name": "com.example.abcd",
            "version_code": 7,
            "features": ["chan.extension"],
            "metadata": {"chan.extension.name": "abcd", "chan.extension.version": 1},
            "signatures": ["0a0b"],
            "native_library_dir": "lib",
            "resources_dir": "/opt/res"
        }"#,
    );
    write_manifest(
        root.path(),
        "a-lib",
        r#"{"package_name": "com.example.webm", "features": ["lib.extension"]}"#,
    );
    write_manifest(root.path(), "c-broken", "{not json");
    write_manifest(root.path(), "d-unnamed", r#"{"package_name": "  "}"#);
    fs::create_dir_all(root.path().join("e-empty")).unwrap();
    fs::write(root.path().join("stray.json"), "{}").unwrap();

    let index = DirectoryPackageIndex::new(root.path());
    let packages = index.installed_packages().unwrap();
    let names: Vec<&str> = packages
        .iter()
        .map(|package| package.package_name.as_str())
        .collect();
    assert_eq!(names, ["com.example.webm", "com.example.abcd"]);

    let chan = &packages[1];
    assert_eq!(chan.version_code, 7);
    assert!(chan.declares_feature(FEATURE_CHAN_EXTENSION));
    assert_eq!(chan.metadata.string("chan.extension.name"), Some("abcd"));
    assert_eq!(chan.metadata.int("chan.extension.version"), Some(1));
    assert_eq!(chan.signatures, Some(vec![Signature::new(vec![0x0a, 0x0b])]));
    assert_eq!(chan.source_dir, root.path().join("b-chan"));
    assert_eq!(
        chan.native_library_dir.as_deref(),
        Some(root.path().join("b-chan").join("lib").as_path())
    );
    assert_eq!(chan.resources_dir.as_deref(), Some(Path::new("/opt/res")));

    let library = &packages[0];
    assert_eq!(library.version_code, 1);
    assert!(library.signatures.is_none());
}

#[test]
fn fractional_version_reaches_the_descriptor_parser() {
    let root = tempfile::tempdir().unwrap();
    write_manifest(
        root.path(),
        "chan",
        r#"{
            "package_name": "com.example.abcd",
            "features": ["chan.extension"],
            "metadata": {
                "chan.extension.name": "abcd",
                "chan.extension.version": 1.0,
                "chan.extension.hosts": ["abcd.org"]
            }
        }"#,
    );

    let index = DirectoryPackageIndex::new(root.path());
    let packages = index.installed_packages().unwrap();
    assert_eq!(packages.len(), 1);
    assert_eq!(packages[0].metadata.int("chan.extension.version"), None);
    assert_eq!(packages[0].metadata.string("chan.extension.hosts"), None);

    let mut parser = DescriptorParser::new();
    let rejection = parser.parse(&packages[0]).unwrap().unwrap_err();
    assert_eq!(rejection, DescriptorRejection::InvalidVersion);
}

#[test]
fn missing_root_is_an_empty_index() {
    let root = tempfile::tempdir().unwrap();
    let index = DirectoryPackageIndex::new(root.path().join("not-created"));
    assert!(index.installed_packages().unwrap().is_empty());
    assert!(index.package("com.example.abcd").unwrap().is_none());
}

#[test]
fn install_events_resolve_packages_through_the_index() {
    let root = tempfile::tempdir().unwrap();
    write_manifest(
        root.path(),
        "chan",
        r#"{"package_name": "com.example.abcd", "features": ["chan.extension"]}"#,
    );
    write_manifest(
        root.path(),
        "plain",
        r#"{"package_name": "com.example.plain", "features": []}"#,
    );
    let index = DirectoryPackageIndex::new(root.path());
    let watcher = InstallWatcher::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let subscription = watcher.subscribe(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    assert!(!watcher.on_package_event(&index, "com.example.plain"));
    assert!(!watcher.on_package_event(&index, "com.example.missing"));
    assert!(!watcher.check_new_extensions_installed());

    assert!(watcher.on_package_event(&index, "com.example.abcd"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(watcher.check_new_extensions_installed());

    drop(subscription);
    assert!(watcher.on_package_event(&index, "com.example.abcd"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
