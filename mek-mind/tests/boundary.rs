//! Build-graph isolation check.
//!
//! The reasoning side must not be able to name kernel types. The boundary is
//! the dependency graph itself; this test fails the build the moment anyone
//! adds a kernel edge to this crate's manifest, in any dependency table.

use std::fs;
use std::path::Path;

#[test]
fn test_no_kernel_dependency_in_any_table() {
    let manifest_path = Path::new(env!("CARGO_MANIFEST_DIR")).join("Cargo.toml");
    let manifest: toml::Value =
        toml::from_str(&fs::read_to_string(manifest_path).unwrap()).unwrap();

    for table in [
        "dependencies",
        "dev-dependencies",
        "build-dependencies",
        "target",
    ] {
        if let Some(section) = manifest.get(table) {
            let rendered = toml::to_string(section).unwrap();
            assert!(
                !rendered.contains("mek-core"),
                "mek-mind must not depend on the kernel ({table} names mek-core)"
            );
        }
    }
}

#[test]
fn test_manifest_has_no_path_dependencies() {
    // A path dependency is the easiest way to smuggle a kernel edge in
    let manifest_path = Path::new(env!("CARGO_MANIFEST_DIR")).join("Cargo.toml");
    let manifest: toml::Value =
        toml::from_str(&fs::read_to_string(manifest_path).unwrap()).unwrap();

    if let Some(deps) = manifest.get("dependencies").and_then(|d| d.as_table()) {
        for (name, spec) in deps {
            if let Some(spec) = spec.as_table() {
                assert!(
                    !spec.contains_key("path"),
                    "dependency {name} uses a path; the mind crate links only registry crates"
                );
            }
        }
    }
}
