use std::fs;
use std::path::PathBuf;

fn repo_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .and_then(|path| path.parent())
        .expect("crates/notebook should have a workspace root parent")
        .to_path_buf()
}

fn crate_dirs() -> Vec<PathBuf> {
    let crates_dir = repo_root().join("crates");
    let mut dirs = Vec::new();
    for entry in fs::read_dir(&crates_dir).expect("read crates directory") {
        let path = entry.expect("read crate entry").path();
        if path.is_dir() && path.join("Cargo.toml").exists() {
            dirs.push(path);
        }
    }
    dirs.sort();
    dirs
}

#[test]
fn workspace_manifest_lists_every_crate() {
    let workspace_manifest =
        fs::read_to_string(repo_root().join("Cargo.toml")).expect("read workspace Cargo.toml");

    for path in crate_dirs() {
        let crate_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .expect("crate directory name must be valid UTF-8");
        let expected_member = format!("\"crates/{crate_name}\"");
        assert!(
            workspace_manifest.contains(&expected_member),
            "workspace manifest is missing member {expected_member}",
        );
    }
}

#[test]
fn crate_manifests_take_versions_from_the_workspace() {
    for path in crate_dirs() {
        let manifest_path = path.join("Cargo.toml");
        let manifest = fs::read_to_string(&manifest_path)
            .unwrap_or_else(|_| panic!("read {}", manifest_path.display()));

        let mut in_dependencies = false;
        for line in manifest.lines().map(str::trim) {
            if line.starts_with('[') {
                in_dependencies = line.ends_with("dependencies]");
                continue;
            }
            if !in_dependencies || line.is_empty() {
                continue;
            }
            assert!(
                line.contains("workspace = true"),
                "{} pins a dependency outside the workspace: {line}",
                manifest_path.display(),
            );
        }
    }
}

#[test]
fn store_crate_does_not_depend_on_the_kernel_runtime() {
    let manifest_path = repo_root().join("crates/notebook-store/Cargo.toml");
    let manifest = fs::read_to_string(&manifest_path).expect("read store manifest");

    for forbidden in ["notebook-kernel", "notebook-manager", "notebook-app"] {
        assert!(
            !manifest.contains(forbidden),
            "notebook-store must not depend on {forbidden}",
        );
    }
}

fn declared_dependencies(manifest: &str, section: &str) -> Vec<String> {
    let header = format!("[{section}]");
    let mut in_section = false;
    let mut names = Vec::new();
    for line in manifest.lines().map(str::trim) {
        if line.starts_with('[') {
            in_section = line == header;
            continue;
        }
        if let (true, Some((name, _))) = (in_section, line.split_once('=')) {
            names.push(name.trim().replace('-', "_"));
        }
    }
    names
}

/// Concatenates the `.rs` files under `dir`, cut at the first test module
/// when `runtime_only` is set.
fn rust_sources(dir: &std::path::Path, runtime_only: bool) -> String {
    let mut sources = String::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return sources;
    };
    for entry in entries {
        let path = entry.expect("read source entry").path();
        if path.is_dir() {
            sources.push_str(&rust_sources(&path, runtime_only));
        } else if path.extension().is_some_and(|extension| extension == "rs") {
            let text = fs::read_to_string(&path)
                .unwrap_or_else(|_| panic!("read {}", path.display()));
            let text = match (runtime_only, text.split_once("#[cfg(test)]")) {
                (true, Some((runtime, _))) => runtime.to_owned(),
                _ => text,
            };
            sources.push_str(&text);
        }
    }
    sources
}

#[test]
fn declared_dependencies_are_used_where_they_are_declared() {
    for path in crate_dirs() {
        let manifest_path = path.join("Cargo.toml");
        let manifest = fs::read_to_string(&manifest_path)
            .unwrap_or_else(|_| panic!("read {}", manifest_path.display()));
        let runtime = rust_sources(&path.join("src"), true);
        let everything =
            rust_sources(&path.join("src"), false) + &rust_sources(&path.join("tests"), false);

        for name in declared_dependencies(&manifest, "dependencies") {
            assert!(
                runtime.contains(&name),
                "{} lists {name} as a runtime dependency but only tests use it",
                manifest_path.display(),
            );
        }
        for name in declared_dependencies(&manifest, "dev-dependencies") {
            assert!(
                everything.contains(&name),
                "{} lists unused dev-dependency {name}",
                manifest_path.display(),
            );
        }
    }
}
