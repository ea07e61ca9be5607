//! Build strategy selection and execution.
//!
//! A project is built by the first mechanism that applies: a native build
//! script at the root, a makefile, or the package-manager path (npm install
//! and build per manifest, then inline source-comment commands and asset
//! generation). Everything a build creates or removes is recorded in the
//! project's build ledger through a watcher scoped to the project root, so
//! `clean` knows exactly what to delete later.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::parser;
use crate::project::{Project, SharedProject, PROJECT_FILENAME};
use crate::runner::{self, HelperRegistry};
use crate::watch::{DirWatcher, WatchKind};

const NODE_MODULES: &str = "node_modules";
const ACTION_BUILD: &str = "build";

/// The subset of `package.json` the selector cares about.
#[derive(Debug, Deserialize)]
struct PackageManifest {
    #[serde(default)]
    scripts: std::collections::HashMap<String, String>,
}

/// Builds the project in place. Idempotent and safe to call repeatedly;
/// a project with no recognized build mechanism is a successful no-op.
pub async fn build(shared: &SharedProject, helpers: &HelperRegistry) -> Result<()> {
    let snapshot = shared.snapshot();
    let dest = snapshot.dest_path();

    let mut watcher = DirWatcher::new(&dest, |_| true)?;
    let control = watcher.control();
    let ledger = {
        let shared = shared.clone();
        tokio::spawn(async move {
            while let Some(batch) = watcher.next_batch().await {
                shared.with(|project| {
                    for evt in &batch {
                        let Some(name) = project.rel(&evt.path) else {
                            continue;
                        };
                        if name == PROJECT_FILENAME {
                            continue;
                        }
                        match evt.kind {
                            WatchKind::Create => project.record_build_file(&name),
                            WatchKind::Remove => project.forget_build_file(&name),
                            _ => {}
                        }
                    }
                });
            }
        })
    };

    let result = run_strategies(shared, helpers, &snapshot, &dest).await;

    // Close flushes any buffered batch so late creations still land in
    // the ledger before it is persisted.
    control.close();
    let _ = ledger.await;
    shared.save()?;
    result
}

async fn run_strategies(
    shared: &SharedProject,
    helpers: &HelperRegistry,
    snapshot: &Project,
    dest: &Path,
) -> Result<()> {
    if let Some((program, args)) = action_command(dest, ACTION_BUILD) {
        info!(command = %program.display(), "running project build command");
        runner::run_to_completion(&program.to_string_lossy(), &args, dest).await?;
        return Ok(());
    }

    npm_phase(shared, helpers, snapshot, dest).await?;
    inline_phase(helpers, snapshot, dest).await
}

/// Locates the project-provided command for `action`: a `<action>.sh`
/// (or `.bat`) script at the root wins; otherwise a makefile drives
/// `make <action>` (`nmake` where `make` is absent). Returns `None` when
/// neither mechanism exists or no make tool is installed.
pub fn action_command(root: &Path, action: &str) -> Option<(PathBuf, Vec<String>)> {
    if !root.is_dir() {
        return None;
    }

    let ext = if cfg!(windows) { ".bat" } else { ".sh" };
    let script = root.join(format!("{action}{ext}"));
    if script.exists() {
        return Some((script, Vec::new()));
    }

    let mut makefile = root.join("Makefile");
    if !makefile.exists() {
        makefile = root.join("Makefile.win");
        if !makefile.exists() {
            return None;
        }
    }
    let make = find_in_path("make").or_else(|| find_in_path("nmake"))?;
    Some((make, vec![action.to_string()]))
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    let binary = runner::format_executable(name);
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(&binary))
        .find(|candidate| candidate.is_file())
}

async fn npm_phase(
    shared: &SharedProject,
    helpers: &HelperRegistry,
    snapshot: &Project,
    dest: &Path,
) -> Result<()> {
    let manifests = find_manifests(dest);
    if manifests.is_empty() {
        return Ok(());
    }

    for manifest in manifests {
        let dir = manifest.parent().unwrap_or(dest).to_path_buf();
        let bytes = std::fs::read(&manifest)?;

        if !snapshot.disable_npm_install {
            let should_install =
                shared.with(|project| should_install_dependencies(project, &bytes, &dir));
            if should_install {
                npm(helpers, &["install"], &dir, snapshot).await?;
            }
        }

        let parsed: PackageManifest = serde_json::from_slice(&bytes)
            .map_err(|err| Error::ToolFailure(format!("build: package.json: {err}")))?;
        if parsed.scripts.contains_key(&snapshot.npm_build_script) {
            npm(
                helpers,
                &["run", snapshot.npm_build_script.as_str()],
                &dir,
                snapshot,
            )
            .await?;
        }
    }
    Ok(())
}

// Dependency installation runs only when the manifest content changed
// since the last build or the dependency cache is absent.
fn should_install_dependencies(project: &mut Project, manifest_bytes: &[u8], dir: &Path) -> bool {
    let hash = hex_sha256(manifest_bytes);
    let mut should = false;
    if project.manifest_hash != hash {
        project.manifest_hash = hash;
        should = true;
    }
    if !dir.join(NODE_MODULES).exists() {
        should = true;
    }
    should
}

async fn npm(
    helpers: &HelperRegistry,
    args: &[&str],
    dir: &Path,
    snapshot: &Project,
) -> Result<String> {
    let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    match runner::run_helper("npm", &args, dir, helpers).await {
        Err(Error::Io(err)) if err.kind() == ErrorKind::NotFound => Err(Error::ToolFailure(
            format!("project <{}> requires nodejs to be installed", snapshot.name),
        )),
        other => other,
    }
}

/// Every `package.json` under `root`, excluding dependency-cache and VCS
/// subtrees, ordered shallowest-first.
fn find_manifests(root: &Path) -> Vec<PathBuf> {
    let mut manifests: Vec<PathBuf> = Vec::new();
    let walker = WalkBuilder::new(root)
        .standard_filters(false)
        .follow_links(false)
        .filter_entry(|entry| {
            entry
                .file_name()
                .to_str()
                .map(|name| name != NODE_MODULES && name != ".git")
                .unwrap_or(true)
        })
        .build();
    for entry in walker {
        let Ok(entry) = entry else { continue };
        if entry.file_type().map(|t| t.is_file()).unwrap_or(false)
            && entry.file_name() == "package.json"
        {
            manifests.push(entry.path().to_path_buf());
        }
    }
    manifests.sort_by_key(|path| path.components().count());
    manifests
}

async fn inline_phase(helpers: &HelperRegistry, snapshot: &Project, dest: &Path) -> Result<()> {
    let parsed = match parser::parse_dir(dest) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(err = %err, "skipping inline commands, sources not parseable");
            return Ok(());
        }
    };

    // Asset directories whose generation an inline command already covers,
    // matched by exact directory, are not generated a second time.
    let mut generated_elsewhere: HashSet<String> = HashSet::new();

    if !snapshot.disable_inline_commands {
        for command in &parsed.commands {
            if command.name == "go-bindata" {
                for asset in &parsed.asset_dirs {
                    let spread = format!("{}/...", asset.dir);
                    if asset.should_generate && command.args.iter().any(|arg| *arg == spread) {
                        generated_elsewhere.insert(asset.dir.clone());
                    }
                }
            }
            info!(command = %command.display(), "running inline command");
            runner::run_helper(&command.name, &command.args, dest, helpers)
                .await
                .map_err(|err| {
                    Error::ToolFailure(format!("command <{}> failed:\n{}", command.name, err))
                })?;
        }
    }

    let dirs_to_build: Vec<String> = parsed
        .asset_dirs
        .iter()
        .filter(|asset| asset.should_generate && !generated_elsewhere.contains(&asset.dir))
        .map(|asset| format!("{}/...", asset.dir))
        .collect();
    if !dirs_to_build.is_empty() {
        let mut args = vec!["-o".to_string(), "bindata.go".to_string()];
        args.extend(dirs_to_build);
        runner::run_helper("go-bindata", &args, dest, helpers).await?;
    }
    Ok(())
}

fn hex_sha256(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_at(dir: &Path) -> SharedProject {
        SharedProject::new(Project {
            name: "starter".to_string(),
            dest: dir.to_string_lossy().replace('\\', "/"),
            ..Project::default()
        })
    }

    #[test]
    fn build_script_takes_precedence_over_makefile() {
        let dir = tempfile::tempdir().unwrap();
        let script = if cfg!(windows) { "build.bat" } else { "build.sh" };
        std::fs::write(dir.path().join(script), "#!/bin/sh\n").unwrap();
        std::fs::write(dir.path().join("Makefile"), "build:\n\ttrue\n").unwrap();

        let (program, args) = action_command(dir.path(), ACTION_BUILD).unwrap();
        assert_eq!(program, dir.path().join(script));
        assert!(args.is_empty());
    }

    #[test]
    fn makefile_is_used_when_no_script_exists() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Makefile"), "build:\n\ttrue\n").unwrap();

        match action_command(dir.path(), ACTION_BUILD) {
            // make may legitimately be absent from the test environment.
            Some((_, args)) => assert_eq!(args, vec!["build".to_string()]),
            None => assert!(find_in_path("make").is_none() && find_in_path("nmake").is_none()),
        }
    }

    #[test]
    fn no_mechanism_selects_nothing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(action_command(dir.path(), ACTION_BUILD).is_none());
    }

    #[test]
    fn manifest_discovery_skips_dependency_caches() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("app")).unwrap();
        std::fs::create_dir_all(dir.path().join("app/node_modules/pkg")).unwrap();
        std::fs::write(dir.path().join("app/package.json"), "{}").unwrap();
        std::fs::write(dir.path().join("app/node_modules/pkg/package.json"), "{}").unwrap();

        let manifests = find_manifests(dir.path());
        assert_eq!(manifests, vec![dir.path().join("app/package.json")]);
    }

    #[test]
    fn dependency_install_is_keyed_on_manifest_hash_and_cache_presence() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = br#"{"scripts":{"build":"webpack"}}"#;
        let mut project = Project::default();

        // First sight of the manifest: install.
        assert!(should_install_dependencies(&mut project, manifest, dir.path()));

        // Unchanged manifest and a present cache: skip.
        std::fs::create_dir_all(dir.path().join(NODE_MODULES)).unwrap();
        assert!(!should_install_dependencies(&mut project, manifest, dir.path()));

        // Changed manifest: install again.
        assert!(should_install_dependencies(
            &mut project,
            br#"{"scripts":{}}"#,
            dir.path()
        ));

        // Missing cache forces an install even with an unchanged hash.
        std::fs::remove_dir_all(dir.path().join(NODE_MODULES)).unwrap();
        assert!(should_install_dependencies(
            &mut project,
            br#"{"scripts":{}}"#,
            dir.path()
        ));
    }

    #[tokio::test]
    async fn build_with_no_recognized_mechanism_is_a_successful_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let shared = shared_at(dir.path());
        let helpers = HelperRegistry::default();

        build(&shared, &helpers).await.unwrap();
        assert!(shared.with(|p| p.build_files.is_empty()));
    }
}
