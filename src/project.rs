//! Project state: the persisted record of what was installed and built.
//!
//! One `.slipway.toml` per project root is the single source of truth
//! between invocations. It is loaded at the start of every lifecycle
//! operation and saved at the end; during `run` it is re-saved whenever the
//! build ledger changes.

use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::livereload::LiveReloadConfig;
use crate::runner;

/// Name of the per-project state file.
pub const PROJECT_FILENAME: &str = ".slipway.toml";

/// Extension sets and path prefixes driving change classification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WatchConfig {
    /// Extensions whose changes restart the backend process.
    pub backend_exts: Vec<String>,
    /// Extensions whose changes rebuild the frontend.
    pub frontend_exts: Vec<String>,
    /// Relative path prefixes the watcher never registers.
    pub ignore_prefixes: Vec<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        let exts = |list: &[&str]| list.iter().map(|s| s.to_string()).collect();
        Self {
            backend_exts: exts(&[".go", ".mod", ".yml", ".toml", ".tml", ".ini", ".proto"]),
            frontend_exts: exts(&[
                ".html", ".htm", ".svelte", ".js", ".ts", ".jsx", ".tsx", ".css", ".scss",
                ".less", ".json", ".proto",
            ]),
            ignore_prefixes: exts(&[".git"]),
        }
    }
}

/// The installed project and its run/watch configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Project {
    /// Short name, e.g. "starter-kit".
    pub name: String,
    /// Source repository, e.g. "example/starter-kit".
    pub repo: String,
    /// Version ref; "latest" resolves to "master" at download time.
    pub version: String,
    /// Absolute, slash-normalized destination directory.
    pub dest: String,
    /// Module path the downloaded source is rewritten to, when it differs
    /// from the archive's own.
    pub module: String,
    /// Set while `run` is active so external observers can detect it.
    pub running: bool,
    /// Skip source-comment command directives during builds.
    pub disable_inline_commands: bool,
    /// Never run `npm install`, even when the manifest changed.
    pub disable_npm_install: bool,
    /// The npm script invoked for frontend builds.
    pub npm_build_script: String,
    /// Disable watching (and, implicitly, live reload) after the first run.
    pub disable_watch: bool,
    /// Hex SHA-256 of the npm manifest at the last dependency install.
    pub manifest_hash: String,
    /// Relative paths created by install. Scopes `uninstall`.
    pub files: Vec<String>,
    /// Relative paths created by build steps. Scopes `clean`.
    pub build_files: Vec<String>,
    pub watch: WatchConfig,
    pub livereload: LiveReloadConfig,
}

impl Default for Project {
    fn default() -> Self {
        Self {
            name: String::new(),
            repo: String::new(),
            version: String::new(),
            dest: String::new(),
            module: String::new(),
            running: false,
            disable_inline_commands: false,
            disable_npm_install: false,
            npm_build_script: "build".to_string(),
            disable_watch: false,
            manifest_hash: String::new(),
            files: Vec::new(),
            build_files: Vec::new(),
            watch: WatchConfig::default(),
            livereload: LiveReloadConfig::default(),
        }
    }
}

impl Project {
    /// Normalizes configuration after loading or before saving.
    pub fn set_defaults(&mut self) {
        if self.npm_build_script.is_empty() {
            self.npm_build_script = "build".to_string();
        }
        if self.disable_watch {
            // A disabled watcher means nothing ever triggers a reload.
            self.livereload.disable = true;
        }
    }

    /// Loads the project state for the directory at (or containing) `path`.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::ProjectNotFound);
        }
        let dir = if path.is_dir() {
            path.to_path_buf()
        } else {
            path.parent()
                .map(Path::to_path_buf)
                .ok_or(Error::ProjectNotFound)?
        };
        let state_file = dir.join(PROJECT_FILENAME);
        if !state_file.exists() {
            return Err(Error::StateFileNotFound);
        }
        let raw = std::fs::read_to_string(&state_file)?;
        let mut project: Project = toml::from_str(&raw)?;
        project.set_defaults();
        Ok(project)
    }

    /// Writes the state file under the destination, truncating any
    /// previous contents.
    pub fn save(&self) -> Result<()> {
        let raw = toml::to_string_pretty(self)?;
        std::fs::write(self.state_file(), raw)?;
        Ok(())
    }

    pub fn dest_path(&self) -> PathBuf {
        PathBuf::from(&self.dest)
    }

    pub fn state_file(&self) -> PathBuf {
        self.dest_path().join(PROJECT_FILENAME)
    }

    /// Slash-normalized path of `path` relative to the destination.
    pub fn rel(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(self.dest_path()).ok()?;
        let name = rel.to_string_lossy().replace('\\', "/");
        if name.is_empty() {
            None
        } else {
            Some(name)
        }
    }

    /// Records a path created by a build step, once.
    pub fn record_build_file(&mut self, name: &str) {
        if !self.build_files.iter().any(|existing| existing == name) {
            self.build_files.push(name.to_string());
        }
    }

    /// Drops a removed path from the build ledger.
    pub fn forget_build_file(&mut self, name: &str) {
        self.build_files.retain(|existing| existing != name);
    }

    /// Deletes every build-ledger path under the destination, then clears
    /// the ledger. The ledger is re-saved even on partial failure so it
    /// stays consistent with what is actually on disk.
    pub fn clean(&mut self) -> Result<()> {
        let dest = self.dest_path();
        let mut failure = None;
        let mut remaining = Vec::new();
        for name in std::mem::take(&mut self.build_files) {
            if failure.is_some() {
                remaining.push(name);
                continue;
            }
            // An entry that does not resolve under the destination is
            // dropped without touching the filesystem.
            let Ok(path) = safe_join(&dest, &name) else {
                continue;
            };
            if let Err(err) = remove_path(&path) {
                failure = Some(err);
                remaining.push(name);
            }
        }
        self.build_files = remaining;
        self.save()?;
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Removes all project-associated files: build artifacts first, then
    /// the installed files, then incidental artifacts, and the state file
    /// last — a crash mid-uninstall leaves the state file as evidence so
    /// the operation can be re-invoked.
    pub fn uninstall(&mut self) -> Result<()> {
        self.clean()?;

        let dest = self.dest_path();
        let mut failure = None;
        let mut remaining = Vec::new();
        for name in std::mem::take(&mut self.files) {
            if failure.is_some() {
                remaining.push(name);
                continue;
            }
            let Ok(path) = safe_join(&dest, &name) else {
                continue;
            };
            if let Err(err) = remove_path(&path) {
                failure = Some(err);
                remaining.push(name);
            }
        }
        self.files = remaining;
        if let Some(err) = failure {
            self.save()?;
            return Err(err);
        }

        // go.sum can reappear after install (generated by the toolchain);
        // the compiled binary is a build side effect. Both best-effort.
        let _ = std::fs::remove_file(dest.join("go.sum"));
        let binary = runner::format_executable(&base_name(&dest));
        let _ = std::fs::remove_file(dest.join(binary));

        match std::fs::remove_file(self.state_file()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Joins `name` under `dest`, rejecting any component that would resolve
/// outside the destination.
pub fn safe_join(dest: &Path, name: &str) -> Result<PathBuf> {
    let rel = Path::new(name);
    if rel.is_absolute() {
        return Err(Error::PathSafety(rel.to_path_buf()));
    }
    let mut out = dest.to_path_buf();
    for component in rel.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return Err(Error::PathSafety(rel.to_path_buf())),
        }
    }
    Ok(out)
}

fn remove_path(path: &Path) -> Result<()> {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Shared handle over a project with all saves serialized through one lock.
#[derive(Clone)]
pub struct SharedProject {
    inner: Arc<Mutex<Project>>,
}

impl SharedProject {
    pub fn new(project: Project) -> Self {
        Self {
            inner: Arc::new(Mutex::new(project)),
        }
    }

    /// Runs `f` with exclusive access to the project.
    pub fn with<R>(&self, f: impl FnOnce(&mut Project) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn snapshot(&self) -> Project {
        self.lock().clone()
    }

    /// Saves under the lock, so concurrent writers cannot interleave.
    pub fn save(&self) -> Result<()> {
        self.lock().save()
    }

    fn lock(&self) -> MutexGuard<'_, Project> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project_at(dir: &Path) -> Project {
        Project {
            name: "starter".to_string(),
            repo: "example/starter".to_string(),
            version: "master".to_string(),
            dest: dir.to_string_lossy().replace('\\', "/"),
            module: "github.com/example/starter".to_string(),
            ..Project::default()
        }
    }

    #[test]
    fn safe_join_rejects_escaping_paths() {
        let dest = Path::new("/srv/projects/app");
        assert!(safe_join(dest, "../evil").is_err());
        assert!(safe_join(dest, "a/../../evil").is_err());
        assert!(safe_join(dest, "/etc/passwd").is_err());
        assert_eq!(
            safe_join(dest, "app/./main.go").unwrap(),
            dest.join("app/main.go")
        );
    }

    #[test]
    fn state_round_trips_through_toml() {
        let mut project = project_at(Path::new("/srv/projects/app"));
        project.files = vec!["go.mod".into(), "main.go".into(), "app/".into()];
        project.build_files = vec!["app/node_modules".into(), "bindata.go".into()];
        project.manifest_hash = "deadbeef".into();
        project.running = true;

        let raw = toml::to_string_pretty(&project).unwrap();
        let decoded: Project = toml::from_str(&raw).unwrap();
        // The running flag is persisted as-is; it is cleared by the run
        // lifecycle, not by serialization.
        assert_eq!(decoded, project);
    }

    #[test]
    fn load_distinguishes_missing_dir_from_missing_state() {
        let missing = Path::new("/definitely/not/here");
        assert!(matches!(Project::load(missing), Err(Error::ProjectNotFound)));

        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Project::load(dir.path()),
            Err(Error::StateFileNotFound)
        ));
    }

    #[test]
    fn clean_is_idempotent_and_scoped_to_the_build_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let mut project = project_at(dir.path());

        std::fs::write(dir.path().join("main.go"), "package main\n").unwrap();
        std::fs::create_dir_all(dir.path().join("app/node_modules/x")).unwrap();
        std::fs::write(dir.path().join("bindata.go"), "package main\n").unwrap();
        project.files = vec!["main.go".into()];
        project.build_files = vec!["app/node_modules".into(), "bindata.go".into()];
        project.save().unwrap();

        project.clean().unwrap();
        assert!(project.build_files.is_empty());
        assert!(!dir.path().join("app/node_modules").exists());
        assert!(!dir.path().join("bindata.go").exists());
        // Installed files are untouched by clean.
        assert!(dir.path().join("main.go").exists());

        // Second clean is a no-op with the same on-disk result.
        project.clean().unwrap();
        assert!(project.build_files.is_empty());
        assert!(dir.path().join("main.go").exists());
    }

    #[test]
    fn clean_never_touches_entries_outside_the_destination() {
        let outside = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let victim = outside.path().join("victim.txt");
        std::fs::write(&victim, "keep me").unwrap();

        let mut project = project_at(dir.path());
        project.build_files = vec!["../victim.txt".into(), "/etc/hosts".into()];
        project.clean().unwrap();
        assert!(victim.exists());
        assert!(project.build_files.is_empty());
    }

    #[test]
    fn uninstall_removes_the_state_file_last() {
        let dir = tempfile::tempdir().unwrap();
        let mut project = project_at(dir.path());

        std::fs::write(dir.path().join("main.go"), "package main\n").unwrap();
        std::fs::create_dir_all(dir.path().join("app")).unwrap();
        std::fs::write(dir.path().join("app/index.html"), "<html>").unwrap();
        project.files = vec!["main.go".into(), "app".into(), "app/index.html".into()];
        project.save().unwrap();

        project.uninstall().unwrap();
        assert!(!dir.path().join("main.go").exists());
        assert!(!dir.path().join("app").exists());
        assert!(!dir.path().join(PROJECT_FILENAME).exists());
    }
}
