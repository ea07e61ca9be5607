//! The rerun control loop.
//!
//! Consumes batched watch events, classifies them as frontend- and/or
//! backend-affecting, and serializes rebuild/restart work. A failed rerun
//! is logged and abandoned; it never takes down the running backend, the
//! watcher, or the loop itself.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::builder;
use crate::error::{Error, Result};
use crate::livereload::LiveReload;
use crate::project::{Project, SharedProject, PROJECT_FILENAME};
use crate::runner::{self, HelperRegistry};
use crate::watch::{DirWatcher, WatchControl, WatchEvent};

/// Batches larger than this are treated as "rebuild everything" without
/// per-file inspection; bulk operations like dependency installs flood
/// the watcher with events not worth classifying.
const BULK_EVENT_THRESHOLD: usize = 20;

/// Build artifacts and editor droppings that never classify.
const IGNORED_EXTS: &[&str] = &[".exe", ".exe~", ".tmp"];

const ACTION_RUN: &str = "run";

/// What a batch of changes affects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Classification {
    pub frontend: bool,
    pub backend: bool,
}

impl Classification {
    const ALL: Self = Self {
        frontend: true,
        backend: true,
    };

    pub fn any(self) -> bool {
        self.frontend || self.backend
    }
}

/// Classifies one event batch against the project's extension sets.
pub fn classify(batch: &[WatchEvent], project: &Project) -> Classification {
    if batch.len() > BULK_EVENT_THRESHOLD {
        return Classification::ALL;
    }

    let mut result = Classification::default();
    for evt in batch {
        let Some(name) = project.rel(&evt.path) else {
            continue;
        };
        if name == PROJECT_FILENAME {
            // State saves must not retrigger the loop.
            continue;
        }
        let Some(ext) = ext_of(&name) else {
            continue;
        };
        if IGNORED_EXTS.contains(&ext) {
            continue;
        }
        let backend = project.watch.backend_exts.iter().any(|e| e == ext);
        let frontend = project.watch.frontend_exts.iter().any(|e| e == ext);
        result.backend |= backend;
        result.frontend |= frontend;
        if !backend && !frontend {
            warn!(
                file = %name,
                "unexpected file changed, neither a frontend nor a backend extension"
            );
        }
    }
    result
}

fn ext_of(name: &str) -> Option<&str> {
    let idx = name.rfind('.')?;
    if idx == 0 || idx + 1 == name.len() {
        return None;
    }
    Some(&name[idx..])
}

/// The canonical supervised backend process. Exactly one is canonical at
/// a time; installing a new one kills the previous one first.
#[derive(Clone, Default)]
pub struct BackendHandle {
    child: Arc<Mutex<Option<Child>>>,
}

impl BackendHandle {
    pub async fn replace(&self, new_child: Child) {
        let mut slot = self.child.lock().await;
        if let Some(old) = slot.take() {
            runner::kill_child(old).await;
        }
        *slot = Some(new_child);
    }

    pub async fn kill(&self) {
        let mut slot = self.child.lock().await;
        if let Some(child) = slot.take() {
            runner::kill_child(child).await;
        }
    }

    /// Resolves when the canonical backend exits on its own. Restarts swap
    /// the child underneath, so this polls rather than holding a `wait`.
    pub async fn wait_natural_exit(&self) -> Result<()> {
        loop {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let mut slot = self.child.lock().await;
            if let Some(child) = slot.as_mut() {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        slot.take();
                        if status.success() {
                            return Ok(());
                        }
                        return Err(Error::ToolFailure(format!("backend exited with {status}")));
                    }
                    Ok(None) => {}
                    Err(err) => {
                        slot.take();
                        return Err(err.into());
                    }
                }
            }
        }
    }
}

/// Compiles (when needed) and starts the project backend, making it the
/// canonical process.
pub async fn start_backend(project: &Project, backend: &BackendHandle) -> Result<()> {
    let dest = project.dest_path();

    if let Some((program, args)) = builder::action_command(&dest, ACTION_RUN) {
        let child = runner::start_supervised(&program, &args, &dest)?;
        backend.replace(child).await;
        return Ok(());
    }

    let bin = runner::format_executable(&base_name(&dest));
    let build_args: Vec<String> = ["build", "-o", bin.as_str(), "."]
        .iter()
        .map(|s| s.to_string())
        .collect();
    runner::run_to_completion("go", &build_args, &dest).await?;

    let child = runner::start_executable(&dest, &bin)?;
    backend.replace(child).await;
    Ok(())
}

fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[derive(Clone)]
struct RerunContext {
    shared: SharedProject,
    control: WatchControl,
    helpers: HelperRegistry,
    backend: BackendHandle,
    livereload: LiveReload,
    rebuild_lock: Arc<Mutex<()>>,
}

async fn consume_batches(mut watcher: DirWatcher, ctx: RerunContext) {
    while let Some(batch) = watcher.next_batch().await {
        let classification = ctx.shared.with(|project| classify(&batch, project));
        if !classification.any() {
            continue;
        }
        // Dispatched asynchronously: the loop keeps accepting batches
        // while a rerun is in flight.
        let ctx = ctx.clone();
        tokio::spawn(async move {
            rerun(ctx, classification).await;
        });
    }
    // Watcher closed: terminal, the loop exits cleanly.
}

async fn rerun(ctx: RerunContext, what: Classification) {
    // Reruns serialize on the per-project rebuild lock; a batch arriving
    // mid-rebuild waits its turn instead of racing on the build ledger.
    let _serialized = ctx.rebuild_lock.lock().await;
    let _paused = ctx.control.pause_scoped();

    let mut desc = String::new();
    if what.frontend {
        desc.push_str("√ Frontend");
    }
    if what.backend {
        if !desc.is_empty() {
            desc.push(' ');
        }
        desc.push_str("√ Backend");
    }
    info!("Change detected [{desc}]");

    if what.frontend {
        ctx.helpers.kill_all();
        if let Err(err) = builder::build(&ctx.shared, &ctx.helpers).await {
            error!(err = %err, "frontend rebuild failed");
            return;
        }
    }

    if what.backend {
        ctx.backend.kill().await;
        let snapshot = ctx.shared.snapshot();
        if let Err(err) = start_backend(&snapshot, &ctx.backend).await {
            error!(err = %err, "backend restart failed");
            return;
        }
    }

    ctx.livereload.send_reload_signal();
}

/// Builds, starts, and supervises an installed project: first build, then
/// the backend process, then the watch loop and live-reload listener as
/// joined tasks. Blocks until those tasks finish or a termination signal
/// arrives; the first task error is surfaced as the overall error.
pub async fn run(project: Project) -> Result<()> {
    let shared = SharedProject::new(project);
    let helpers = HelperRegistry::default();

    builder::build(&shared, &helpers).await?;

    let backend = BackendHandle::default();
    let snapshot = shared.snapshot();
    start_backend(&snapshot, &backend).await?;

    shared.with(|p| p.running = true);
    shared.save()?;

    let result = if snapshot.disable_watch {
        tokio::select! {
            res = backend.wait_natural_exit() => res,
            _ = shutdown_signal() => Ok(()),
        }
    } else {
        watch_and_serve(&shared, &helpers, &backend).await
    };

    shared.with(|p| p.running = false);
    let _ = shared.save();
    backend.kill().await;
    helpers.kill_all();
    result
}

async fn watch_and_serve(
    shared: &SharedProject,
    helpers: &HelperRegistry,
    backend: &BackendHandle,
) -> Result<()> {
    let snapshot = shared.snapshot();
    let dest = snapshot.dest_path();

    let watcher = build_watcher(&snapshot, &dest)?;
    for dir in &watcher.dirs {
        let rel = dir.strip_prefix(&dest).unwrap_or(dir);
        info!("Watching {}/*", rel.display());
    }
    let control = watcher.control();

    let livereload = LiveReload::new(snapshot.livereload.clone());
    let ctx = RerunContext {
        shared: shared.clone(),
        control: control.clone(),
        helpers: helpers.clone(),
        backend: backend.clone(),
        livereload: livereload.clone(),
        rebuild_lock: Arc::new(Mutex::new(())),
    };

    let watch_task = tokio::spawn(consume_batches(watcher, ctx));
    let listener_task = {
        let livereload = livereload.clone();
        tokio::spawn(async move { livereload.listen_and_serve().await })
    };
    let backend_task = {
        let backend = backend.clone();
        tokio::spawn(async move { backend.wait_natural_exit().await })
    };

    let joined = async {
        let (backend_res, listener_res, _) = tokio::join!(backend_task, listener_task, watch_task);
        flatten(backend_res)?;
        flatten(listener_res)?;
        Ok(())
    };

    tokio::select! {
        res = joined => res,
        _ = shutdown_signal() => {
            control.close();
            Ok(())
        }
    }
}

fn flatten(res: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match res {
        Ok(inner) => inner,
        Err(err) => Err(Error::Io(std::io::Error::other(err))),
    }
}

// The watcher skips the configured ignore prefixes plus everything the
// build ledger names, so build output churn never feeds the loop.
fn build_watcher(project: &Project, dest: &Path) -> Result<DirWatcher> {
    let mut prefixes: Vec<String> = project.watch.ignore_prefixes.clone();
    for name in &project.build_files {
        if !prefixes.contains(name) {
            prefixes.push(name.clone());
        }
    }

    let root = dest.to_path_buf();
    DirWatcher::new(dest, move |dir: &Path| {
        if dir == root {
            return true;
        }
        let Ok(rel) = dir.strip_prefix(&root) else {
            return true;
        };
        let rel = rel.to_string_lossy().replace('\\', "/");
        !prefixes.iter().any(|prefix| rel.starts_with(prefix.as_str()))
    })
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::WatchKind;
    use std::path::PathBuf;

    fn project() -> Project {
        Project {
            dest: "/srv/projects/app".to_string(),
            ..Project::default()
        }
    }

    fn event(name: &str) -> WatchEvent {
        WatchEvent::new(PathBuf::from("/srv/projects/app").join(name), WatchKind::Write)
    }

    #[test]
    fn classifies_by_extension_membership() {
        let batch = vec![
            event("app.go"),
            event("styles.css"),
            event(PROJECT_FILENAME),
            event("foo"),
        ];
        let result = classify(&batch, &project());
        assert!(result.backend, "a .go change restarts the backend");
        assert!(result.frontend, "a .css change rebuilds the frontend");
    }

    #[test]
    fn state_file_and_extensionless_changes_are_ignored() {
        let batch = vec![event(PROJECT_FILENAME), event("foo")];
        let result = classify(&batch, &project());
        assert_eq!(result, Classification::default());
    }

    #[test]
    fn proto_changes_affect_both_sides() {
        let batch = vec![event("api.proto")];
        let result = classify(&batch, &project());
        assert!(result.backend && result.frontend);
    }

    #[test]
    fn bulk_batches_rebuild_everything_without_inspection() {
        let batch: Vec<WatchEvent> = (0..25).map(|i| event(&format!("f{i}.xyz"))).collect();
        let result = classify(&batch, &project());
        assert_eq!(result, Classification::ALL);
    }

    #[test]
    fn threshold_is_exclusive() {
        let batch: Vec<WatchEvent> = (0..20).map(|i| event(&format!("f{i}.xyz"))).collect();
        let result = classify(&batch, &project());
        assert_eq!(result, Classification::default());
    }

    #[test]
    fn artifact_extensions_never_classify() {
        let batch = vec![event("app.exe"), event("editor.tmp"), event("app.exe~")];
        let result = classify(&batch, &project());
        assert_eq!(result, Classification::default());
    }

    #[test]
    fn ext_of_requires_a_real_extension() {
        assert_eq!(ext_of("main.go"), Some(".go"));
        assert_eq!(ext_of("foo"), None);
        assert_eq!(ext_of(".gitignore"), None);
        assert_eq!(ext_of("trailing."), None);
    }
}
