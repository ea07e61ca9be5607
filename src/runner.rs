//! Child process execution and termination.
//!
//! Every process started here is placed in its own process group (or the
//! platform equivalent) so that build tools which spawn their own children
//! can be killed as a unit. Termination is forceful and group-wide; there is
//! no graceful-shutdown protocol.

use std::ffi::OsStr;
use std::io::ErrorKind;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Helper executables that may be referenced by inline commands but missing
/// from the search path, mapped to the package `go get` fetches them from.
const HELPER_PACKAGES: &[(&str, &str)] = &[("go-bindata", "github.com/go-bindata/go-bindata/...")];

/// Source stream of a forwarded output line.
#[derive(Debug, Clone, Copy)]
enum StreamKind {
    Stdout,
    Stderr,
}

/// Builds a command that starts detached into its own process group.
pub fn command<S: AsRef<OsStr>>(program: S) -> Command {
    let mut cmd = Command::new(program);

    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            let _ = libc::setpgid(0, 0);
            Ok(())
        });
    }

    #[cfg(windows)]
    {
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    cmd
}

/// Runs a command to completion and returns its combined output.
///
/// On a non-zero exit the combined output becomes the error message,
/// verbatim, so callers can surface tool diagnostics as-is.
pub async fn run_to_completion(program: &str, args: &[String], dir: &Path) -> Result<String> {
    run_with_fetch(program, args, dir, None).await
}

/// Same as [`run_to_completion`] but registers the child with `helpers`
/// while it runs, so a frontend rerun can kill stragglers group-wide.
pub async fn run_helper(
    program: &str,
    args: &[String],
    dir: &Path,
    helpers: &HelperRegistry,
) -> Result<String> {
    run_with_fetch(program, args, dir, Some(helpers)).await
}

// One-time fetch-and-retry for known helper binaries that are not on the
// search path. A second failure is final; never retried again.
async fn run_with_fetch(
    program: &str,
    args: &[String],
    dir: &Path,
    helpers: Option<&HelperRegistry>,
) -> Result<String> {
    match capture(program, args, dir, helpers).await {
        Err(Error::Io(err)) if err.kind() == ErrorKind::NotFound => {
            let Some(package) = helper_package(program) else {
                return Err(Error::Io(err));
            };
            info!(helper = program, package, "helper binary missing, fetching");
            let fetch_args: Vec<String> = ["get", "-u", "-f", package]
                .iter()
                .map(|s| s.to_string())
                .collect();
            capture("go", &fetch_args, dir, None).await?;
            capture(program, args, dir, helpers).await
        }
        other => other,
    }
}

fn helper_package(program: &str) -> Option<&'static str> {
    HELPER_PACKAGES
        .iter()
        .find(|(name, _)| *name == program)
        .map(|(_, package)| *package)
}

async fn capture(
    program: &str,
    args: &[String],
    dir: &Path,
    helpers: Option<&HelperRegistry>,
) -> Result<String> {
    let mut cmd = command(program);
    cmd.args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let child = cmd.spawn()?;
    let pid = child.id();
    if let (Some(registry), Some(pid)) = (helpers, pid) {
        registry.register(pid);
    }
    let output = child.wait_with_output().await;
    if let (Some(registry), Some(pid)) = (helpers, pid) {
        registry.deregister(pid);
    }

    let output = output?;
    let mut combined = output.stdout;
    combined.extend_from_slice(&output.stderr);
    let text = String::from_utf8_lossy(&combined).into_owned();
    if output.status.success() {
        Ok(text)
    } else {
        Err(Error::ToolFailure(text))
    }
}

/// Tracks the process ids of in-flight build/helper subprocesses so the
/// previous generation can be terminated before a frontend rebuild.
#[derive(Clone, Default)]
pub struct HelperRegistry {
    pids: Arc<Mutex<Vec<u32>>>,
}

impl HelperRegistry {
    fn register(&self, pid: u32) {
        self.lock().push(pid);
    }

    fn deregister(&self, pid: u32) {
        self.lock().retain(|p| *p != pid);
    }

    /// Group-kills every registered subprocess and forgets them.
    pub fn kill_all(&self) {
        let pids: Vec<u32> = self.lock().drain(..).collect();
        for pid in pids {
            kill_group(pid);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u32>> {
        self.pids.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Forcibly terminates the process group rooted at `pid`.
#[cfg(unix)]
pub fn kill_group(pid: u32) {
    unsafe {
        let pid = pid as i32;
        let _ = libc::kill(-pid, libc::SIGKILL);
        let _ = libc::kill(pid, libc::SIGKILL);
    }
}

/// Forcibly terminates the process tree rooted at `pid`.
#[cfg(windows)]
pub fn kill_group(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/T", "/F", "/PID", &pid.to_string()])
        .output();
}

/// Kills a supervised child group-wide and reaps it.
pub async fn kill_child(mut child: Child) {
    if let Some(pid) = child.id() {
        kill_group(pid);
    }
    let _ = child.wait().await;
}

/// Appends the platform executable suffix to a binary name.
pub fn format_executable(bin: &str) -> String {
    if cfg!(windows) && !bin.ends_with(".exe") {
        format!("{bin}.exe")
    } else {
        bin.to_string()
    }
}

/// Starts a long-running supervised process with its output forwarded
/// line-by-line to this process's stdout/stderr.
pub fn start_supervised<S: AsRef<OsStr>>(program: S, args: &[String], dir: &Path) -> Result<Child> {
    let mut cmd = command(program);
    spawn_forwarded(&mut cmd, args, dir)
}

/// Starts the compiled project binary.
///
/// The start is shell-wrapped so projects can rely on a shell environment;
/// sandboxed and containerized hosts may refuse that spawn with an
/// "operation not permitted" class error, in which case the binary is
/// executed directly (outside a dedicated group) instead.
pub fn start_executable(dir: &Path, bin: &str) -> Result<Child> {
    #[cfg(unix)]
    {
        let invocation = if bin.contains('/') {
            bin.to_string()
        } else {
            format!("./{bin}")
        };
        let args = vec!["-c".to_string(), invocation];
        match start_supervised("/bin/sh", &args, dir) {
            Ok(child) => Ok(child),
            Err(Error::Io(err)) if err.kind() == ErrorKind::PermissionDenied => {
                warn!("shell-wrapped start refused, executing directly");
                let mut cmd = Command::new(dir.join(bin));
                spawn_forwarded(&mut cmd, &[], dir)
            }
            Err(err) => Err(err),
        }
    }

    #[cfg(windows)]
    {
        let args = vec!["/c".to_string(), bin.to_string()];
        start_supervised("cmd", &args, dir)
    }
}

fn spawn_forwarded(cmd: &mut Command, args: &[String], dir: &Path) -> Result<Child> {
    cmd.args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn()?;
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_stream(stdout, StreamKind::Stdout));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_stream(stderr, StreamKind::Stderr));
    }
    Ok(child)
}

async fn forward_stream<R>(reader: R, stream: StreamKind)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match stream {
            StreamKind::Stdout => println!("{line}"),
            StreamKind::Stderr => eprintln!("{line}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_executable_appends_suffix_on_windows_only() {
        if cfg!(windows) {
            assert_eq!(format_executable("app"), "app.exe");
            assert_eq!(format_executable("app.exe"), "app.exe");
        } else {
            assert_eq!(format_executable("app"), "app");
        }
    }

    #[test]
    fn helper_package_known_only() {
        assert_eq!(
            helper_package("go-bindata"),
            Some("github.com/go-bindata/go-bindata/...")
        );
        assert_eq!(helper_package("npm"), None);
    }

    #[tokio::test]
    async fn run_to_completion_returns_combined_output_on_failure() {
        let dir = std::env::temp_dir();
        let (shell, args): (&str, Vec<String>) = if cfg!(windows) {
            ("cmd", vec!["/c".into(), "echo boom& exit 3".into()])
        } else {
            ("/bin/sh", vec!["-c".into(), "echo boom; exit 3".into()])
        };
        let err = run_to_completion(shell, &args, &dir).await.unwrap_err();
        match err {
            Error::ToolFailure(output) => assert!(output.contains("boom")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_child_terminates_the_whole_group() {
        use std::time::Duration;

        // A shell that spawns its own child; killing only the shell would
        // leave the sleep orphaned.
        let args = vec!["-c".to_string(), "sleep 30 & wait".to_string()];
        let child = start_supervised("/bin/sh", &args, &std::env::temp_dir()).unwrap();
        let pid = child.id().expect("spawned child has a pid") as i32;

        tokio::time::sleep(Duration::from_millis(300)).await;
        kill_child(child).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        // The group leader is gone, so signalling the group must fail.
        let alive = unsafe { libc::kill(-pid, 0) };
        assert_eq!(alive, -1, "process group {pid} should be gone");
    }
}
