//! Slipway: a development-loop orchestrator for downloaded web projects.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, resolves paths, and dispatches into the lifecycle
//! operations: install, run, clean, and uninstall.

mod builder;
mod error;
mod install;
mod livereload;
mod parser;
mod project;
mod rerun;
mod runner;
mod watch;

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};

use crate::error::Error;
use crate::project::Project;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "slipway",
    version,
    about = "Install, run, and live-reload web projects",
    styles = help_styles(),
    color = clap::ColorChoice::Always,
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Download a project archive and install it locally.
    Install {
        /// Source repository, "owner/repo" or "owner/repo@version".
        repo: String,
        /// Project name; defaults to the repository base name.
        #[arg(long)]
        name: Option<String>,
        /// Version ref to install ("latest" resolves to master).
        #[arg(long)]
        version: Option<String>,
        /// Destination directory; defaults to a directory named after the
        /// project under $SLIPWAY_HOME or the current directory.
        #[arg(long)]
        dest: Option<String>,
        /// Module path the downloaded sources are rewritten to.
        #[arg(long)]
        module: Option<String>,
        /// Raw text replacement OLD=NEW applied to extracted files.
        #[arg(long)]
        replace: Vec<String>,
    },
    /// Build and run an installed project, watching for changes.
    Run {
        /// Project directory (default: current directory).
        path: Option<PathBuf>,
    },
    /// Remove the files created by build steps.
    Clean {
        /// Project directory (default: current directory).
        path: Option<PathBuf>,
    },
    /// Remove all project files, including the state file.
    Uninstall {
        /// Project directory (default: current directory).
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = dispatch(Cli::parse()).await {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

async fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Install {
            repo,
            name,
            version,
            dest,
            module,
            replace,
        } => {
            let (repo, ref_from_repo) = split_repo_ref(&repo);
            let name = name
                .or_else(|| repo.rsplit('/').next().map(str::to_string))
                .ok_or_else(|| anyhow!("cannot derive a project name from {repo}"))?;
            let version = version
                .or(ref_from_repo)
                .unwrap_or_else(|| "master".to_string());
            let dest = resolve_dest(dest, &name)?;
            let replacements = parse_replacements(&replace)?;

            let mut project = Project {
                name,
                repo,
                version,
                dest,
                module: module.unwrap_or_default(),
                ..Project::default()
            };
            project.set_defaults();
            install::install(&mut project, &replacements).await?;
            println!("installed {} into {}", project.name, project.dest);
            Ok(())
        }
        Commands::Run { path } => {
            let project = match load_project(path) {
                Ok(project) => project,
                Err(err) if err.is_not_found() => {
                    return Err(anyhow!(
                        "{err}; install one first with `slipway install <owner/repo>`"
                    ));
                }
                Err(err) => return Err(err.into()),
            };
            rerun::run(project).await?;
            Ok(())
        }
        Commands::Clean { path } => {
            let mut project = load_project(path)?;
            project.clean()?;
            Ok(())
        }
        Commands::Uninstall { path } => {
            let mut project = load_project(path)?;
            project.uninstall()?;
            Ok(())
        }
    }
}

fn load_project(path: Option<PathBuf>) -> std::result::Result<Project, Error> {
    let path = path.unwrap_or_else(|| PathBuf::from("."));
    let path = std::fs::canonicalize(&path).map_err(|_| Error::ProjectNotFound)?;
    Project::load(&path)
}

/// Resolves the concrete destination directory before any operation runs.
/// `SLIPWAY_HOME` relocates the default installation root when no
/// destination was given.
fn resolve_dest(dest: Option<String>, name: &str) -> Result<String> {
    let base = match dest {
        Some(dest) => PathBuf::from(dest),
        None => match std::env::var_os("SLIPWAY_HOME") {
            Some(home) => PathBuf::from(home).join(name),
            None => std::env::current_dir()?.join(name),
        },
    };
    std::fs::create_dir_all(&base)?;
    let abs = std::fs::canonicalize(&base)?;
    Ok(abs.to_string_lossy().replace('\\', "/"))
}

fn split_repo_ref(repo: &str) -> (String, Option<String>) {
    match repo.split_once('@') {
        Some((repo, version)) if !version.is_empty() => {
            (repo.to_string(), Some(version.to_string()))
        }
        _ => (repo.to_string(), None),
    }
}

fn parse_replacements(entries: &[String]) -> Result<HashMap<String, String>> {
    let mut replacements = HashMap::new();
    for entry in entries {
        let (old, new) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid replacement {entry}, expected OLD=NEW"))?;
        replacements.insert(old.to_string(), new.to_string());
    }
    Ok(replacements)
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_repo_ref_handles_optional_version() {
        assert_eq!(
            split_repo_ref("owner/repo"),
            ("owner/repo".to_string(), None)
        );
        assert_eq!(
            split_repo_ref("owner/repo@v12"),
            ("owner/repo".to_string(), Some("v12".to_string()))
        );
        assert_eq!(
            split_repo_ref("owner/repo@"),
            ("owner/repo@".to_string(), None)
        );
    }

    #[test]
    fn parse_replacements_requires_key_value_pairs() {
        let parsed = parse_replacements(&["old=new".to_string()]).unwrap();
        assert_eq!(parsed.get("old").map(String::as_str), Some("new"));
        assert!(parse_replacements(&["broken".to_string()]).is_err());
    }
}
