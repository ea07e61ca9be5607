//! Project installation from a remote archive.
//!
//! The archive is a gzipped tarball whose single root entry is a
//! directory (the GitHub `/archive/<ref>.tar.gz` shape). Extraction
//! validates every entry path against the destination before writing it;
//! a path that would escape aborts the whole operation. Any install
//! failure rolls back the partially-accumulated ledger via uninstall.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Component, Path};
use std::time::Duration;

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::project::{safe_join, Project};

/// Downloads and unpacks the project, records the install ledger, and
/// persists the state file. The destination directory may be non-empty;
/// only the paths recorded in the ledger belong to the project.
pub async fn install(project: &mut Project, replacements: &HashMap<String, String>) -> Result<()> {
    let bytes = download(project).await?;
    if let Err(err) = extract(project, &bytes, replacements) {
        // Remove whatever was partially installed before surfacing.
        if let Err(cleanup_err) = project.uninstall() {
            warn!(err = %cleanup_err, "rollback after failed install left residue");
        }
        return Err(err);
    }
    project.save()
}

async fn download(project: &mut Project) -> Result<Vec<u8>> {
    let version = project
        .version
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_string();
    project.version = if version.is_empty() || version == "latest" {
        "master".to_string()
    } else {
        version
    };

    let url = format!(
        "https://github.com/{}/archive/{}.tar.gz",
        project.repo, project.version
    );
    info!(url = %url, "downloading project archive");
    let client = reqwest::Client::builder()
        .user_agent(format!("slipway/{}", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(10))
        .build()?;
    let response = client.get(&url).send().await?;
    if !response.status().is_success() {
        return Err(Error::InvalidArchive(format!(
            "download of <{}> failed with status {}",
            url,
            response.status()
        )));
    }
    Ok(response.bytes().await?.to_vec())
}

fn extract(
    project: &mut Project,
    bytes: &[u8],
    replacements: &HashMap<String, String>,
) -> Result<()> {
    let (root, gomod) = scan_archive(bytes)?;

    let repo_base = project.repo.rsplit('/').next().unwrap_or(&project.repo);
    if !root.contains(repo_base) {
        return Err(Error::InvalidArchive(format!(
            "expected root folder to match the repository name <{repo_base}> but got <{root}>"
        )));
    }

    let Some(old_module) = gomod.as_deref().and_then(module_path) else {
        // Without a module descriptor there is nothing we can build or run.
        return Err(Error::UnsupportedProject {
            name: project.name.clone(),
            version: project.version.clone(),
        });
    };
    if project.module.is_empty() {
        project.module = old_module.clone();
    }

    let dest = project.dest_path();
    std::fs::create_dir_all(&dest)?;
    let rewrite_module = old_module != project.module;
    let root_path = Path::new(&root).to_path_buf();

    let mut archive = Archive::new(GzDecoder::new(bytes));
    for entry in archive.entries()? {
        let mut entry = entry?;
        if is_meta_entry(entry.header().entry_type()) {
            continue;
        }
        let path = entry.path()?.into_owned();
        let Ok(rel) = path.strip_prefix(&root_path) else {
            continue;
        };
        let name = slash_name(rel);
        if name.is_empty() {
            continue;
        }
        let target = safe_join(&dest, &name)?;

        if entry.header().entry_type().is_dir() {
            std::fs::create_dir_all(&target)?;
            record_file(project, name);
            continue;
        }

        let mut contents = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut contents)?;
        if rewrite_module {
            contents = replace_all_bytes(contents, old_module.as_bytes(), project.module.as_bytes());
        }
        for (old, new) in replacements {
            contents = replace_all_bytes(contents, old.as_bytes(), new.as_bytes());
        }

        if let Some(parent) = target.parent() {
            // Some tarballs omit explicit directory entries.
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, &contents)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(mode) = entry.header().mode() {
                let _ = std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode));
            }
        }
        record_file(project, name);
    }

    Ok(())
}

// First pass over the archive: the root directory name and the module
// descriptor's contents, plus shape validation.
fn scan_archive(bytes: &[u8]) -> Result<(String, Option<Vec<u8>>)> {
    let mut archive = Archive::new(GzDecoder::new(bytes));
    let mut root: Option<String> = None;
    let mut gomod: Option<Vec<u8>> = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        if is_meta_entry(entry.header().entry_type()) {
            continue;
        }
        let path = entry.path()?.into_owned();

        let Some(first) = path.components().find_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        }) else {
            continue;
        };

        match &root {
            None => {
                if !entry.header().entry_type().is_dir() {
                    return Err(Error::InvalidArchive(format!(
                        "expected a root folder but got <{}>",
                        path.display()
                    )));
                }
                root = Some(first);
            }
            Some(root) => {
                if first != *root {
                    return Err(Error::InvalidArchive(format!(
                        "expected a single root folder <{root}> but got <{}>",
                        path.display()
                    )));
                }
            }
        }

        if let Some(root) = &root {
            if path == Path::new(root).join("go.mod") {
                let mut buf = Vec::new();
                entry.read_to_end(&mut buf)?;
                gomod = Some(buf);
            }
        }
    }

    let root = root.ok_or_else(|| Error::InvalidArchive("empty archive".to_string()))?;
    Ok((root, gomod))
}

fn is_meta_entry(kind: EntryType) -> bool {
    matches!(kind, EntryType::XGlobalHeader | EntryType::XHeader)
}

fn slash_name(rel: &Path) -> String {
    let name = rel.to_string_lossy().replace('\\', "/");
    name.trim_end_matches('/').to_string()
}

fn record_file(project: &mut Project, name: String) {
    if !project.files.iter().any(|existing| *existing == name) {
        project.files.push(name);
    }
}

/// Parses the `module` declaration from go.mod contents.
fn module_path(contents: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(contents);
    for line in text.lines() {
        let line = line.split("//").next().unwrap_or("").trim();
        let Some(rest) = line.strip_prefix("module") else {
            continue;
        };
        if !rest.starts_with(|c: char| c.is_whitespace()) {
            continue;
        }
        let value = rest.trim().trim_matches('"').trim_matches('`');
        if value.is_empty() {
            continue;
        }
        return Some(value.to_string());
    }
    None
}

fn replace_all_bytes(data: Vec<u8>, needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    if needle.is_empty() || data.len() < needle.len() {
        return data;
    }
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i..].starts_with(needle) {
            out.extend_from_slice(replacement);
            i += needle.len();
        } else {
            out.push(data[i]);
            i += 1;
        }
    }
    out
}
