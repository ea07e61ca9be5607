//! Inline build-command extraction from project sources.
//!
//! Projects can embed build/codegen instructions in comments using a
//! `$ <command>` marker, in both line and block comments. Static asset
//! handlers are also located so generated asset data files can be produced
//! for the directories they serve.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use regex::Regex;

use crate::error::Result;

/// A command extracted from a source comment, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineCommand {
    pub name: String,
    pub args: Vec<String>,
}

impl InlineCommand {
    fn from_line(line: &str) -> Result<Option<Self>> {
        let mut parts = shell_words::split(line)?;
        if parts.is_empty() {
            return Ok(None);
        }
        let name = parts.remove(0);
        Ok(Some(Self { name, args: parts }))
    }

    /// The command as written, for diagnostics.
    pub fn display(&self) -> String {
        let mut parts = Vec::with_capacity(1 + self.args.len());
        parts.push(self.name.clone());
        parts.extend(self.args.clone());
        shell_words::join(parts)
    }
}

/// A directory served as static assets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetDir {
    pub dir: String,
    /// True when the serving call expects a generated asset data file.
    pub should_generate: bool,
}

/// The outcome of scanning a project's sources.
#[derive(Debug, Clone, Default)]
pub struct ParseResult {
    pub commands: Vec<InlineCommand>,
    pub asset_dirs: Vec<AssetDir>,
}

/// Scans every Go source under `root` (skipping dependency caches) and
/// aggregates inline commands and asset directories in file order.
pub fn parse_dir(root: &Path) -> Result<ParseResult> {
    let mut files: Vec<PathBuf> = Vec::new();
    let walker = WalkBuilder::new(root)
        .standard_filters(false)
        .follow_links(false)
        .filter_entry(|entry| {
            entry
                .file_name()
                .to_str()
                .map(|name| name != "node_modules" && name != ".git")
                .unwrap_or(true)
        })
        .build();
    for entry in walker {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if entry.file_type().map(|t| t.is_file()).unwrap_or(false)
            && path.extension().map(|ext| ext == "go").unwrap_or(false)
        {
            files.push(path.to_path_buf());
        }
    }
    files.sort();

    let mut result = ParseResult::default();
    for file in files {
        let src = std::fs::read_to_string(&file)?;
        merge(&mut result, parse_source(&src)?);
    }
    Ok(result)
}

/// Parses a single source text.
pub fn parse_source(src: &str) -> Result<ParseResult> {
    let mut result = ParseResult {
        commands: extract_commands(src)?,
        asset_dirs: Vec::new(),
    };

    let consts = string_consts(src);
    for (expr, has_options) in handle_dir_calls(src) {
        let dir = if let Some(literal) = expr.strip_prefix('"') {
            literal.trim_end_matches('"').to_string()
        } else if let Some(value) = consts.get(expr.as_str()) {
            value.clone()
        } else {
            continue;
        };
        push_asset_dir(
            &mut result.asset_dirs,
            AssetDir {
                dir,
                should_generate: has_options,
            },
        );
    }
    Ok(result)
}

fn merge(into: &mut ParseResult, from: ParseResult) {
    into.commands.extend(from.commands);
    for dir in from.asset_dirs {
        push_asset_dir(&mut into.asset_dirs, dir);
    }
}

fn push_asset_dir(dirs: &mut Vec<AssetDir>, dir: AssetDir) {
    if !dirs.iter().any(|existing| existing.dir == dir.dir) {
        dirs.push(dir);
    }
}

// Extracts `$ command` lines from both `//` and `/* */` comments,
// preserving declaration order.
fn extract_commands(src: &str) -> Result<Vec<InlineCommand>> {
    let mut commands = Vec::new();
    let mut in_block = false;

    for line in src.lines() {
        let mut text: Option<&str> = None;
        if in_block {
            if let Some(end) = line.find("*/") {
                text = Some(&line[..end]);
                in_block = false;
            } else {
                text = Some(line);
            }
        } else if let Some(start) = line.find("/*") {
            let rest = &line[start + 2..];
            if let Some(end) = rest.find("*/") {
                text = Some(&rest[..end]);
            } else {
                text = Some(rest);
                in_block = true;
            }
        } else if let Some(start) = line.find("//") {
            text = Some(&line[start + 2..]);
        }

        let Some(text) = text else { continue };
        let trimmed = text.trim();
        if let Some(rest) = trimmed.strip_prefix('$') {
            if let Some(command) = InlineCommand::from_line(rest.trim())? {
                commands.push(command);
            }
        }
    }

    Ok(commands)
}

// Top-level `const name = "value"` string declarations.
fn string_consts(src: &str) -> HashMap<String, String> {
    let re = Regex::new(r#"(?m)^\s*const\s+(\w+)\s*(?:string\s*)?=\s*"([^"]*)""#)
        .expect("const pattern is valid");
    re.captures_iter(src)
        .map(|cap| (cap[1].to_string(), cap[2].to_string()))
        .collect()
}

// Locates `.HandleDir(route, dir, ...)` calls and returns the second
// argument expression plus whether the call passes generated-asset options.
fn handle_dir_calls(src: &str) -> Vec<(String, bool)> {
    let arg_re = Regex::new(r#"^\s*"(?:[^"\\]|\\.)*"\s*,\s*(?:("(?:[^"\\]|\\.)*")|([A-Za-z_]\w*))"#)
        .expect("argument pattern is valid");

    let mut calls = Vec::new();
    let marker = ".HandleDir(";
    let mut search = 0;
    while let Some(pos) = src[search..].find(marker) {
        let open = search + pos + marker.len() - 1;
        let Some(close) = matching_paren(src, open) else {
            break;
        };
        let call = &src[open + 1..close];
        if let Some(cap) = arg_re.captures(call) {
            let expr = cap
                .get(1)
                .or_else(|| cap.get(2))
                .map(|m| m.as_str().to_string());
            if let Some(expr) = expr {
                calls.push((expr, call.contains("Asset")));
            }
        }
        search = close;
    }
    calls
}

// Index of the parenthesis matching the one at `open`, skipping over
// string literals.
fn matching_paren(src: &str, open: usize) -> Option<usize> {
    let bytes = src.as_bytes();
    let mut depth = 0usize;
    let mut in_string: Option<u8> = None;
    let mut escaped = false;
    for (idx, &byte) in bytes.iter().enumerate().skip(open) {
        if let Some(quote) = in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' && quote == b'"' {
                escaped = true;
            } else if byte == quote {
                in_string = None;
            }
            continue;
        }
        match byte {
            b'"' | b'`' => in_string = Some(byte),
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: &str = r#"package main

const assetsDirectory = "./app/build_var"

func main() {
    app := web.New()

    /* $ command1
    $ command2 */

    // $ command3

    /* $ command 4
    $ command5
        $ command6
    */

    app.HandleDir("/", "./app/build_literal", web.DirOptions{
        Asset:      Asset,
        AssetNames: AssetNames,
        AssetInfo:  AssetInfo,
    })

    app.HandleDir("/", assetsDirectory, web.DirOptions{
        Asset:      Asset,
        AssetNames: AssetNames,
        AssetInfo:  AssetInfo,
    })

    app.HandleDir("/", "./public")
}
"#;

    #[test]
    fn extracts_commands_in_declaration_order() {
        let result = parse_source(SRC).unwrap();
        let displays: Vec<String> = result.commands.iter().map(|c| c.display()).collect();
        assert_eq!(
            displays,
            vec!["command1", "command2", "command3", "command 4", "command5", "command6"]
        );
    }

    #[test]
    fn resolves_asset_dirs_and_generation_flags() {
        let result = parse_source(SRC).unwrap();
        assert_eq!(
            result.asset_dirs,
            vec![
                AssetDir {
                    dir: "./app/build_literal".to_string(),
                    should_generate: true
                },
                AssetDir {
                    dir: "./app/build_var".to_string(),
                    should_generate: true
                },
                AssetDir {
                    dir: "./public".to_string(),
                    should_generate: false
                },
            ]
        );
    }

    #[test]
    fn splits_command_arguments() {
        let result = parse_source("// $ go-bindata -o bindata.go ./app/build/...\n").unwrap();
        assert_eq!(result.commands.len(), 1);
        assert_eq!(result.commands[0].name, "go-bindata");
        assert_eq!(
            result.commands[0].args,
            vec!["-o", "bindata.go", "./app/build/..."]
        );
    }

    #[test]
    fn asset_dirs_are_deduplicated() {
        let src = r#"
        app.HandleDir("/", "./public")
        app.HandleDir("/static", "./public")
        "#;
        let result = parse_source(src).unwrap();
        assert_eq!(result.asset_dirs.len(), 1);
    }
}
