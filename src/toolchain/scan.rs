//! Dependency scanning through a P1689-speaking scanner such as
//! `clang-scan-deps -format=p1689`.

use rayon::prelude::*;
use serde::Deserialize;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

use super::{command, ScanResult, ScannedModule, Scanner, TranslationUnit};
use crate::error::{DaemonError, Result};
use crate::hash::ContentHash;

#[derive(Debug, Deserialize)]
struct P1689File {
    #[serde(default)]
    rules: Vec<P1689Rule>,
}

#[derive(Debug, Deserialize)]
struct P1689Rule {
    #[serde(default)]
    provides: Vec<P1689Module>,
    #[serde(default)]
    requires: Vec<P1689Module>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct P1689Module {
    logical_name: String,
    #[serde(default)]
    source_path: Option<PathBuf>,
}

/// Modules one source file provides and requires.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct FileDeps {
    pub provides: Vec<String>,
    /// Required module names, with the scanner's source hint if it had one.
    pub requires: Vec<(String, Option<PathBuf>)>,
}

pub(crate) fn parse_p1689(json: &str) -> Result<FileDeps> {
    let file: P1689File = serde_json::from_str(json).map_err(|e| DaemonError::ParseError(format!("p1689: {e}")))?;
    let mut deps = FileDeps::default();
    for rule in file.rules {
        deps.provides.extend(rule.provides.into_iter().map(|m| m.logical_name));
        for req in rule.requires {
            if !deps.requires.iter().any(|(n, _)| *n == req.logical_name) {
                deps.requires.push((req.logical_name, req.source_path));
            }
        }
    }
    Ok(deps)
}

/// Walk from a unit's direct requirements to every reachable module,
/// scanning each interface once, then hash the interface sources in
/// parallel.
pub(crate) fn collect(
    tu: &TranslationUnit,
    primary: FileDeps,
    mut scan_module: impl FnMut(&Path) -> Result<FileDeps>,
) -> Result<ScanResult> {
    let fail = |reason: String| DaemonError::ScanFailure {
        tu: tu.id.to_string(),
        reason,
    };

    let requires: Vec<String> = primary.requires.iter().map(|(n, _)| n.clone()).collect();
    let mut queue: VecDeque<(String, Option<PathBuf>)> = primary.requires.into_iter().collect();
    let mut found: BTreeMap<String, (PathBuf, Vec<String>)> = BTreeMap::new();

    while let Some((name, hint)) = queue.pop_front() {
        if found.contains_key(&name) {
            continue;
        }
        let source = tu
            .file_mapping
            .get(&name)
            .cloned()
            .or(hint)
            .map(|p| tu.resolve(&p))
            .ok_or_else(|| fail(format!("no source file known for module '{name}'")))?;

        let deps = scan_module(&source)?;
        if !deps.provides.is_empty() && !deps.provides.contains(&name) {
            return Err(fail(format!(
                "{} provides {:?}, not module '{name}'",
                source.display(),
                deps.provides
            )));
        }
        let names: Vec<String> = deps.requires.iter().map(|(n, _)| n.clone()).collect();
        queue.extend(deps.requires);
        found.insert(name, (source, names));
    }

    let modules = found
        .into_par_iter()
        .map(|(name, (source, requires))| {
            let bytes = fs::read(&source).map_err(|e| fail(format!("cannot read {}: {e}", source.display())))?;
            Ok(ScannedModule {
                name,
                content_hash: ContentHash::from_bytes(&bytes),
                source,
                requires,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(ScanResult { requires, modules })
}

/// Runs an external P1689 dependency scanner.
#[derive(Debug, Clone)]
pub struct P1689Scanner {
    tool: String,
}

impl P1689Scanner {
    pub fn new(tool: impl Into<String>) -> Self {
        Self { tool: tool.into() }
    }

    fn run(&self, tu: &TranslationUnit, command: &[String]) -> Result<FileDeps> {
        debug!(tool = %self.tool, tu = %tu.id, "running scanner");
        let output = Command::new(&self.tool)
            .arg("-format=p1689")
            .arg("--")
            .args(command)
            .current_dir(&tu.working_directory)
            .output()
            .map_err(|e| DaemonError::ScanFailure {
                tu: tu.id.to_string(),
                reason: format!("cannot run {}: {e}", self.tool),
            })?;
        if !output.status.success() {
            return Err(DaemonError::ScanFailure {
                tu: tu.id.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        parse_p1689(&String::from_utf8_lossy(&output.stdout)).map_err(|e| DaemonError::ScanFailure {
            tu: tu.id.to_string(),
            reason: e.to_string(),
        })
    }
}

impl Scanner for P1689Scanner {
    fn scan(&self, tu: &TranslationUnit) -> Result<ScanResult> {
        let primary = self.run(tu, &tu.command)?;
        let result = collect(tu, primary, |source| {
            self.run(tu, &command::rewrite_source(&tu.command, source))
        })?;
        debug!(
            tu = %tu.id,
            requires = result.requires.len(),
            modules = result.modules.len(),
            "scan complete"
        );
        Ok(result)
    }
}
