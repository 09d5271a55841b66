//! Scan and compile collaborators.
//!
//! The daemon never parses C++ itself. A [`Scanner`] reports which modules a
//! translation unit needs; a [`Compiler`] turns one module interface into an
//! artifact. Both run outside every daemon lock.

pub mod command;
pub mod compile;
pub mod scan;

pub use compile::CommandCompiler;
pub use scan::P1689Scanner;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::hash::{ContentHash, ContextHash, TuId};

/// A registered compiler invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationUnit {
    pub id: TuId,
    pub working_directory: PathBuf,
    pub command: Vec<String>,
    /// Module name to interface source, for modules the scanner cannot
    /// locate on its own.
    pub file_mapping: BTreeMap<String, PathBuf>,
}

impl TranslationUnit {
    pub fn new(working_directory: PathBuf, command: Vec<String>, file_mapping: BTreeMap<String, PathBuf>) -> Self {
        Self {
            id: TuId::of(&working_directory, &command),
            working_directory,
            command,
            file_mapping,
        }
    }

    pub fn context(&self) -> ContextHash {
        ContextHash::of_flags(&command::context_flags(&self.command))
    }

    /// The unit's own source file, resolved against its working directory.
    pub fn source(&self) -> Option<PathBuf> {
        command::source_file(&self.command).map(|s| self.resolve(Path::new(s)))
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.working_directory.join(path)
        }
    }
}

/// One module interface found by a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedModule {
    pub name: String,
    pub source: PathBuf,
    pub content_hash: ContentHash,
    /// Direct module dependencies.
    pub requires: Vec<String>,
}

/// Result of scanning one translation unit: its direct requirements and
/// every module reachable from them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    pub requires: Vec<String>,
    pub modules: Vec<ScannedModule>,
}

/// Everything needed to build one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileJob {
    pub module: String,
    pub source: PathBuf,
    pub working_directory: PathBuf,
    /// Compile command of the unit that first requested the module.
    pub template: Vec<String>,
    /// Resolved dependency artifacts, by module name.
    pub dependencies: Vec<(String, PathBuf)>,
    pub output: PathBuf,
}

pub trait Scanner: Send + Sync {
    fn scan(&self, tu: &TranslationUnit) -> Result<ScanResult>;
}

pub trait Compiler: Send + Sync {
    /// Write the artifact to `job.output`, or fail with a diagnostic.
    fn compile(&self, job: &CompileJob) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_and_context_come_from_the_command() {
        let cmd: Vec<String> = ["clang++", "-std=c++20", "-c", "main.cpp"].iter().map(|s| s.to_string()).collect();
        let a = TranslationUnit::new(PathBuf::from("/w"), cmd.clone(), BTreeMap::new());
        let b = TranslationUnit::new(PathBuf::from("/w"), cmd, BTreeMap::new());
        assert_eq!(a.id, b.id);
        assert_eq!(a.context(), ContextHash::of_flags(&["-std=c++20"]));
        assert_eq!(a.source(), Some(PathBuf::from("/w/main.cpp")));
    }
}
