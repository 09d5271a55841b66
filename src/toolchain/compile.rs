//! Module compilation by running the unit's own compiler.

use std::fs;
use std::process::Command;
use tracing::debug;

use super::{command, CompileJob, Compiler};
use crate::error::{DaemonError, Result};

/// Precompiles module interfaces with the compiler named in each job's
/// command template.
#[derive(Debug, Clone, Default)]
pub struct CommandCompiler;

impl CommandCompiler {
    pub fn new() -> Self {
        Self
    }
}

impl Compiler for CommandCompiler {
    fn compile(&self, job: &CompileJob) -> Result<()> {
        let argv = command::module_compile_command(&job.template, &job.source, &job.dependencies, &job.output);
        let (program, args) = argv.split_first().ok_or_else(|| DaemonError::CompileFailure {
            module: job.module.clone(),
            diagnostic: "empty compile command".to_string(),
        })?;
        if let Some(parent) = job.output.parent() {
            fs::create_dir_all(parent)?;
        }

        debug!(module = %job.module, program = %program, args = args.len(), "compiling module");
        let output = Command::new(program)
            .args(args)
            .current_dir(&job.working_directory)
            .output()
            .map_err(|e| DaemonError::CompileFailure {
                module: job.module.clone(),
                diagnostic: format!("cannot run {program}: {e}"),
            })?;

        if !output.status.success() {
            return Err(DaemonError::CompileFailure {
                module: job.module.clone(),
                diagnostic: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        if !job.output.exists() {
            return Err(DaemonError::CompileFailure {
                module: job.module.clone(),
                diagnostic: format!("compiler produced no artifact at {}", job.output.display()),
            });
        }
        Ok(())
    }
}
