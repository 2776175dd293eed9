use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use super::argv::{self, ArgvError};
use super::catalog::{self, RawCommandRejected};
use super::operations::{self, Operation};

/// Engine entry points probed in order.
pub const ENGINE_CANDIDATES: &[&str] = &["magick", "convert"];

pub const INPUT_PLACEHOLDER: &str = "{input}";
pub const OUTPUT_PLACEHOLDER: &str = "{output}";

const PAGINATED_DENSITY: &str = "150";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompiledCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl CompiledCommand {
    pub fn display(&self) -> String {
        argv::render_display(std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineLimits {
    pub memory: String,
    pub time_secs: u64,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            memory: String::from("2GB"),
            time_secs: 180,
        }
    }
}

impl EngineLimits {
    fn tokens(&self) -> [String; 6] {
        [
            String::from("-limit"),
            String::from("memory"),
            self.memory.clone(),
            String::from("-limit"),
            String::from("time"),
            self.time_secs.to_string(),
        ]
    }
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("image engine not found (looked for magick, convert in {search_path})")]
    EngineUnavailable { search_path: String },
    #[error(transparent)]
    Rejected(#[from] RawCommandRejected),
    #[error("invalid command syntax: {0}")]
    Syntax(#[from] ArgvError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandPreview {
    pub command: String,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct CommandCompiler {
    limits: EngineLimits,
    search_path: String,
    entry_point: OnceLock<String>,
}

impl CommandCompiler {
    pub fn new(limits: EngineLimits, search_path: impl Into<String>) -> Self {
        Self {
            limits,
            search_path: search_path.into(),
            entry_point: OnceLock::new(),
        }
    }

    /// Pins the entry point instead of probing the search path.
    pub fn with_entry_point(self, program: impl Into<String>) -> Self {
        let _ = self.entry_point.set(program.into());
        self
    }

    pub fn limits(&self) -> &EngineLimits {
        &self.limits
    }

    /// Resolves the engine once per compiler. Failed probes are not cached so
    /// an engine installed later is picked up.
    pub fn entry_point(&self) -> Result<&str, CompileError> {
        if let Some(program) = self.entry_point.get() {
            return Ok(program.as_str());
        }
        let cwd = std::env::temp_dir();
        let found = ENGINE_CANDIDATES.iter().find(|candidate| {
            which::which_in(candidate, Some(self.search_path.as_str()), cwd.as_path()).is_ok()
        });
        match found {
            Some(candidate) => {
                debug!(engine = %candidate, "resolved image engine entry point");
                Ok(self.entry_point.get_or_init(|| candidate.to_string()).as_str())
            }
            None => Err(CompileError::EngineUnavailable {
                search_path: self.search_path.clone(),
            }),
        }
    }

    /// Compiles a structured pipeline. Names missing from the dispatch table
    /// are skipped.
    pub fn compile(
        &self,
        input: &Path,
        output: &Path,
        operations: &[Operation],
    ) -> Result<CompiledCommand, CompileError> {
        let program = self.entry_point()?.to_string();
        Ok(self.compile_with_program(program, input, output, operations))
    }

    fn compile_with_program(
        &self,
        program: String,
        input: &Path,
        output: &Path,
        operations: &[Operation],
    ) -> CompiledCommand {
        let mut args: Vec<String> = self.limits.tokens().into_iter().collect();

        let input_token = input.to_string_lossy().to_string();
        if catalog::is_paginated_input(input) {
            args.push(String::from("-density"));
            args.push(String::from(PAGINATED_DENSITY));
            args.push(format!("{input_token}[0]"));
            args.push(String::from("-flatten"));
        } else {
            args.push(input_token);
        }
        args.push(String::from("-auto-orient"));

        for op in operations {
            let name = catalog::normalize_operation_name(op.operation.as_str());
            match operations::lookup(name.as_str()) {
                Some(entry) => args.extend((entry.compile)(&op.params)),
                None => debug!(operation = %op.operation, "skipping operation outside the catalog"),
            }
        }

        args.push(output.to_string_lossy().to_string());
        CompiledCommand { program, args }
    }

    /// Validates raw engine text and splits it into argv. The blocklist runs
    /// on the text as written and again on every token once quotes and
    /// escapes are gone.
    pub fn check_raw(raw: &str) -> Result<Vec<String>, CompileError> {
        catalog::validate_raw_command(raw)?;
        let tokens = argv::split_raw_command(raw)?;
        catalog::validate_raw_tokens(&tokens)?;
        Ok(tokens)
    }

    /// Compiles raw engine text after blocklist validation. Placeholders are
    /// substituted inside tokens so each path stays a single argument, and the
    /// substituted tokens are scanned once more.
    pub fn compile_raw(
        &self,
        input: &Path,
        output: &Path,
        raw: &str,
    ) -> Result<CompiledCommand, CompileError> {
        let input_token = input.to_string_lossy();
        let output_token = output.to_string_lossy();
        let mut tokens: Vec<String> = Self::check_raw(raw)?
            .into_iter()
            .map(|token| {
                token
                    .replace(INPUT_PLACEHOLDER, input_token.as_ref())
                    .replace(OUTPUT_PLACEHOLDER, output_token.as_ref())
            })
            .collect();
        catalog::validate_raw_tokens(&tokens)?;

        let program = if ENGINE_CANDIDATES.contains(&tokens[0].as_str()) {
            tokens.remove(0)
        } else {
            self.entry_point()?.to_string()
        };

        let mut args: Vec<String> = self.limits.tokens().into_iter().collect();
        args.extend(tokens);
        Ok(CompiledCommand { program, args })
    }

    /// Renders the command a pipeline would run, using placeholder paths, and
    /// reports whether the rendered text passes the raw-command blocklist.
    pub fn preview(&self, operations: &[Operation], output_format: &str) -> CommandPreview {
        let program = self
            .entry_point()
            .map(str::to_string)
            .unwrap_or_else(|_| ENGINE_CANDIDATES[0].to_string());
        let output = PathBuf::from(format!("output.{}", output_format.to_ascii_lowercase()));
        let command = self
            .compile_with_program(program, Path::new("input.jpg"), output.as_path(), operations)
            .display();
        match catalog::validate_raw_command(command.as_str()) {
            Ok(()) => CommandPreview {
                command,
                valid: true,
                error: None,
            },
            Err(rejected) => CommandPreview {
                command,
                valid: false,
                error: Some(rejected.to_string()),
            },
        }
    }
}
