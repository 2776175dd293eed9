use std::path::Path;

use serde::Serialize;

use super::compiler::{CommandCompiler, CompileError, CompiledCommand};
use crate::sandbox::{CommandRunner, SandboxError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImageInfo {
    pub format: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub colorspace: Option<String>,
    pub depth: Option<String>,
    pub filesize: Option<String>,
}

/// `magick identify -verbose <file>` on version 7, plain `identify` on 6.
pub fn build_identify_command(entry_point: &str, path: &Path) -> CompiledCommand {
    let file = path.to_string_lossy().to_string();
    if entry_point == "magick" {
        CompiledCommand {
            program: String::from("magick"),
            args: vec![String::from("identify"), String::from("-verbose"), file],
        }
    } else {
        CompiledCommand {
            program: String::from("identify"),
            args: vec![String::from("-verbose"), file],
        }
    }
}

fn field_value(line: &str, key: &str) -> Option<String> {
    line.strip_prefix(key)
        .and_then(|rest| rest.strip_prefix(':'))
        .map(|rest| rest.trim().to_string())
}

fn parse_geometry(value: &str) -> Option<(u32, u32)> {
    let (width, rest) = value.split_once('x')?;
    let height: String = rest.chars().take_while(char::is_ascii_digit).collect();
    Some((width.trim().parse().ok()?, height.parse().ok()?))
}

pub fn parse_identify_verbose(stdout: &str) -> ImageInfo {
    let mut info = ImageInfo::default();
    for line in stdout.lines().map(str::trim) {
        if let Some(value) = field_value(line, "Format") {
            info.format = value.split_whitespace().next().map(str::to_string);
        } else if let Some(value) = field_value(line, "Geometry") {
            if let Some((width, height)) = parse_geometry(value.as_str()) {
                info.width = Some(width);
                info.height = Some(height);
            }
        } else if let Some(value) = field_value(line, "Colorspace") {
            info.colorspace = Some(value);
        } else if let Some(value) = field_value(line, "Depth") {
            info.depth = Some(value);
        } else if let Some(value) = field_value(line, "Filesize") {
            info.filesize = Some(value);
        }
    }
    info
}

#[derive(Debug, thiserror::Error)]
pub enum IdentifyError {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

/// Probes an image through the runner. A nonzero exit yields `None`.
pub async fn probe_image(
    compiler: &CommandCompiler,
    runner: &dyn CommandRunner,
    path: &Path,
) -> Result<Option<ImageInfo>, IdentifyError> {
    let command = build_identify_command(compiler.entry_point()?, path);
    let result = runner.run(&command).await?;
    if !result.success {
        return Ok(None);
    }
    Ok(Some(parse_identify_verbose(result.stdout.as_str())))
}
