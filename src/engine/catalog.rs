use std::path::Path;

use thiserror::Error;

use super::operations;

pub const ALLOWED_INPUT_FORMATS: &[&str] = &[
    "jpg", "jpeg", "png", "webp", "gif", "svg", "tiff", "tif", "pdf", "bmp", "ico", "heic",
    "heif", "avif", "psd",
];

pub const ALLOWED_OUTPUT_FORMATS: &[&str] = &[
    "jpg", "jpeg", "png", "webp", "gif", "avif", "tiff", "pdf", "bmp", "ico",
];

/// Input formats whose first page is rasterized before editing.
const PAGINATED_FORMATS: &[&str] = &["pdf"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockRule {
    AnyChar(&'static [char]),
    Substring(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockedPattern {
    label: &'static str,
    rule: BlockRule,
}

const fn substring(label: &'static str) -> BlockedPattern {
    BlockedPattern {
        label,
        rule: BlockRule::Substring(label),
    }
}

const BLOCKED_PATTERNS: &[BlockedPattern] = &[
    BlockedPattern {
        label: "[;&|`$]",
        rule: BlockRule::AnyChar(&[';', '&', '|', '`', '$']),
    },
    substring("../"),
    substring("ephemeral:"),
    substring("msl:"),
    substring("mvg:"),
    substring("url:"),
    substring("http:"),
    substring("https:"),
    substring("ftp:"),
    substring("label:"),
    substring("caption:"),
    substring("pango:"),
    substring("/dev/"),
    substring("/proc/"),
    substring("/etc/"),
    substring("\\x"),
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Blocked pattern detected: {pattern}")]
pub struct RawCommandRejected {
    pub pattern: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputFileError {
    #[error("Input file not found: {0}")]
    NotFound(String),
    #[error("Unsupported input format: {0}")]
    UnsupportedFormat(String),
}

fn find_blocked(text: &str) -> Option<&'static str> {
    let lowered = text.to_lowercase();
    BLOCKED_PATTERNS
        .iter()
        .find(|pattern| match pattern.rule {
            BlockRule::AnyChar(chars) => lowered.contains(chars),
            BlockRule::Substring(needle) => lowered.contains(needle),
        })
        .map(|pattern| pattern.label)
}

fn rejected(label: &str) -> RawCommandRejected {
    RawCommandRejected {
        pattern: label.to_string(),
    }
}

/// Rejects raw engine text containing any blocked pattern. Matching is
/// case-insensitive. This is a blocklist, so the sandbox environment is the
/// second line of defence for raw commands.
pub fn validate_raw_command(text: &str) -> Result<(), RawCommandRejected> {
    match find_blocked(text) {
        Some(label) => Err(rejected(label)),
        None => Ok(()),
    }
}

/// Same scan over argv tokens after quote removal, so `htt''ps:` or `.\./`
/// cannot reassemble a blocked pattern once the quoting is gone.
pub fn validate_raw_tokens<S: AsRef<str>>(tokens: &[S]) -> Result<(), RawCommandRejected> {
    match tokens.iter().find_map(|token| find_blocked(token.as_ref())) {
        Some(label) => Err(rejected(label)),
        None => Ok(()),
    }
}

pub fn normalize_operation_name(name: &str) -> String {
    name.trim().to_lowercase().replace('_', "-")
}

pub fn is_allowed_operation(name: &str) -> bool {
    operations::lookup(normalize_operation_name(name).as_str()).is_some()
}

pub fn allowed_operation_names() -> impl Iterator<Item = &'static str> {
    operations::DISPATCH_TABLE.iter().map(|entry| entry.name)
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
}

pub fn validate_input_file(path: &Path) -> Result<(), InputFileError> {
    if !path.is_file() {
        return Err(InputFileError::NotFound(path.display().to_string()));
    }
    match extension_of(path) {
        Some(ext) if ALLOWED_INPUT_FORMATS.contains(&ext.as_str()) => Ok(()),
        Some(ext) => Err(InputFileError::UnsupportedFormat(ext)),
        None => Err(InputFileError::UnsupportedFormat(String::from("(none)"))),
    }
}

pub fn is_allowed_output_format(format: &str) -> bool {
    ALLOWED_OUTPUT_FORMATS.contains(&format.trim().to_ascii_lowercase().as_str())
}

pub fn is_paginated_input(path: &Path) -> bool {
    extension_of(path).is_some_and(|ext| PAGINATED_FORMATS.contains(&ext.as_str()))
}

/// Keeps only the basename and replaces anything outside `[A-Za-z0-9_.-]`.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    base.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
