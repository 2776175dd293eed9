use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArgvError {
    #[error("command is empty")]
    Empty,
    #[error("unterminated {0} quote in command")]
    UnterminatedQuote(char),
    #[error("dangling escape at end of command")]
    DanglingEscape,
}

/// Splits raw command text into argv tokens using POSIX-like quoting rules
/// (single quotes, double quotes, backslash escapes). No expansion of any
/// kind happens; the result is handed to the process spawner as-is.
pub fn split_raw_command(text: &str) -> Result<Vec<String>, ArgvError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = text.chars();

    while let Some(ch) = chars.next() {
        match ch {
            '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(inner) => current.push(inner),
                        None => return Err(ArgvError::UnterminatedQuote('\'')),
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped @ ('"' | '\\')) => current.push(escaped),
                            Some(other) => {
                                current.push('\\');
                                current.push(other);
                            }
                            None => return Err(ArgvError::UnterminatedQuote('"')),
                        },
                        Some(inner) => current.push(inner),
                        None => return Err(ArgvError::UnterminatedQuote('"')),
                    }
                }
            }
            '\\' => {
                in_token = true;
                match chars.next() {
                    Some(escaped) => current.push(escaped),
                    None => return Err(ArgvError::DanglingEscape),
                }
            }
            ws if ws.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            other => {
                in_token = true;
                current.push(other);
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    if tokens.is_empty() {
        return Err(ArgvError::Empty);
    }
    Ok(tokens)
}

fn is_shell_safe(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '@' | '%' | '+' | '=' | ':' | ',' | '.' | '/' | '-' | '_')
}

/// Quotes one token for display so the rendered line can be pasted into a
/// POSIX shell unchanged.
pub fn quote_for_display(token: &str) -> String {
    if token.is_empty() {
        return String::from("''");
    }
    if token.chars().all(is_shell_safe) {
        return token.to_string();
    }
    format!("'{}'", token.replace('\'', "'\"'\"'"))
}

pub fn render_display<I, S>(tokens: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tokens
        .into_iter()
        .map(|token| quote_for_display(token.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}
