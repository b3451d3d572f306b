use std::{
    fmt::Write as _,
    sync::LazyLock,
    time::Instant,
};

use anyhow::Context as _;
use chrono::{
    DateTime,
    Local,
};

use crate::{
    consts,
    record::LogRecord,
};

/// Reference point for the `%t` elapsed-time specifier. Forced by the
/// facility when it is created so the reference lines up with process start.
static PROCESS_START: LazyLock<Instant> = LazyLock::new(Instant::now);

pub(crate) fn init_process_start() {
    LazyLock::force(&PROCESS_START);
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unknown format specifier %{0}")]
    UnknownSpecifier(char),
    #[error("unknown escape sequence \\{0}")]
    UnknownEscape(char),
    #[error("dangling % at end of format")]
    DanglingPercent,
    #[error("dangling \\ at end of format")]
    DanglingEscape,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    Literal(String),
    Tag,
    LevelName,
    PaddedLevelName,
    Message,
    SanitizedMessage,
    UserId,
    ProcessId,
    ProcessName,
    ThreadId,
    QueueLabel,
    Elapsed,
    Datetime,
    Errno,
    ErrnoString,
    Callstack,
}

fn parse_format(format: &str) -> Result<Vec<Token>, TemplateError> {
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        let token = match c {
            '%' => match chars.next().ok_or(TemplateError::DanglingPercent)? {
                'g' => Token::Tag,
                'l' => Token::LevelName,
                'L' => Token::PaddedLevelName,
                'm' => Token::Message,
                'M' => Token::SanitizedMessage,
                'u' => Token::UserId,
                'p' => Token::ProcessId,
                'P' => Token::ProcessName,
                'r' => Token::ThreadId,
                'q' => Token::QueueLabel,
                't' => Token::Elapsed,
                'd' => Token::Datetime,
                'e' => Token::Errno,
                'E' => Token::ErrnoString,
                'c' => Token::Callstack,
                other => return Err(TemplateError::UnknownSpecifier(other)),
            },
            '\\' => {
                let escaped = match chars.next().ok_or(TemplateError::DanglingEscape)? {
                    'n' => '\n',
                    'r' => '\r',
                    't' => '\t',
                    '%' => '%',
                    '\\' => '\\',
                    other => return Err(TemplateError::UnknownEscape(other)),
                };
                literal.push(escaped);
                continue;
            },
            other => {
                literal.push(other);
                continue;
            },
        };
        if !literal.is_empty() {
            tokens.push(Token::Literal(std::mem::take(&mut literal)));
        }
        tokens.push(token);
    }
    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }
    Ok(tokens)
}

/// Expands log records to text from a printf-style template. Each sink owns
/// its formatter; formatters are never shared between sinks.
#[derive(Clone, Debug)]
pub struct Formatter {
    tokens: Vec<Token>,
    datetime_format: String,
    tag_placeholder: String,
    queue_label_placeholder: String,
    callstack_header: String,
    callstack_footer: String,
    multilines_prefix: Option<String>,
    append_newline: bool,
}

impl Default for Formatter {
    fn default() -> Self {
        Self::new(consts::DEFAULT_FORMAT).expect("default format is a valid template")
    }
}

impl Formatter {
    pub fn new(format: &str) -> Result<Self, TemplateError> {
        Ok(Self {
            tokens: parse_format(format)?,
            datetime_format: consts::DEFAULT_DATETIME_FORMAT.to_owned(),
            tag_placeholder: consts::DEFAULT_TAG_PLACEHOLDER.to_owned(),
            queue_label_placeholder: consts::DEFAULT_QUEUE_LABEL_PLACEHOLDER.to_owned(),
            callstack_header: consts::DEFAULT_CALLSTACK_HEADER.to_owned(),
            callstack_footer: String::new(),
            multilines_prefix: None,
            append_newline: true,
        })
    }

    pub fn with_format(mut self, format: &str) -> Result<Self, TemplateError> {
        self.tokens = parse_format(format)?;
        Ok(self)
    }

    pub fn with_datetime_format(mut self, format: impl Into<String>) -> Self {
        self.datetime_format = format.into();
        self
    }

    pub fn with_tag_placeholder(mut self, placeholder: impl Into<String>) -> Self {
        self.tag_placeholder = placeholder.into();
        self
    }

    pub fn with_queue_label_placeholder(mut self, placeholder: impl Into<String>) -> Self {
        self.queue_label_placeholder = placeholder.into();
        self
    }

    pub fn with_callstack_header(mut self, header: impl Into<String>) -> Self {
        self.callstack_header = header.into();
        self
    }

    pub fn with_callstack_footer(mut self, footer: impl Into<String>) -> Self {
        self.callstack_footer = footer.into();
        self
    }

    pub fn with_multilines_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.multilines_prefix = Some(prefix.into());
        self
    }

    pub fn with_append_newline(mut self, append: bool) -> Self {
        self.append_newline = append;
        self
    }

    pub fn format(&self, record: &LogRecord) -> anyhow::Result<String> {
        let mut out = String::new();
        for token in &self.tokens {
            match token {
                Token::Literal(text) => out.push_str(text),
                Token::Tag => match &record.tag {
                    Some(tag) if !tag.is_empty() => out.push_str(tag),
                    _ => out.push_str(&self.tag_placeholder),
                },
                Token::LevelName => out.push_str(record.level.name()),
                Token::PaddedLevelName => out.push_str(record.level.padded_name()),
                Token::Message => out.push_str(&record.message),
                Token::SanitizedMessage => out.push_str(&sanitize_newlines(&record.message)),
                Token::UserId => write!(out, "{}", current_user_id())?,
                Token::ProcessId => write!(out, "{}", std::process::id())?,
                Token::ProcessName => out.push_str(&process_name()),
                Token::ThreadId => write!(out, "{}", record.captured_thread_id)?,
                Token::QueueLabel => match &record.captured_queue_label {
                    Some(label) if !label.is_empty() => out.push_str(label),
                    _ => out.push_str(&self.queue_label_placeholder),
                },
                Token::Elapsed => {
                    let elapsed = PROCESS_START.elapsed();
                    let total_secs = elapsed.as_secs();
                    write!(
                        out,
                        "{:02}:{:02}:{:02}.{:03}",
                        total_secs / 3600,
                        (total_secs / 60) % 60,
                        total_secs % 60,
                        elapsed.subsec_millis()
                    )?;
                },
                Token::Datetime => {
                    let secs = record.absolute_time.floor() as i64;
                    let nanos = ((record.absolute_time - secs as f64) * 1e9) as u32;
                    let datetime = DateTime::from_timestamp(secs, nanos)
                        .context("record timestamp out of range")?
                        .with_timezone(&Local);
                    write!(out, "{}", datetime.format(&self.datetime_format))
                        .map_err(|_| anyhow::anyhow!("invalid datetime format"))?;
                },
                Token::Errno => write!(out, "{}", record.captured_errno)?,
                Token::ErrnoString => {
                    let error = std::io::Error::from_raw_os_error(record.captured_errno);
                    write!(out, "{error}")?;
                },
                Token::Callstack => {
                    if let Some(callstack) = &record.callstack {
                        out.push_str(&self.callstack_header);
                        out.push_str(&callstack.join("\n"));
                        out.push_str(&self.callstack_footer);
                    }
                },
            }
        }
        if let Some(prefix) = &self.multilines_prefix {
            let replacement = format!("\n{prefix}");
            out = out.replace('\n', &replacement);
        }
        if self.append_newline {
            out.push('\n');
        }
        Ok(out)
    }
}

fn sanitize_newlines(message: &str) -> String {
    message.replace("\r\n", "\n").replace('\r', "\n")
}

#[cfg(unix)]
fn current_user_id() -> u32 {
    unsafe { libc::getuid() }
}

#[cfg(not(unix))]
fn current_user_id() -> u32 {
    0
}

fn process_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|path| path.file_name().map(|name| name.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "(unknown)".to_owned())
}
