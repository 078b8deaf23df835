//! Oracle-authored action programs: a validated sequence of primitive calls.
//!
//! A program is plain text, one call per non-empty line, each line a JSON
//! array with the primitive name first and its arguments following
//! positionally, never by name:
//!
//! ```text
//! ["input_text", 4, "rust web automation", true, "Type the search query"]
//! ["click", 7, "Press the search button"]
//! ```
//!
//! The closed set of primitives below is interpreted directly; nothing in
//! a program is ever executed as code, so no sandboxing is involved. The
//! literal source line is retained for error attribution.

use std::fmt;
use std::str::FromStr;

use serde_json::{Map, Value};

use crate::{Error, Result};

/// Scroll direction for the `scroll` primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollDirection {
    Up,
    Down,
}

impl FromStr for ScrollDirection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "up" => Ok(ScrollDirection::Up),
            "down" => Ok(ScrollDirection::Down),
            other => Err(Error::Program(format!(
                "direction must be either 'up' or 'down', got '{other}'"
            ))),
        }
    }
}

impl fmt::Display for ScrollDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScrollDirection::Up => f.write_str("up"),
            ScrollDirection::Down => f.write_str("down"),
        }
    }
}

/// One primitive invocation.
#[derive(Debug, Clone)]
pub enum Call {
    Click {
        id: u32,
        log_message: String,
        force: bool,
    },
    InputText {
        id: u32,
        text: String,
        clear_before_input: bool,
        log_message: String,
    },
    UploadFiles {
        id: u32,
        files: Vec<String>,
        log_message: String,
    },
    Scroll {
        direction: ScrollDirection,
        log_message: String,
    },
    ComboboxSelect {
        id: u32,
        option: String,
        log_message: String,
    },
    Finish {
        did_succeed: bool,
        output: Map<String, Value>,
        reason: String,
    },
}

impl Call {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Click { .. } => "click",
            Self::InputText { .. } => "input_text",
            Self::UploadFiles { .. } => "upload_files",
            Self::Scroll { .. } => "scroll",
            Self::ComboboxSelect { .. } => "combobox_select",
            Self::Finish { .. } => "finish",
        }
    }

    /// Whether this call ends the task.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finish { .. })
    }
}

/// A parsed call together with its literal source line.
#[derive(Debug, Clone)]
pub struct Line {
    /// 1-based line number in the program source.
    pub number: usize,
    /// The literal source text of this line.
    pub source: String,
    pub call: Call,
}

/// A validated sequence of primitive calls for one step.
#[derive(Debug, Clone)]
pub struct ActionProgram {
    lines: Vec<Line>,
}

impl ActionProgram {
    /// Parse and validate program text. Blank lines and `#` comment lines
    /// are skipped. Nothing is permitted after a `finish` call.
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = Vec::new();
        let mut finished_at: Option<usize> = None;

        for (idx, raw) in text.lines().enumerate() {
            let number = idx + 1;
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if let Some(at) = finished_at {
                return Err(Error::Program(format!(
                    "line {number}: nothing is permitted after the finish call on line {at}"
                )));
            }
            let call = parse_call(trimmed)
                .map_err(|e| Error::Program(format!("line {number}: {e}")))?;
            if call.is_terminal() {
                finished_at = Some(number);
            }
            lines.push(Line {
                number,
                source: raw.to_string(),
                call,
            });
        }

        if lines.is_empty() {
            return Err(Error::Program("program contains no calls".into()));
        }
        Ok(Self { lines })
    }

    /// Build a program from already-structured calls (used by scripted
    /// oracles and tests); the rendered JSON form becomes the source line.
    pub fn from_calls(calls: Vec<Call>) -> Result<Self> {
        let text = calls
            .iter()
            .map(render_call)
            .collect::<Vec<_>>()
            .join("\n");
        Self::parse(&text)
    }

    pub fn lines(&self) -> &[Line] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

fn render_call(call: &Call) -> String {
    let array = match call {
        Call::Click {
            id,
            log_message,
            force,
        } => {
            if *force {
                serde_json::json!(["click", id, log_message, force])
            } else {
                serde_json::json!(["click", id, log_message])
            }
        }
        Call::InputText {
            id,
            text,
            clear_before_input,
            log_message,
        } => serde_json::json!(["input_text", id, text, clear_before_input, log_message]),
        Call::UploadFiles {
            id,
            files,
            log_message,
        } => serde_json::json!(["upload_files", id, files, log_message]),
        Call::Scroll {
            direction,
            log_message,
        } => serde_json::json!(["scroll", direction.to_string(), log_message]),
        Call::ComboboxSelect {
            id,
            option,
            log_message,
        } => serde_json::json!(["combobox_select", id, option, log_message]),
        Call::Finish {
            did_succeed,
            output,
            reason,
        } => serde_json::json!(["finish", did_succeed, output, reason]),
    };
    array.to_string()
}

fn parse_call(line: &str) -> Result<Call> {
    let values: Vec<Value> = serde_json::from_str(line)
        .map_err(|e| Error::Program(format!("not a JSON call array: {e}")))?;
    let mut args = Args::new(&values)?;
    let name = args.str("primitive name")?;

    let call = match name.as_str() {
        "click" => Call::Click {
            id: args.id()?,
            log_message: args.str("log_message")?,
            force: args.opt_bool()?.unwrap_or(false),
        },
        "input_text" => Call::InputText {
            id: args.id()?,
            text: args.str("text")?,
            clear_before_input: args.bool("clear_before_input")?,
            log_message: args.str("log_message")?,
        },
        "upload_files" => Call::UploadFiles {
            id: args.id()?,
            files: args.str_list("files")?,
            log_message: args.str("log_message")?,
        },
        "scroll" => Call::Scroll {
            direction: args.str("direction")?.parse()?,
            log_message: args.str("log_message")?,
        },
        "combobox_select" => Call::ComboboxSelect {
            id: args.id()?,
            option: args.str("option")?,
            log_message: args.str("log_message")?,
        },
        "finish" => Call::Finish {
            did_succeed: args.bool("did_succeed")?,
            output: args.object("output")?,
            reason: args.str("reason")?,
        },
        other => {
            return Err(Error::Program(format!("unknown primitive '{other}'")));
        }
    };
    args.done(call.name())?;
    Ok(call)
}

/// Positional argument cursor over one call array.
struct Args<'a> {
    values: &'a [Value],
    next: usize,
}

impl<'a> Args<'a> {
    fn new(values: &'a [Value]) -> Result<Self> {
        if values.is_empty() {
            return Err(Error::Program("empty call array".into()));
        }
        Ok(Self { values, next: 0 })
    }

    fn take(&mut self, what: &str) -> Result<&'a Value> {
        let value = self
            .values
            .get(self.next)
            .ok_or_else(|| Error::Program(format!("missing argument: {what}")))?;
        self.next += 1;
        Ok(value)
    }

    fn str(&mut self, what: &str) -> Result<String> {
        let value = self.take(what)?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Program(format!("{what} must be a string, got {value}")))
    }

    fn id(&mut self) -> Result<u32> {
        let value = self.take("id")?;
        value
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| Error::Program(format!("id must be a small integer, got {value}")))
    }

    fn bool(&mut self, what: &str) -> Result<bool> {
        let value = self.take(what)?;
        value
            .as_bool()
            .ok_or_else(|| Error::Program(format!("{what} must be a boolean, got {value}")))
    }

    fn opt_bool(&mut self) -> Result<Option<bool>> {
        if self.next >= self.values.len() {
            return Ok(None);
        }
        self.bool("force").map(Some)
    }

    fn str_list(&mut self, what: &str) -> Result<Vec<String>> {
        let value = self.take(what)?;
        let items = value
            .as_array()
            .ok_or_else(|| Error::Program(format!("{what} must be an array of strings")))?;
        items
            .iter()
            .map(|v| {
                v.as_str().map(str::to_string).ok_or_else(|| {
                    Error::Program(format!("{what} must contain only strings, got {v}"))
                })
            })
            .collect()
    }

    fn object(&mut self, what: &str) -> Result<Map<String, Value>> {
        let value = self.take(what)?;
        value
            .as_object()
            .cloned()
            .ok_or_else(|| Error::Program(format!("{what} must be an object, got {value}")))
    }

    fn done(&mut self, name: &str) -> Result<()> {
        if self.next < self.values.len() {
            return Err(Error::Program(format!(
                "too many arguments for {name}: expected {}, got {}",
                self.next - 1,
                self.values.len() - 1
            )));
        }
        Ok(())
    }
}
