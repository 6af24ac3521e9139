//! Name and message templates
//!
//! A template turns a [`LogItem`] into a string. Stores use them for file
//! names, sub-directories, database/collection names and output lines.
//!
//! Placeholders are written `{key}` or `{key:format}`; `{{` and `}}` produce
//! literal braces. Supported keys:
//!
//! - `id`, `tag`, `message`
//! - `level` (`INFO`), `level_lower` (`info`), `level_short` (`I`)
//! - `date` (`%Y%m%d` unless a chrono format is given)
//! - `time` (with a chrono format: the item time; without one: the
//!   pre-rendered timestamp when available, RFC 3339 otherwise)
//! - `field.<name>` (a structured field; strings unquoted, missing fields empty)

use std::fmt::{self, Write as _};
use std::str::FromStr;

use chrono::format::{Item, StrftimeItems};
use serde_json::Value;

use crate::item::LogItem;

const DEFAULT_DATE_FORMAT: &str = "%Y%m%d";

/// Errors raised while parsing a template
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("unclosed placeholder starting at byte {position}")]
    UnclosedPlaceholder { position: usize },

    #[error("unmatched '}}' at byte {position}")]
    UnmatchedBrace { position: usize },

    #[error("empty placeholder at byte {position}")]
    EmptyPlaceholder { position: usize },

    #[error("unknown template key: {key}")]
    UnknownKey { key: String },

    #[error("key '{key}' does not take a format")]
    UnexpectedFormat { key: String },

    #[error("invalid time format: {format}")]
    InvalidTimeFormat { format: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Key {
    Id,
    Tag,
    Message,
    Level,
    LevelLower,
    LevelShort,
    Date(Option<String>),
    Time(Option<String>),
    Field(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(Key),
}

/// A parsed template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    /// Parse a template, validating every placeholder
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.char_indices().peekable();

        while let Some((pos, c)) = chars.next() {
            match c {
                '{' => {
                    if matches!(chars.peek(), Some((_, '{'))) {
                        chars.next();
                        literal.push('{');
                        continue;
                    }

                    let mut inner = String::new();
                    let mut closed = false;
                    for (_, c) in chars.by_ref() {
                        match c {
                            '}' => {
                                closed = true;
                                break;
                            }
                            '{' => return Err(TemplateError::UnclosedPlaceholder { position: pos }),
                            _ => inner.push(c),
                        }
                    }
                    if !closed {
                        return Err(TemplateError::UnclosedPlaceholder { position: pos });
                    }

                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Placeholder(parse_key(&inner, pos)?));
                }
                '}' => {
                    if matches!(chars.peek(), Some((_, '}'))) {
                        chars.next();
                        literal.push('}');
                    } else {
                        return Err(TemplateError::UnmatchedBrace { position: pos });
                    }
                }
                _ => literal.push(c),
            }
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// Template text as parsed
    pub fn source(&self) -> &str {
        &self.source
    }

    /// True when the template always renders an empty string
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Render the template for an item
    pub fn render(&self, item: &LogItem) -> String {
        self.render_with_time(item, None)
    }

    /// Render the template, substituting `time` with an already rendered
    /// timestamp for `{time}` placeholders without a format
    pub fn render_with_time(&self, item: &LogItem, time: Option<&str>) -> String {
        let mut out = String::with_capacity(self.source.len() + item.message.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(key) => render_key(&mut out, key, item, time),
            }
        }
        out
    }
}

impl FromStr for Template {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Template::parse(s)
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn parse_key(inner: &str, position: usize) -> Result<Key, TemplateError> {
    let (name, format) = match inner.split_once(':') {
        Some((name, format)) => (name.trim(), Some(format)),
        None => (inner.trim(), None),
    };

    if name.is_empty() {
        return Err(TemplateError::EmptyPlaceholder { position });
    }

    let key = match name {
        "time" => return Ok(Key::Time(format.map(validate_time_format).transpose()?)),
        "date" => return Ok(Key::Date(format.map(validate_time_format).transpose()?)),
        "id" => Key::Id,
        "tag" => Key::Tag,
        "message" => Key::Message,
        "level" => Key::Level,
        "level_lower" => Key::LevelLower,
        "level_short" => Key::LevelShort,
        other => match other.strip_prefix("field.") {
            Some(field) if !field.is_empty() => Key::Field(field.to_string()),
            _ => {
                return Err(TemplateError::UnknownKey {
                    key: other.to_string(),
                })
            }
        },
    };

    if format.is_some() {
        return Err(TemplateError::UnexpectedFormat {
            key: name.to_string(),
        });
    }
    Ok(key)
}

fn validate_time_format(format: &str) -> Result<String, TemplateError> {
    if format.is_empty() || StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return Err(TemplateError::InvalidTimeFormat {
            format: format.to_string(),
        });
    }
    Ok(format.to_string())
}

fn render_key(out: &mut String, key: &Key, item: &LogItem, time: Option<&str>) {
    // Writing into a String cannot fail; formats were validated at parse time
    match key {
        Key::Id => {
            let _ = write!(out, "{}", item.id);
        }
        Key::Tag => out.push_str(&item.tag),
        Key::Message => out.push_str(&item.message),
        Key::Level => out.push_str(item.level.as_str()),
        Key::LevelLower => out.push_str(item.level.as_lower_str()),
        Key::LevelShort => out.push_str(item.level.as_short()),
        Key::Date(format) => {
            let format = format.as_deref().unwrap_or(DEFAULT_DATE_FORMAT);
            let _ = write!(out, "{}", item.time.format(format));
        }
        Key::Time(Some(format)) => {
            let _ = write!(out, "{}", item.time.format(format));
        }
        Key::Time(None) => match time {
            Some(rendered) => out.push_str(rendered),
            None => out.push_str(&item.time.to_rfc3339()),
        },
        Key::Field(name) => match item.fields.get(name) {
            Some(Value::String(s)) => out.push_str(s),
            Some(Value::Null) | None => {}
            Some(other) => {
                let _ = write!(out, "{}", other);
            }
        },
    }
}
