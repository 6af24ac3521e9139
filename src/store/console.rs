//! Console output
//!
//! Writes one rendered line per item to a terminal (stdout by default).

use std::fmt;
use std::io::{self, Write};
use std::sync::Mutex;

use crossterm::style::{Color, Stylize};

use crate::config::{DEFAULT_CONSOLE_TEMPLATE, DEFAULT_CONSOLE_TIME_TEMPLATE};
use crate::item::{Level, LogItem};
use crate::template::Template;

use super::{Store, StoreError};

/// Settings for a [`ConsoleSink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleOptions {
    /// Color each line by level
    pub color: bool,
    /// Timestamp template, available to `template` as `{time}`
    pub time_template: String,
    /// Line template
    pub template: String,
}

impl Default for ConsoleOptions {
    fn default() -> Self {
        Self {
            color: true,
            time_template: DEFAULT_CONSOLE_TIME_TEMPLATE.to_string(),
            template: DEFAULT_CONSOLE_TEMPLATE.to_string(),
        }
    }
}

/// Synchronous console writer
pub struct ConsoleSink {
    time_template: Template,
    template: Template,
    color: bool,
    out: Mutex<Box<dyn Write + Send>>,
}

impl ConsoleSink {
    /// Console sink writing to stdout
    pub fn stdout(options: ConsoleOptions) -> Result<Self, StoreError> {
        Self::with_writer(options, Box::new(io::stdout()))
    }

    /// Console sink writing to any writer
    pub fn with_writer(
        options: ConsoleOptions,
        out: Box<dyn Write + Send>,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            time_template: Template::parse(&options.time_template)?,
            template: Template::parse(&options.template)?,
            color: options.color,
            out: Mutex::new(out),
        })
    }

    /// Rendered line for an item, without color or newline
    pub fn render_line(&self, item: &LogItem) -> String {
        let time = self.time_template.render(item);
        self.template.render_with_time(item, Some(&time))
    }
}

fn level_color(level: Level) -> Color {
    match level {
        Level::Debug => Color::DarkGrey,
        Level::Info => Color::Green,
        Level::Warn => Color::Yellow,
        Level::Error => Color::Red,
        Level::Fatal => Color::Magenta,
    }
}

impl fmt::Debug for ConsoleSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsoleSink")
            .field("template", &self.template.source())
            .field("color", &self.color)
            .finish_non_exhaustive()
    }
}

impl Store for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    fn store(&self, item: &LogItem) -> Result<(), StoreError> {
        let line = self.render_line(item);
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        let written = if self.color {
            writeln!(out, "{}", line.as_str().with(level_color(item.level)))
        } else {
            writeln!(out, "{}", line)
        };
        written.and_then(|()| out.flush()).map_err(StoreError::Console)
    }

    fn close(&self) -> Result<(), StoreError> {
        self.out
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .flush()
            .map_err(StoreError::Console)
    }
}
