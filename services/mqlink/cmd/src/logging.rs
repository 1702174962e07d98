//! Console log format for the mqlink binary.
//!
//! Every line reads `[timestamp] [component] [level] message`. Events may
//! carry a `component` field (see the `component_*` macros) which replaces
//! the default component column.

use std::fmt;
use std::io::IsTerminal;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

const COMPONENT_WIDTH: usize = 16;
const LEVEL_WIDTH: usize = 5;

/// Log an info event tagged with a component
#[macro_export]
macro_rules! component_info {
    ($component:expr, $($arg:tt)*) => {
        tracing::info!(component = $component, $($arg)*)
    };
}

/// Log a warning tagged with a component
#[macro_export]
macro_rules! component_warn {
    ($component:expr, $($arg:tt)*) => {
        tracing::warn!(component = $component, $($arg)*)
    };
}

/// Log a debug event tagged with a component
#[macro_export]
macro_rules! component_debug {
    ($component:expr, $($arg:tt)*) => {
        tracing::debug!(component = $component, $($arg)*)
    };
}

/// Log an error tagged with a component
#[macro_export]
macro_rules! component_error {
    ($component:expr, $($arg:tt)*) => {
        tracing::error!(component = $component, $($arg)*)
    };
}

/// Event formatter for console output
pub struct MqlinkLogFormatter {
    name: String,
    color_enabled: bool,
}

impl MqlinkLogFormatter {
    /// Formatter using `name` as the default component column
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color_enabled: color_supported(),
        }
    }

    fn component_column(&self, component: Option<&str>) -> String {
        let name = match component {
            Some(component) => format!("{}-{}", self.name, component),
            None => self.name.clone(),
        };

        if name.chars().count() > COMPONENT_WIDTH {
            let truncated: String = name.chars().take(COMPONENT_WIDTH - 1).collect();
            format!("{}…", truncated)
        } else {
            format!("{:<width$}", name, width = COMPONENT_WIDTH)
        }
    }

    fn level_color(&self, level: &Level) -> &'static str {
        if !self.color_enabled {
            return "";
        }

        match *level {
            Level::ERROR => COLOR_BRIGHT_RED,
            Level::WARN => COLOR_BRIGHT_YELLOW,
            Level::INFO => COLOR_GREEN,
            Level::DEBUG | Level::TRACE => COLOR_BRIGHT_GRAY,
        }
    }
}

impl<S, N> FormatEvent<S, N> for MqlinkLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let level = event.metadata().level();

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let (cyan, reset) = if self.color_enabled {
            (COLOR_CYAN, COLOR_RESET)
        } else {
            ("", "")
        };

        write!(
            writer,
            "{}[{}] [{}] [{}{:<width$}{}] ",
            cyan,
            timestamp,
            self.component_column(visitor.component.as_deref()),
            self.level_color(level),
            level.as_str(),
            reset,
            width = LEVEL_WIDTH
        )?;

        write!(writer, "{}", visitor.message)?;
        for (name, value) in &visitor.fields {
            write!(writer, " {}={}", name, value)?;
        }
        writeln!(writer, "{}", reset)
    }
}

/// Collects the message, the component tag and any other fields
#[derive(Default)]
struct FieldVisitor {
    message: String,
    component: Option<String>,
    fields: Vec<(&'static str, String)>,
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        let text = format!("{:?}", value);
        let text = text
            .strip_prefix('"')
            .and_then(|inner| inner.strip_suffix('"'))
            .map(str::to_string)
            .unwrap_or(text);
        self.record_text(field, text);
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.record_text(field, value.to_string());
    }
}

impl FieldVisitor {
    fn record_text(&mut self, field: &tracing::field::Field, text: String) {
        match field.name() {
            "message" => self.message = text,
            "component" => self.component = Some(text),
            name => self.fields.push((name, text)),
        }
    }
}

/// Colors only on an interactive terminal that is not `TERM=dumb`
fn color_supported() -> bool {
    std::env::var("TERM").map_or(false, |term| term != "dumb") && std::io::stderr().is_terminal()
}
