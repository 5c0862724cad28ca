use std::fmt;
use std::io::IsTerminal;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const RESET: &str = "\x1b[0m";
const CYAN: &str = "\x1b[36m";

/// Service column when an event names no component
const SERVICE: &str = "cm";
const SERVICE_WIDTH: usize = 16;
const LEVEL_WIDTH: usize = 9;

/// `[timestamp] [cm-component] [level] message`
pub struct CmLogFormatter {
    color: bool,
}

impl CmLogFormatter {
    pub fn new() -> Self {
        Self { color: colors_wanted() }
    }

    fn service_column(component: Option<&str>) -> String {
        let name = component.map_or_else(|| SERVICE.to_string(), |c| format!("{}-{}", SERVICE, c));
        if name.chars().count() <= SERVICE_WIDTH {
            return format!("{:<width$}", name, width = SERVICE_WIDTH);
        }
        let mut truncated: String = name.chars().take(SERVICE_WIDTH - 1).collect();
        truncated.push('…');
        truncated
    }

    /// Icon label and ANSI colour of a level
    fn level_style(level: &Level) -> (&'static str, &'static str) {
        match *level {
            Level::ERROR => ("✗ ERROR", "\x1b[91m"),
            Level::WARN => ("⚠ WARN", "\x1b[93m"),
            Level::INFO => ("ℹ INFO", "\x1b[32m"),
            Level::DEBUG => ("◦ DEBUG", "\x1b[90m"),
            Level::TRACE => ("◦ TRACE", "\x1b[90m"),
        }
    }

    fn paint(&self, code: &'static str) -> &'static str {
        if self.color {
            code
        } else {
            ""
        }
    }
}

impl<S, N> FormatEvent<S, N> for CmLogFormatter
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
        let mut fields = EventFields::default();
        event.record(&mut fields);

        let (label, level_color) = Self::level_style(event.metadata().level());
        write!(
            writer,
            "{}[{}] [{}] [{}{:<width$}{}] ",
            self.paint(CYAN),
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            Self::service_column(fields.component.as_deref()),
            self.paint(level_color),
            label,
            self.paint(RESET),
            width = LEVEL_WIDTH
        )?;
        writeln!(writer, "{}{}", fields.message, self.paint(RESET))
    }
}

/// The `message` and optional `component` of an event
#[derive(Default)]
struct EventFields {
    message: String,
    component: Option<String>,
}

impl EventFields {
    fn set(&mut self, name: &str, value: String) {
        match name {
            "message" => self.message = value,
            "component" => self.component = Some(value),
            _ => {}
        }
    }
}

impl tracing::field::Visit for EventFields {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        let rendered = format!("{:?}", value);
        let unquoted = rendered
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .map(str::to_string)
            .unwrap_or(rendered);
        self.set(field.name(), unquoted);
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.set(field.name(), value.to_string());
    }
}

fn colors_wanted() -> bool {
    std::env::var("TERM").map_or(true, |term| term != "dumb") && std::io::stdout().is_terminal()
}
