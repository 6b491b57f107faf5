//! Out-of-band log forwarding: the helper's log events travel to the client
//! as [`Frame::Log`](crate::wire::Frame::Log) frames and are re-emitted
//! locally through a [`LogSink`].
//!
//! The original forwards a whole `logging.LogRecord.__dict__` and
//! reconstructs it on the other end with `logging.makeLogRecord`. `tracing`
//! has no equivalent "replay an arbitrary record" API — its callsites are
//! static — so [`LogRecord`] instead carries just enough structure (level,
//! target, rendered message, extra fields) to be re-emitted as a fresh
//! `tracing` event on the client, which is the closest idiomatic match.

use std::collections::BTreeMap;

use rmpv::Value;
use tracing::Level;
use tracing::field::{Field, Visit};

use crate::error::PrivsepError;

/// A captured log event, ready to cross the wire.
#[derive(Clone, Debug, Default)]
pub struct LogRecord {
    pub level: LevelOrDefault,
    pub target: String,
    pub message: String,
    pub fields: BTreeMap<String, String>,
    /// Mirrors the upstream's `record.processName = str(context)`: the
    /// originating context's string form, empty if none was supplied.
    pub process_name: String,
    /// Mirrors the upstream's `exc_text`: set when the event carries an
    /// `error` field, formatted from that field's value.
    pub exc_text: Option<String>,
}

/// `tracing::Level` doesn't implement `Default`; this newtype gives
/// [`LogRecord`] one (defaulting to `INFO`, matching Python's `logging`
/// module default).
#[derive(Clone, Copy, Debug)]
pub struct LevelOrDefault(pub Level);

impl Default for LevelOrDefault {
    fn default() -> Self {
        LevelOrDefault(Level::INFO)
    }
}

impl std::ops::Deref for LevelOrDefault {
    type Target = Level;
    fn deref(&self) -> &Level {
        &self.0
    }
}

fn level_to_u8(level: Level) -> u8 {
    match level {
        Level::ERROR => 0,
        Level::WARN => 1,
        Level::INFO => 2,
        Level::DEBUG => 3,
        Level::TRACE => 4,
    }
}

fn level_from_u8(tag: u8) -> Level {
    match tag {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        3 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

impl LogRecord {
    pub fn new(level: Level, target: impl Into<String>, message: impl Into<String>) -> Self {
        LogRecord {
            level: LevelOrDefault(level),
            target: target.into(),
            message: message.into(),
            fields: BTreeMap::new(),
            process_name: String::new(),
            exc_text: None,
        }
    }

    pub(crate) fn to_value(&self) -> Value {
        let fields = Value::Map(
            self.fields
                .iter()
                .map(|(k, v)| (Value::from(k.as_str()), Value::from(v.as_str())))
                .collect(),
        );
        let mut entries = vec![
            (Value::from("level"), Value::from(level_to_u8(self.level.0))),
            (Value::from("target"), Value::from(self.target.as_str())),
            (Value::from("message"), Value::from(self.message.as_str())),
            (Value::from("fields"), fields),
            (Value::from("processName"), Value::from(self.process_name.as_str())),
        ];
        if let Some(exc_text) = &self.exc_text {
            entries.push((Value::from("exc_text"), Value::from(exc_text.as_str())));
        }
        Value::Map(entries)
    }

    pub(crate) fn from_value(value: Value) -> Result<Self, PrivsepError> {
        let map = match value {
            Value::Map(pairs) => pairs,
            other => {
                return Err(PrivsepError::Protocol {
                    detail: format!("log record must be a map, got {other:?}"),
                });
            }
        };
        let mut level = Level::INFO;
        let mut target = String::new();
        let mut message = String::new();
        let mut fields = BTreeMap::new();
        let mut process_name = String::new();
        let mut exc_text = None;

        for (key, val) in map {
            let Some(key) = key.as_str() else { continue };
            match key {
                "level" => {
                    if let Some(tag) = val.as_u64() {
                        level = level_from_u8(tag as u8);
                    }
                }
                "target" => {
                    target = val.as_str().unwrap_or_default().to_owned();
                }
                "message" => {
                    message = val.as_str().unwrap_or_default().to_owned();
                }
                "fields" => {
                    if let Value::Map(pairs) = val {
                        for (k, v) in pairs {
                            if let (Some(k), Some(v)) = (k.as_str(), v.as_str()) {
                                fields.insert(k.to_owned(), v.to_owned());
                            }
                        }
                    }
                }
                "processName" => {
                    process_name = val.as_str().unwrap_or_default().to_owned();
                }
                "exc_text" => {
                    exc_text = val.as_str().map(str::to_owned);
                }
                _ => {}
            }
        }

        Ok(LogRecord {
            level: LevelOrDefault(level),
            target,
            message,
            fields,
            process_name,
            exc_text,
        })
    }
}

/// Where a [`LogRecord`] forwarded from the helper ends up on the client
/// side. The default implementation re-enters `tracing`; applications that
/// want to route privileged-process logs elsewhere (a file, a separate
/// subscriber) can provide their own.
pub trait LogSink: Send + Sync {
    fn accept(&self, record: LogRecord);
}

/// Re-emits forwarded records through the ambient `tracing` subscriber.
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn accept(&self, record: LogRecord) {
        let fields = render_fields(&record.fields);
        let exc_text = record.exc_text.as_deref().unwrap_or("");
        match *record.level {
            Level::ERROR => tracing::error!(target: "privsep::helper", helper_target = %record.target, process_name = %record.process_name, exc_text = %exc_text, "{}{}", record.message, fields),
            Level::WARN => tracing::warn!(target: "privsep::helper", helper_target = %record.target, process_name = %record.process_name, exc_text = %exc_text, "{}{}", record.message, fields),
            Level::INFO => tracing::info!(target: "privsep::helper", helper_target = %record.target, process_name = %record.process_name, exc_text = %exc_text, "{}{}", record.message, fields),
            Level::DEBUG => tracing::debug!(target: "privsep::helper", helper_target = %record.target, process_name = %record.process_name, exc_text = %exc_text, "{}{}", record.message, fields),
            Level::TRACE => tracing::trace!(target: "privsep::helper", helper_target = %record.target, process_name = %record.process_name, exc_text = %exc_text, "{}{}", record.message, fields),
        }
    }
}

fn render_fields(fields: &BTreeMap<String, String>) -> String {
    if fields.is_empty() {
        return String::new();
    }
    let mut out = String::from(" (");
    for (i, (k, v)) in fields.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(k);
        out.push('=');
        out.push_str(v);
    }
    out.push(')');
    out
}

/// A `tracing_subscriber::Layer` visitor that collects one event's fields
/// into a [`LogRecord`]. The `message` field (the implicit `"{}"` argument
/// of `tracing::info!("...")` and friends) is pulled out separately; the
/// rest are stringified into `fields`.
#[derive(Default)]
pub(crate) struct RecordVisitor {
    pub message: String,
    pub fields: BTreeMap<String, String>,
    /// Set when the event carries a field named `error` or `exception`,
    /// mirroring `exc_text` being derived from `record.exc_info` upstream.
    pub exc_text: Option<String>,
}

impl RecordVisitor {
    fn is_exception_field(name: &str) -> bool {
        name == "error" || name == "exception"
    }
}

impl Visit for RecordVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else if Self::is_exception_field(field.name()) {
            self.exc_text = Some(format!("{value:?}"));
        } else {
            self.fields.insert(field.name().to_owned(), format!("{value:?}"));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_owned();
        } else if Self::is_exception_field(field.name()) {
            self.exc_text = Some(value.to_owned());
        } else {
            self.fields.insert(field.name().to_owned(), value.to_owned());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_record_round_trips_through_value() {
        let mut record = LogRecord::new(Level::WARN, "demo::worker", "disk getting full");
        record.fields.insert("free_bytes".to_owned(), "1024".to_owned());
        record.process_name = "Context(prefix=demo::priv)".to_owned();
        record.exc_text = Some("IOError".to_owned());

        let value = record.to_value();
        let back = LogRecord::from_value(value).unwrap();

        assert_eq!(*back.level, Level::WARN);
        assert_eq!(back.target, "demo::worker");
        assert_eq!(back.message, "disk getting full");
        assert_eq!(back.fields.get("free_bytes").map(String::as_str), Some("1024"));
        assert_eq!(back.process_name, "Context(prefix=demo::priv)");
        assert_eq!(back.exc_text.as_deref(), Some("IOError"));
    }

    #[test]
    fn unset_level_defaults_to_info() {
        assert_eq!(*LevelOrDefault::default(), Level::INFO);
    }

    #[test]
    fn record_visitor_exposes_exc_text_when_unset() {
        let visitor = RecordVisitor::default();
        assert_eq!(visitor.exc_text, None);
    }
}
