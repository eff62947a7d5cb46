//! Structured audit events.
//!
//! Every pipeline stage reports through a [`DebugCollector`] handed to it by the
//! caller. Collectors:
//!  - [`NullCollector`]    – discards everything (the default)
//!  - [`ListCollector`]    – keeps events in memory, used by tests
//!  - [`JsonlWriter`]      – appends one sorted-key JSON object per line
//!  - [`ScopedCollector`]  – stamps a fixed site/array onto events it forwards
//!  - [`TracingCollector`] – forwards events to `tracing` at DEBUG level

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value;

use crate::models::Timestamp;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DebugEvent {
    pub stage: String,
    pub ts: Option<String>,
    pub site: Option<String>,
    pub array: Option<String>,
    pub payload: Value,
}

impl DebugEvent {
    pub fn new(stage: impl Into<String>, payload: Value) -> Self {
        Self {
            stage: stage.into(),
            ts: None,
            site: None,
            array: None,
            payload,
        }
    }

    pub fn at(mut self, ts: Option<&Timestamp>) -> Self {
        self.ts = ts.map(|t| t.to_rfc3339());
        self
    }

    pub fn on_date(mut self, date: NaiveDate) -> Self {
        self.ts = Some(date.to_string());
        self
    }

    pub fn site(mut self, site: impl Into<String>) -> Self {
        self.site = Some(site.into());
        self
    }

    pub fn array(mut self, array: impl Into<String>) -> Self {
        self.array = Some(array.into());
        self
    }

    /// Reason string of a skip event, if the payload carries one.
    pub fn reason(&self) -> Option<&str> {
        self.payload.get("reason").and_then(Value::as_str)
    }
}

pub trait DebugCollector {
    fn emit(&self, event: DebugEvent);
}

impl<T: DebugCollector + ?Sized> DebugCollector for &T {
    fn emit(&self, event: DebugEvent) {
        (**self).emit(event)
    }
}

impl<T: DebugCollector + ?Sized> DebugCollector for Box<T> {
    fn emit(&self, event: DebugEvent) {
        (**self).emit(event)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullCollector;

impl DebugCollector for NullCollector {
    fn emit(&self, _event: DebugEvent) {}
}

#[derive(Debug, Default)]
pub struct ListCollector {
    events: Mutex<Vec<DebugEvent>>,
}

impl ListCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DebugEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(_) => Vec::new(),
        }
    }

    pub fn stages(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.stage).collect()
    }

    pub fn find(&self, stage: &str) -> Vec<DebugEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.stage == stage)
            .collect()
    }
}

impl DebugCollector for ListCollector {
    fn emit(&self, event: DebugEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Appends events to a JSON-lines file, flushing after each line.
#[derive(Debug)]
pub struct JsonlWriter {
    out: Mutex<BufWriter<File>>,
}

impl JsonlWriter {
    pub fn create(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            out: Mutex::new(BufWriter::new(file)),
        })
    }

    fn write_line(&self, event: &DebugEvent) -> io::Result<()> {
        // Round-trip through Value so object keys come out sorted.
        let value = serde_json::to_value(event)?;
        let line = serde_json::to_string(&value)?;
        let mut out = self
            .out
            .lock()
            .map_err(|_| io::Error::other("debug writer lock poisoned"))?;
        out.write_all(line.as_bytes())?;
        out.write_all(b"\n")?;
        out.flush()
    }
}

impl DebugCollector for JsonlWriter {
    fn emit(&self, event: DebugEvent) {
        if let Err(e) = self.write_line(&event) {
            tracing::warn!(stage = %event.stage, error = %e, "failed to write debug event");
        }
    }
}

/// Fills in site/array on events that do not name one explicitly.
pub struct ScopedCollector<'a> {
    inner: &'a dyn DebugCollector,
    site: Option<String>,
    array: Option<String>,
}

impl<'a> ScopedCollector<'a> {
    pub fn site(inner: &'a dyn DebugCollector, site: &str) -> Self {
        Self {
            inner,
            site: Some(site.to_string()),
            array: None,
        }
    }

    pub fn array(&'a self, array: &str) -> ScopedCollector<'a> {
        ScopedCollector {
            inner: self,
            site: None,
            array: Some(array.to_string()),
        }
    }
}

impl DebugCollector for ScopedCollector<'_> {
    fn emit(&self, mut event: DebugEvent) {
        if event.site.is_none() {
            event.site = self.site.clone();
        }
        if event.array.is_none() {
            event.array = self.array.clone();
        }
        self.inner.emit(event);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingCollector;

impl DebugCollector for TracingCollector {
    fn emit(&self, event: DebugEvent) {
        tracing::debug!(
            stage = %event.stage,
            site = event.site.as_deref().unwrap_or("-"),
            array = event.array.as_deref().unwrap_or("-"),
            ts = event.ts.as_deref().unwrap_or("-"),
            payload = %event.payload,
            "audit"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scoped_collector_fills_missing_context_only() {
        let list = ListCollector::new();
        let site = ScopedCollector::site(&list, "s1");
        let arr = site.array("a1");

        arr.emit(DebugEvent::new("stage.dc", json!({"rows": 3})));
        arr.emit(DebugEvent::new("stage.dc", json!({})).site("override"));

        let events = list.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].site.as_deref(), Some("s1"));
        assert_eq!(events[0].array.as_deref(), Some("a1"));
        assert_eq!(events[1].site.as_deref(), Some("override"));
        assert_eq!(events[1].array.as_deref(), Some("a1"));
    }

    #[test]
    fn jsonl_writer_appends_sorted_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("debug.jsonl");
        let writer = JsonlWriter::create(&path).unwrap();
        writer.emit(DebugEvent::new("b.stage", json!({"z": 1, "a": 2})).site("s"));
        writer.emit(DebugEvent::new("a.stage", json!(null)));
        drop(writer);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with(r#"{"array":null,"payload":{"a":2,"z":1},"site":"s","stage":"b.stage""#));
        let second: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["stage"], "a.stage");
    }

    #[test]
    fn null_collector_is_usable_through_references() {
        let null = NullCollector;
        let dyn_ref: &dyn DebugCollector = &null;
        dyn_ref.emit(DebugEvent::new("noop", json!({})));
    }
}
