//! Pluggable sink for room trace events.
//!
//! A [`Tracer`] accepts discrete text events in order and never reports
//! failure back to the caller. Three sinks are provided:
//!
//! - [`new`] writes one line per event to any [`std::io::Write`].
//! - [`log`] forwards events to the `tracing` facade.
//! - [`off`] discards everything.

use std::io::Write;

/// Receives trace events emitted by a room.
pub trait Tracer: Send {
    fn trace(&mut self, event: &str);
}

/// Returns a tracer that writes each event, newline terminated, to `out`.
pub fn new<W>(out: W) -> Box<dyn Tracer>
where
    W: Write + Send + 'static,
{
    Box::new(WriterTracer { out })
}

/// Returns a tracer that emits events through `tracing` under the `room` target.
pub fn log() -> Box<dyn Tracer> {
    Box::new(LogTracer)
}

/// Returns a tracer that ignores every event.
pub fn off() -> Box<dyn Tracer> {
    Box::new(NilTracer)
}

struct WriterTracer<W> {
    out: W,
}

impl<W> Tracer for WriterTracer<W>
where
    W: Write + Send,
{
    fn trace(&mut self, event: &str) {
        // A broken trace sink must never affect the room.
        let _ = writeln!(self.out, "{event}").and_then(|()| self.out.flush());
    }
}

struct LogTracer;

impl Tracer for LogTracer {
    fn trace(&mut self, event: &str) {
        tracing::info!(target: "room", "{event}");
    }
}

struct NilTracer;

impl Tracer for NilTracer {
    fn trace(&mut self, _event: &str) {}
}
