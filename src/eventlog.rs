/// Event log sink and replay verification.
///
/// The scheduler writes every `RtEvent` to a `LogSink`. `EventLog` is the
/// in-memory sink: it keeps the rendered records in order, exports them
/// in the line format external validators read, imports them back, and
/// hashes the whole stream so two runs can be compared cheaply.

use std::io::{self, BufRead, Write};
use std::sync::{Mutex, MutexGuard};

use crate::event::{LogRecord, LogValue, RtEvent};
use crate::time::VirtualTime;

// ── Hash utility ──────────────────────────────────────────────────────

/// Combine two u64 hashes deterministically.
pub fn hash_combine(a: u64, b: u64) -> u64 {
    let mut h = a;
    h = h.wrapping_mul(0x517cc1b727220a95);
    h = h.wrapping_add(b);
    h ^= h >> 32;
    h
}

/// Hash a byte slice deterministically (FNV-1a variant).
pub fn hash_bytes(data: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for &b in data {
        h ^= b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

// ── Sink trait ────────────────────────────────────────────────────────

/// Destination of the RT event stream.
///
/// Called from whichever native thread is currently active, so
/// implementations must be `Send + Sync`.
pub trait LogSink: Send + Sync {
    /// Record one event stamped with the current virtual time.
    fn record(&self, event: &RtEvent, time: VirtualTime);

    /// Drop everything recorded so far (between runs).
    fn clear(&self) {}
}

/// A sink that discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl LogSink for NullSink {
    fn record(&self, _event: &RtEvent, _time: VirtualTime) {}
}

// ── Event Log ─────────────────────────────────────────────────────────

/// Append-only, in-memory record of a run.
#[derive(Debug, Default)]
pub struct EventLog {
    records: Mutex<Vec<LogRecord>>,
}

impl EventLog {
    /// Create an empty event log.
    pub fn new() -> Self {
        EventLog {
            records: Mutex::new(Vec::new()),
        }
    }

    fn lock_or_recover(&self) -> MutexGuard<'_, Vec<LogRecord>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        }
    }

    /// Append an already-rendered record.
    pub fn push(&self, record: LogRecord) {
        self.lock_or_recover().push(record);
    }

    /// Snapshot of all records in order.
    pub fn records(&self) -> Vec<LogRecord> {
        self.lock_or_recover().clone()
    }

    /// Rendered lines in order.
    pub fn lines(&self) -> Vec<String> {
        self.lock_or_recover().iter().map(|r| r.to_string()).collect()
    }

    /// Records with the given event name.
    pub fn named(&self, name: &str) -> Vec<LogRecord> {
        self.lock_or_recover()
            .iter()
            .filter(|r| r.name == name)
            .cloned()
            .collect()
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.lock_or_recover().len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.lock_or_recover().is_empty()
    }

    /// Deterministic hash of the entire log.
    pub fn log_hash(&self) -> u64 {
        self.lock_or_recover()
            .iter()
            .fold(0u64, |h, r| hash_combine(h, record_hash(r)))
    }

    // ── Export / Import ───────────────────────────────────────────

    /// Export the log to a writer, one record per line.
    pub fn export<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let records = self.lock_or_recover();
        writeln!(w, "# RTSCHED EVENT LOG v1")?;
        writeln!(w, "# events: {}", records.len())?;
        for record in records.iter() {
            writeln!(w, "{}", record)?;
        }
        Ok(())
    }

    /// Export to a file path.
    pub fn export_to_file(&self, path: &str) -> io::Result<()> {
        let mut f = std::fs::File::create(path)?;
        self.export(&mut f)
    }

    /// Import a log from a reader. Blank lines and `#` comments are skipped.
    pub fn import<R: BufRead>(r: R) -> io::Result<Self> {
        let log = EventLog::new();
        for line in r.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let record = LogRecord::parse(line)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            log.push(record);
        }
        Ok(log)
    }

    /// Import from a file path.
    pub fn import_from_file(path: &str) -> io::Result<Self> {
        let f = std::fs::File::open(path)?;
        Self::import(io::BufReader::new(f))
    }
}

impl LogSink for EventLog {
    fn record(&self, event: &RtEvent, time: VirtualTime) {
        let record = event.to_record(time);
        log::trace!(target: "rtsched::event", "{}", record);
        self.push(record);
    }

    fn clear(&self) {
        self.lock_or_recover().clear();
    }
}

// ── Verification ──────────────────────────────────────────────────────

/// Compare two event logs record by record.
pub fn logs_match(a: &EventLog, b: &EventLog) -> bool {
    a.records() == b.records()
}

fn record_hash(r: &LogRecord) -> u64 {
    let mut h = hash_bytes(r.name.as_bytes());
    for (k, v) in &r.fields {
        h = hash_combine(h, hash_bytes(k.as_bytes()));
        h = hash_combine(h, value_hash(v));
    }
    h
}

fn value_hash(v: &LogValue) -> u64 {
    match v {
        LogValue::Nil => 0,
        LogValue::Bool(b) => hash_combine(1, *b as u64),
        LogValue::Int(n) => hash_combine(2, *n),
        LogValue::Str(s) => hash_combine(3, hash_bytes(s.as_bytes())),
        LogValue::Set(items) => items.iter().fold(4, |h, i| hash_combine(h, *i)),
    }
}
