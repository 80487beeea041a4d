/// RT event records produced by the scheduler.
///
/// Every observable scheduling effect (thread creation, swaps, kills,
/// message traffic, deployments, clock advances) is modelled as an
/// `RtEvent`. Events render to single-line records of the shape
/// `EventName -> key1: value1 key2: value2 ...` with a stable key order,
/// which is the format external validators consume.

use crate::ids::{BusId, CpuId, MessageId, ObjectRef, ThreadId};
use crate::time::VirtualTime;

// ── Field values ─────────────────────────────────────────────────────

/// A field value in a rendered record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogValue {
    Nil,
    Bool(bool),
    Int(u64),
    Str(String),
    Set(Vec<u64>),
}

impl std::fmt::Display for LogValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogValue::Nil => write!(f, "nil"),
            LogValue::Bool(b) => write!(f, "{}", b),
            LogValue::Int(n) => write!(f, "{}", n),
            LogValue::Str(s) => write!(f, "\"{}\"", s),
            LogValue::Set(items) => {
                let inner: Vec<String> = items.iter().map(|i| i.to_string()).collect();
                write!(f, "{{{}}}", inner.join(","))
            }
        }
    }
}

impl From<Option<ObjectRef>> for LogValue {
    fn from(r: Option<ObjectRef>) -> Self {
        r.map_or(LogValue::Nil, |r| LogValue::Int(r.raw()))
    }
}

impl From<Option<&str>> for LogValue {
    fn from(s: Option<&str>) -> Self {
        s.map_or(LogValue::Nil, |s| LogValue::Str(s.to_string()))
    }
}

// ── Rendered record ──────────────────────────────────────────────────

/// A rendered log line: event name plus ordered fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub name: String,
    pub fields: Vec<(String, LogValue)>,
}

impl LogRecord {
    /// Look up a field by key.
    pub fn get(&self, key: &str) -> Option<&LogValue> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Integer field, if present and numeric.
    pub fn int(&self, key: &str) -> Option<u64> {
        match self.get(key) {
            Some(LogValue::Int(n)) => Some(*n),
            _ => None,
        }
    }

    /// Parse a line previously produced by `Display`.
    pub fn parse(line: &str) -> Result<LogRecord, String> {
        let (name, rest) = line
            .split_once(" -> ")
            .ok_or_else(|| format!("missing ' -> ' in: {}", line))?;
        let mut fields = Vec::new();
        let mut rest = rest.trim_start();
        while !rest.is_empty() {
            let (key, after) = rest
                .split_once(": ")
                .ok_or_else(|| format!("missing ': ' after key in: {}", line))?;
            let (value, remaining) = parse_value(after)?;
            fields.push((key.to_string(), value));
            rest = remaining.trim_start();
        }
        Ok(LogRecord {
            name: name.to_string(),
            fields,
        })
    }
}

fn parse_value(s: &str) -> Result<(LogValue, &str), String> {
    if let Some(body) = s.strip_prefix('"') {
        let end = body.find('"').ok_or("unterminated string")?;
        return Ok((LogValue::Str(body[..end].to_string()), &body[end + 1..]));
    }
    if let Some(body) = s.strip_prefix('{') {
        let end = body.find('}').ok_or("unterminated set")?;
        let items = body[..end]
            .split(',')
            .filter(|p| !p.is_empty())
            .map(|p| p.trim().parse::<u64>().map_err(|e| format!("set item: {}", e)))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok((LogValue::Set(items), &body[end + 1..]));
    }
    let end = s.find(' ').unwrap_or(s.len());
    let (word, rest) = s.split_at(end);
    let value = match word {
        "nil" => LogValue::Nil,
        "true" => LogValue::Bool(true),
        "false" => LogValue::Bool(false),
        n => LogValue::Int(n.parse().map_err(|e| format!("value {}: {}", n, e))?),
    };
    Ok((value, rest))
}

impl std::fmt::Display for LogRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ->", self.name)?;
        for (k, v) in &self.fields {
            write!(f, " {}: {}", k, v)?;
        }
        Ok(())
    }
}

// ── RtEvent ──────────────────────────────────────────────────────────

/// Identity of a context as it appears in swap records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadTag {
    pub id: ThreadId,
    pub objref: Option<ObjectRef>,
    pub clnm: Option<String>,
}

/// A typed scheduler event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtEvent {
    CpuDecl {
        cpu: CpuId,
        name: String,
        expl: bool,
    },
    BusDecl {
        bus: BusId,
        name: String,
        topo: Vec<CpuId>,
    },
    DeployObj {
        objref: ObjectRef,
        clnm: String,
        cpu: CpuId,
    },
    ThreadCreate {
        thread: ThreadTag,
        period: bool,
        cpu: CpuId,
    },
    ThreadSwapIn {
        thread: ThreadTag,
        cpu: CpuId,
        overhead: u64,
    },
    DelayedThreadSwapIn {
        thread: ThreadTag,
        delay: u64,
        cpu: CpuId,
        overhead: u64,
    },
    ThreadSwapOut {
        thread: ThreadTag,
        cpu: CpuId,
        overhead: u64,
    },
    ThreadKill {
        id: ThreadId,
        cpu: CpuId,
    },
    MessageRequest {
        bus: BusId,
        from_cpu: CpuId,
        to_cpu: CpuId,
        msg: MessageId,
        caller: ThreadId,
        opname: String,
        objref: ObjectRef,
        size: u64,
    },
    ReplyRequest {
        bus: BusId,
        from_cpu: CpuId,
        to_cpu: CpuId,
        msg: MessageId,
        orig_msg: MessageId,
        caller: ThreadId,
        callee: ThreadId,
        size: u64,
    },
    MessageActivate {
        msg: MessageId,
    },
    MessageCompleted {
        msg: MessageId,
    },
    TimeAdvance {
        delta: u64,
    },
}

impl RtEvent {
    /// The record name written before ` -> `.
    pub fn name(&self) -> &'static str {
        match self {
            RtEvent::CpuDecl { .. } => "CPUdecl",
            RtEvent::BusDecl { .. } => "BUSdecl",
            RtEvent::DeployObj { .. } => "DeployObj",
            RtEvent::ThreadCreate { .. } => "ThreadCreate",
            RtEvent::ThreadSwapIn { .. } => "ThreadSwapIn",
            RtEvent::DelayedThreadSwapIn { .. } => "DelayedThreadSwapIn",
            RtEvent::ThreadSwapOut { .. } => "ThreadSwapOut",
            RtEvent::ThreadKill { .. } => "ThreadKill",
            RtEvent::MessageRequest { .. } => "MessageRequest",
            RtEvent::ReplyRequest { .. } => "ReplyRequest",
            RtEvent::MessageActivate { .. } => "MessageActivate",
            RtEvent::MessageCompleted { .. } => "MessageCompleted",
            RtEvent::TimeAdvance { .. } => "TimeAdvance",
        }
    }

    /// Render with the stable key order, stamping `time` last.
    pub fn to_record(&self, time: VirtualTime) -> LogRecord {
        use LogValue::{Bool, Int, Str};

        fn tag(t: &ThreadTag) -> Vec<(&'static str, LogValue)> {
            vec![
                ("id", Int(t.id.raw())),
                ("objref", t.objref.into()),
                ("clnm", t.clnm.as_deref().into()),
            ]
        }

        let mut fields: Vec<(&'static str, LogValue)> = match self {
            RtEvent::CpuDecl { cpu, name, expl } => vec![
                ("id", Int(cpu.raw())),
                ("expl", Bool(*expl)),
                ("name", Str(name.clone())),
            ],
            RtEvent::BusDecl { bus, name, topo } => vec![
                ("id", Int(bus.raw())),
                ("topo", LogValue::Set(topo.iter().map(|c| c.raw()).collect())),
                ("name", Str(name.clone())),
            ],
            RtEvent::DeployObj { objref, clnm, cpu } => vec![
                ("objref", Int(objref.raw())),
                ("clnm", Str(clnm.clone())),
                ("cpunm", Int(cpu.raw())),
            ],
            RtEvent::ThreadCreate {
                thread,
                period,
                cpu,
            } => {
                let mut f = vec![("id", Int(thread.id.raw())), ("period", Bool(*period))];
                f.extend(tag(thread).into_iter().skip(1));
                f.push(("cpunm", Int(cpu.raw())));
                f
            }
            RtEvent::ThreadSwapIn {
                thread,
                cpu,
                overhead,
            }
            | RtEvent::ThreadSwapOut {
                thread,
                cpu,
                overhead,
            } => {
                let mut f = tag(thread);
                f.push(("cpunm", Int(cpu.raw())));
                f.push(("overhead", Int(*overhead)));
                f
            }
            RtEvent::DelayedThreadSwapIn {
                thread,
                delay,
                cpu,
                overhead,
            } => {
                let mut f = tag(thread);
                f.push(("delay", Int(*delay)));
                f.push(("cpunm", Int(cpu.raw())));
                f.push(("overhead", Int(*overhead)));
                f
            }
            RtEvent::ThreadKill { id, cpu } => {
                vec![("id", Int(id.raw())), ("cpunm", Int(cpu.raw()))]
            }
            RtEvent::MessageRequest {
                bus,
                from_cpu,
                to_cpu,
                msg,
                caller,
                opname,
                objref,
                size,
            } => vec![
                ("busid", Int(bus.raw())),
                ("fromcpu", Int(from_cpu.raw())),
                ("tocpu", Int(to_cpu.raw())),
                ("msgid", Int(msg.raw())),
                ("callthr", Int(caller.raw())),
                ("opname", Str(opname.clone())),
                ("objref", Int(objref.raw())),
                ("size", Int(*size)),
            ],
            RtEvent::ReplyRequest {
                bus,
                from_cpu,
                to_cpu,
                msg,
                orig_msg,
                caller,
                callee,
                size,
            } => vec![
                ("busid", Int(bus.raw())),
                ("fromcpu", Int(from_cpu.raw())),
                ("tocpu", Int(to_cpu.raw())),
                ("msgid", Int(msg.raw())),
                ("origmsgid", Int(orig_msg.raw())),
                ("callthr", Int(caller.raw())),
                ("calleethr", Int(callee.raw())),
                ("size", Int(*size)),
            ],
            RtEvent::MessageActivate { msg } | RtEvent::MessageCompleted { msg } => {
                vec![("msgid", Int(msg.raw()))]
            }
            RtEvent::TimeAdvance { delta } => vec![("delta", Int(*delta))],
        };
        fields.push(("time", Int(time.ticks())));

        LogRecord {
            name: self.name().to_string(),
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn main_tag() -> ThreadTag {
        ThreadTag {
            id: ThreadId::new(1),
            objref: None,
            clnm: None,
        }
    }

    #[test]
    fn test_thread_create_format() {
        let e = RtEvent::ThreadCreate {
            thread: main_tag(),
            period: false,
            cpu: CpuId::new(0),
        };
        assert_eq!(
            e.to_record(VirtualTime::ZERO).to_string(),
            "ThreadCreate -> id: 1 period: false objref: nil clnm: nil cpunm: 0 time: 0"
        );
    }

    #[test]
    fn test_swap_in_format() {
        let e = RtEvent::ThreadSwapIn {
            thread: ThreadTag {
                id: ThreadId::new(4),
                objref: Some(ObjectRef::new(2)),
                clnm: Some("Sensor".into()),
            },
            cpu: CpuId::new(1),
            overhead: 0,
        };
        assert_eq!(
            e.to_record(VirtualTime::new(30)).to_string(),
            "ThreadSwapIn -> id: 4 objref: 2 clnm: \"Sensor\" cpunm: 1 overhead: 0 time: 30"
        );
    }

    #[test]
    fn test_bus_decl_format() {
        let e = RtEvent::BusDecl {
            bus: BusId::new(1),
            name: "bus1".into(),
            topo: vec![CpuId::new(1), CpuId::new(2)],
        };
        assert_eq!(
            e.to_record(VirtualTime::ZERO).to_string(),
            "BUSdecl -> id: 1 topo: {1,2} name: \"bus1\" time: 0"
        );
    }

    #[test]
    fn test_parse_rendered_record() {
        let e = RtEvent::MessageRequest {
            bus: BusId::new(1),
            from_cpu: CpuId::new(1),
            to_cpu: CpuId::new(2),
            msg: MessageId::new(3),
            caller: ThreadId::new(5),
            opname: "Ctrl`set point".into(),
            objref: ObjectRef::new(7),
            size: 16,
        };
        let record = e.to_record(VirtualTime::new(100));
        let parsed = LogRecord::parse(&record.to_string()).unwrap();
        assert_eq!(parsed, record);
        assert_eq!(parsed.int("msgid"), Some(3));
        assert_eq!(parsed.get("opname"), Some(&LogValue::Str("Ctrl`set point".into())));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(LogRecord::parse("no arrow here").is_err());
        assert!(LogRecord::parse("X -> key value").is_err());
    }
}
