use crate::network::ServerId;
use bytes::Bytes;
use std::{fmt, str, time::Duration};

/// Generic Rust data structure over a parsed server reply.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Value {
    #[default]
    Nil,
    /// Simple string reply (e.g. `+OK`)
    Status(String),
    /// Error reply, the raw error line without the leading `-`
    Error(String),
    Integer(i64),
    BulkString(Bytes),
    Array(Vec<Value>),
}

impl Value {
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Value::Array(_))
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Value::Integer(_))
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Value::BulkString(_) | Value::Status(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Status(s) => Some(s),
            Value::BulkString(b) => str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(values) => Some(values),
            _ => None,
        }
    }

    pub fn error_str(&self) -> Option<&str> {
        match self {
            Value::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_error_ask(&self) -> bool {
        matches!(self, Value::Error(e) if e.starts_with("ASK "))
    }

    pub fn is_error_moved(&self) -> bool {
        matches!(self, Value::Error(e) if e.starts_with("MOVED "))
    }

    /// The instance answered but cannot serve traffic right now.
    pub fn is_unusable_instance_error(&self) -> bool {
        matches!(
            self,
            Value::Error(e) if e.starts_with("LOADING")
                || e.starts_with("MASTERDOWN")
                || e.starts_with("CLUSTERDOWN")
        )
    }

    /// A replica refused a write after a role change.
    pub fn is_readonly_error(&self) -> bool {
        matches!(self, Value::Error(e) if e.starts_with("READONLY"))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("(nil)"),
            Value::Status(s) => f.write_str(s),
            Value::Error(e) => f.write_fmt(format_args!("-{e}")),
            Value::Integer(i) => f.write_fmt(format_args!("{i}")),
            Value::BulkString(b) => f.write_str(&String::from_utf8_lossy(b)),
            Value::Array(values) => {
                f.write_str("[")?;
                for (idx, value) in values.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    fmt::Display::fmt(value, f)?;
                }
                f.write_str("]")
            }
        }
    }
}

/// Completion status of one command attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok,
    /// Transport or protocol failure reported by the connection
    Error,
    /// The per-attempt timeout expired before an answer arrived
    Timeout,
    /// No usable instance accepted the command before its deadline
    NotReady,
}

impl ReplyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyStatus::Ok => "ok",
            ReplyStatus::Error => "error",
            ReplyStatus::Timeout => "timeout",
            ReplyStatus::NotReady => "not ready",
        }
    }
}

/// Reply delivered by a connection for one issued command attempt.
///
/// `status` describes the transport outcome; a server-side error line is a
/// successful transport and arrives as `status: Ok` with a
/// [`Value::Error`] payload.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: ReplyStatus,
    pub data: Value,
    /// Command name the reply answers, for logging
    pub cmd: String,
    pub server_id: ServerId,
    /// Submission-to-delivery latency, stamped by the retry machinery
    pub time: Duration,
}

impl Reply {
    pub fn new(status: ReplyStatus, data: Value, cmd: impl Into<String>, server_id: ServerId) -> Self {
        Self {
            status,
            data,
            cmd: cmd.into(),
            server_id,
            time: Duration::ZERO,
        }
    }

    pub fn ok(data: Value, cmd: impl Into<String>, server_id: ServerId) -> Self {
        Self::new(ReplyStatus::Ok, data, cmd, server_id)
    }

    /// Synthetic reply for a command no healthy instance could take.
    pub fn not_ready(cmd: impl Into<String>) -> Self {
        Self::new(ReplyStatus::NotReady, Value::Nil, cmd, ServerId::any())
    }

    pub fn is_ok(&self) -> bool {
        self.status == ReplyStatus::Ok
    }

    pub fn is_unusable_instance_error(&self) -> bool {
        self.data.is_unusable_instance_error()
    }

    pub fn is_readonly_error(&self) -> bool {
        self.data.is_readonly_error()
    }
}
