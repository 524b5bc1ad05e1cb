use crate::command::CommandPtr;
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

/// Lifecycle of one physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Init,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Init => "init",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static NEXT_SERVER_ID: AtomicUsize = AtomicUsize::new(0);

/// Identity of one server instance behind a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerId(usize);

impl ServerId {
    /// A fresh identity, unique within the process.
    pub fn next() -> Self {
        ServerId(NEXT_SERVER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The "no particular server" identity carried by synthetic replies.
    pub fn any() -> Self {
        ServerId(usize::MAX)
    }

    pub fn is_any(&self) -> bool {
        self.0 == usize::MAX
    }

    pub fn description(&self) -> String {
        if self.is_any() {
            "server_any".to_owned()
        } else {
            format!("server_{}", self.0)
        }
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

/// Endpoint and credentials of one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    /// Name of the logical shard the server belongs to
    pub name: String,
}

impl ConnectionInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            password: None,
            name: String::new(),
        }
    }

    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn fulltext(&self) -> String {
        format!("{}:{} name={}", self.host, self.port, self.name)
    }
}

/// Invoked by the connection layer on every state transition.
pub type StateChangeCallback = Arc<dyn Fn(ServerId, ConnectionState) + Send + Sync>;

/// Contract the core consumes from the connection layer.
///
/// RESP framing, pipelining and reply parsing live behind this trait; the
/// core hands over argument vectors and receives parsed replies through the
/// command's callback. Dropping the last reference closes the connection.
pub trait RedisConnection: Send + Sync {
    fn server_id(&self) -> ServerId;

    fn state(&self) -> ConnectionState;

    /// Enqueues a command on this connection.
    ///
    /// Returns `false` when the connection cannot accept it; the command is
    /// untouched and may be offered elsewhere. An accepted command is
    /// answered through its callback, honoring `control.timeout_single`,
    /// and is preceded by `ASKING` on the wire when `command.asking` is set.
    fn async_command(&self, command: CommandPtr) -> bool;
}

/// Creates connections for endpoints discovered at runtime.
pub trait ConnectionFactory: Send + Sync {
    /// Opens a connection to `info`; transitions are reported through
    /// `on_state_change`, `Connected` doubling as the instance-ready
    /// trigger.
    fn create(
        &self,
        info: &ConnectionInfo,
        on_state_change: StateChangeCallback,
    ) -> Arc<dyn RedisConnection>;
}
