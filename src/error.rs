use std::{
    fmt::{Display, Formatter},
    str::{FromStr, Utf8Error},
};

/// All error kinds
#[derive(Debug)]
pub enum Error {
    /// Raised if an error occurs within the driver
    Client(String),
    /// Raised if an error occurs in the configuration validation
    Config(String),
    /// Raised if an error occurs when contacting the sentinel pool
    Sentinel(String),
    /// Error returned by the Redis server
    Redis(RedisError),
    /// Raised when a readiness wait expires before the client is usable
    NotConnected(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Client(e) => f.write_fmt(format_args!("Client error: {e}")),
            Error::Config(e) => f.write_fmt(format_args!("Config error: {e}")),
            Error::Sentinel(e) => f.write_fmt(format_args!("Sentinel error: {e}")),
            Error::Redis(e) => f.write_fmt(format_args!("Redis error: {e}")),
            Error::NotConnected(e) => f.write_fmt(format_args!("Not connected: {e}")),
        }
    }
}

impl std::error::Error for Error {}

impl From<Utf8Error> for Error {
    fn from(e: Utf8Error) -> Self {
        Error::Client(e.to_string())
    }
}

/// Redis server error kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedisErrorKind {
    Ask {
        hash_slot: u16,
        address: (String, u16),
    },
    ClusterDown,
    CrossSlot,
    Err,
    Loading,
    MasterDown,
    Moved {
        hash_slot: u16,
        address: (String, u16),
    },
    NoAuth,
    NoPerm,
    OutOfMemory,
    Readonly,
    TryAgain,
    WrongPass,
    WrongType,
    Other(String),
}

impl From<&str> for RedisErrorKind {
    fn from(str: &str) -> Self {
        match str {
            "CLUSTERDOWN" => Self::ClusterDown,
            "CROSSSLOT" => Self::CrossSlot,
            "ERR" => Self::Err,
            "LOADING" => Self::Loading,
            "MASTERDOWN" => Self::MasterDown,
            "NOAUTH" => Self::NoAuth,
            "NOPERM" => Self::NoPerm,
            "OOM" => Self::OutOfMemory,
            "READONLY" => Self::Readonly,
            "TRYAGAIN" => Self::TryAgain,
            "WRONGPASS" => Self::WrongPass,
            "WRONGTYPE" => Self::WrongType,
            _ => Self::Other(str.to_owned()),
        }
    }
}

impl Display for RedisErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RedisErrorKind::Ask {
                hash_slot,
                address: (host, port),
            } => f.write_fmt(format_args!("ASK {hash_slot} {host}:{port}")),
            RedisErrorKind::ClusterDown => f.write_str("CLUSTERDOWN"),
            RedisErrorKind::CrossSlot => f.write_str("CROSSSLOT"),
            RedisErrorKind::Err => f.write_str("ERR"),
            RedisErrorKind::Loading => f.write_str("LOADING"),
            RedisErrorKind::MasterDown => f.write_str("MASTERDOWN"),
            RedisErrorKind::Moved {
                hash_slot,
                address: (host, port),
            } => f.write_fmt(format_args!("MOVED {hash_slot} {host}:{port}")),
            RedisErrorKind::NoAuth => f.write_str("NOAUTH"),
            RedisErrorKind::NoPerm => f.write_str("NOPERM"),
            RedisErrorKind::OutOfMemory => f.write_str("OOM"),
            RedisErrorKind::Readonly => f.write_str("READONLY"),
            RedisErrorKind::TryAgain => f.write_str("TRYAGAIN"),
            RedisErrorKind::WrongPass => f.write_str("WRONGPASS"),
            RedisErrorKind::WrongType => f.write_str("WRONGTYPE"),
            RedisErrorKind::Other(e) => f.write_str(e),
        }
    }
}

/// Error issued by the Redis server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisError {
    pub kind: RedisErrorKind,
    pub description: String,
}

impl RedisError {
    /// Parses `ASK <slot> <host>:<port>` / `MOVED <slot> <host>:<port>`.
    ///
    /// The port separator is the last `:` of the address token, which keeps
    /// bracketless IPv6 hosts intact.
    fn parse_redirect(code: &str, rest: &str) -> Option<RedisErrorKind> {
        let mut parts = rest.split_whitespace();
        let hash_slot = parts.next()?.parse::<u16>().ok()?;
        let address = parts.next()?;
        let (host, port) = address.rsplit_once(':')?;
        let port = port.parse::<u16>().ok()?;
        let address = (host.to_owned(), port);
        match code {
            "ASK" => Some(RedisErrorKind::Ask { hash_slot, address }),
            "MOVED" => Some(RedisErrorKind::Moved { hash_slot, address }),
            _ => None,
        }
    }
}

impl FromStr for RedisError {
    type Err = Error;

    fn from_str(error: &str) -> Result<Self, Error> {
        match error.split_once(' ') {
            Some((code @ ("ASK" | "MOVED"), rest)) => match Self::parse_redirect(code, rest) {
                Some(kind) => Ok(Self {
                    kind,
                    description: "".to_owned(),
                }),
                None => Err(Error::Client(format!(
                    "Cannot parse redirection error `{error}`"
                ))),
            },
            Some((kind, description)) => Ok(Self {
                kind: kind.into(),
                description: description.to_owned(),
            }),
            None => Ok(Self {
                kind: error.into(),
                description: "".to_owned(),
            }),
        }
    }
}

impl Display for RedisError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{} {}", self.kind, self.description))
    }
}
