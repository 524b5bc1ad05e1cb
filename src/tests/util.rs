use crate::{
    client::{SentinelClient, SentinelConfig},
    command::{Command, CommandPtr, ReplyCallback},
    network::{
        ConnectionFactory, ConnectionInfo, ConnectionState, RedisConnection, ServerId,
        StateChangeCallback,
    },
    resp::{Reply, ReplyStatus, Value},
    sharding::KeyShardCrc32,
};
use bytes::Bytes;
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

pub(crate) type ReplyScript = Arc<dyn Fn(&CommandPtr) -> Option<Reply> + Send + Sync>;

/// Scripted stand-in for the connection layer. Accepted commands are
/// recorded; when the script produces a reply it is delivered synchronously
/// through the command's callback, exactly like a pipelined connection
/// answering from its read loop.
pub(crate) struct FakeConnection {
    server_id: ServerId,
    pub info: ConnectionInfo,
    state: Mutex<ConnectionState>,
    on_state_change: StateChangeCallback,
    script: ReplyScript,
    pub sent: Mutex<Vec<CommandPtr>>,
    pub accept: AtomicBool,
}

impl FakeConnection {
    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
        (self.on_state_change)(self.server_id, state);
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn sent_at(&self, idx: usize) -> CommandPtr {
        self.sent.lock().unwrap()[idx].clone()
    }
}

impl RedisConnection for FakeConnection {
    fn server_id(&self) -> ServerId {
        self.server_id
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    fn async_command(&self, command: CommandPtr) -> bool {
        if !self.accept.load(Ordering::SeqCst) {
            return false;
        }
        self.sent.lock().unwrap().push(command.clone());
        if let Some(reply) = (self.script)(&command) {
            Command::complete(&command, reply);
        }
        true
    }
}

pub(crate) struct FakeFactory {
    scripts: Mutex<HashMap<(String, u16), ReplyScript>>,
    default_script: Mutex<ReplyScript>,
    pub connections: Mutex<Vec<Arc<FakeConnection>>>,
    pub auto_connect: AtomicBool,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            default_script: Mutex::new(Arc::new(|command: &CommandPtr| {
                Some(status_reply("OK", command))
            })),
            connections: Mutex::new(Vec::new()),
            auto_connect: AtomicBool::new(true),
        })
    }

    pub fn set_script(&self, host: &str, port: u16, script: ReplyScript) {
        self.scripts
            .lock()
            .unwrap()
            .insert((host.to_owned(), port), script);
    }

    pub fn set_default_script(&self, script: ReplyScript) {
        *self.default_script.lock().unwrap() = script;
    }

    pub fn connections_to(&self, host: &str, port: u16) -> Vec<Arc<FakeConnection>> {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .filter(|connection| connection.info.host == host && connection.info.port == port)
            .cloned()
            .collect()
    }
}

impl ConnectionFactory for FakeFactory {
    fn create(
        &self,
        info: &ConnectionInfo,
        on_state_change: StateChangeCallback,
    ) -> Arc<dyn RedisConnection> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&(info.host.clone(), info.port))
            .cloned()
            .unwrap_or_else(|| self.default_script.lock().unwrap().clone());
        let connection = Arc::new(FakeConnection {
            server_id: ServerId::next(),
            info: info.clone(),
            state: Mutex::new(ConnectionState::Init),
            on_state_change,
            script,
            sent: Mutex::new(Vec::new()),
            accept: AtomicBool::new(true),
        });
        self.connections.lock().unwrap().push(connection.clone());
        if self.auto_connect.load(Ordering::SeqCst) {
            connection.set_state(ConnectionState::Connecting);
            connection.set_state(ConnectionState::Connected);
        }
        connection
    }
}

/// Collects every reply delivered to a command's user callback.
#[derive(Clone, Default)]
pub(crate) struct ReplyCapture {
    replies: Arc<Mutex<Vec<Reply>>>,
}

impl ReplyCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> ReplyCallback {
        let replies = self.replies.clone();
        Arc::new(move |_command: &CommandPtr, reply: Reply| {
            replies.lock().unwrap().push(reply);
        })
    }

    pub fn count(&self) -> usize {
        self.replies.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<Reply> {
        self.replies.lock().unwrap().last().cloned()
    }
}

pub(crate) fn bulk(s: &str) -> Value {
    Value::BulkString(Bytes::copy_from_slice(s.as_bytes()))
}

pub(crate) fn status_reply(status: &str, command: &CommandPtr) -> Reply {
    Reply::ok(Value::Status(status.to_owned()), command.name(), ServerId::any())
}

pub(crate) fn data_reply(data: Value, command: &CommandPtr) -> Reply {
    Reply::ok(data, command.name(), ServerId::any())
}

/// Server-side error: the connection parsed a `-...` line, status stays Ok.
pub(crate) fn server_error_reply(error: &str, command: &CommandPtr) -> Reply {
    Reply::ok(
        Value::Error(error.to_owned()),
        command.name(),
        ServerId::any(),
    )
}

/// Transport-level failure reported by the connection itself.
pub(crate) fn transport_error_reply(command: &CommandPtr) -> Reply {
    Reply::new(
        ReplyStatus::Error,
        Value::Nil,
        command.name(),
        ServerId::any(),
    )
}

pub(crate) fn sentinel_host_row(name: &str, ip: &str, port: u16, flags: &str) -> Value {
    Value::Array(vec![
        bulk("name"),
        bulk(name),
        bulk("ip"),
        bulk(ip),
        bulk("port"),
        bulk(&port.to_string()),
        bulk("flags"),
        bulk(flags),
    ])
}

pub(crate) fn cluster_slots_entry(
    slot_min: i64,
    slot_max: i64,
    endpoints: &[(&str, u16)],
) -> Value {
    let mut entry = vec![Value::Integer(slot_min), Value::Integer(slot_max)];
    for (host, port) in endpoints {
        entry.push(Value::Array(vec![bulk(host), Value::Integer(*port as i64)]));
    }
    Value::Array(entry)
}

pub(crate) fn shard_names(count: usize) -> Vec<String> {
    (0..count).map(|idx| format!("shard{idx}")).collect()
}

pub(crate) fn sentinel_conns(count: usize) -> Vec<ConnectionInfo> {
    (0..count)
        .map(|idx| ConnectionInfo::new(format!("sentinel{idx}"), 26379))
        .collect()
}

/// Client in cluster mode (slot routing) with scripted connections.
pub(crate) fn cluster_client(
    shard_count: usize,
    sentinel_count: usize,
) -> (SentinelClient, Arc<FakeFactory>) {
    let factory = FakeFactory::new();
    let config = SentinelConfig::new(shard_names(shard_count), sentinel_conns(sentinel_count))
        .with_shard_group_name("test_group")
        .with_client_name("test_client");
    let client = SentinelClient::new(config, factory.clone()).unwrap();
    (client, factory)
}

/// Client in sentinel mode (CRC-32 key sharding) with scripted connections.
pub(crate) fn sentinel_client(
    shard_count: usize,
    sentinel_count: usize,
) -> (SentinelClient, Arc<FakeFactory>) {
    let factory = FakeFactory::new();
    let config = SentinelConfig::new(shard_names(shard_count), sentinel_conns(sentinel_count))
        .with_shard_group_name("test_group")
        .with_client_name("test_client")
        .with_key_shard(Arc::new(KeyShardCrc32::new(shard_count)));
    let client = SentinelClient::new(config, factory.clone()).unwrap();
    (client, factory)
}

/// Registers a master endpoint for a shard and connects it.
pub(crate) fn add_master(client: &SentinelClient, shard_idx: usize, host: &str, port: u16) {
    let inner = client.inner();
    {
        let mut snapshots = inner.snapshots.lock().unwrap();
        snapshots
            .masters
            .push(ConnectionInfo::new(host, port).with_name(format!("shard{shard_idx}")));
    }
    inner.update_instances();
    let shards = inner.topology.read().unwrap().master_shards.clone();
    shards[shard_idx].process_creation();
}

/// Registers a slave endpoint for a shard and connects it.
pub(crate) fn add_slave(client: &SentinelClient, shard_idx: usize, host: &str, port: u16) {
    let inner = client.inner();
    {
        let mut snapshots = inner.snapshots.lock().unwrap();
        snapshots
            .slaves
            .push(ConnectionInfo::new(host, port).with_name(format!("shard{shard_idx}")));
    }
    inner.update_instances();
    let shards = inner.topology.read().unwrap().slaves_shards.clone();
    shards[shard_idx].process_creation();
}

/// Connects the sentinel-pool endpoints declared in the configuration.
pub(crate) fn connect_sentinels(client: &SentinelClient) {
    let sentinels = client.inner().sentinels().unwrap();
    sentinels.process_creation();
}
