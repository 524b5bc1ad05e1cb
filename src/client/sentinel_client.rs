use crate::{
    Error, Result,
    client::config::{ReadyChangeCallback, SentinelConfig},
    command::{Command, CommandControl, CommandPtr, SentinelCommand, invoke_command},
    network::{
        ConnectedStatus, ConnectionFactory, ConnectionInfo, ConnectionState, RedisWaitConnected,
        ServerId, Shard, ShardOptions, ShardStatistics,
    },
    resp::{Reply, cmd},
    sharding::{
        KeyShard, KeyShardCrc32, KeyShardZero, KeysForShards, ShardInfo, ShardInterval, SlotMap,
        UNKNOWN_SHARD, hash_slot,
    },
    signal::Signal,
};
use futures_channel::mpsc;
use futures_util::StreamExt;
use log::{debug, error, info, trace, warn};
use smallvec::SmallVec;
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, RwLock, Weak,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

const GENERATED_KEYS_MAX_LEN: usize = 4;

/// Control-plane wakeups delivered to the event-loop task. Multiple posts
/// of the same tag coalesce into one handling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopEvent {
    /// An instance changed connection state (or cluster mode failed)
    StateChanged,
    /// Discovery produced a new topology snapshot to install
    InstancesUpdated,
    /// Connection info changed, run a full maintenance pass now
    RefreshHosts,
    /// A MOVED reply asked for a `CLUSTER SLOTS` refresh
    ClusterSlotsRequested,
    Stop,
}

pub(crate) type EventSender = mpsc::UnboundedSender<LoopEvent>;
type EventReceiver = mpsc::UnboundedReceiver<LoopEvent>;

#[derive(Default)]
pub(crate) struct Topology {
    pub sentinels: Option<Arc<Shard>>,
    pub master_shards: Vec<Arc<Shard>>,
    pub slaves_shards: Vec<Arc<Shard>>,
}

/// Master/slave endpoint snapshots produced by the last successful
/// discovery pass, installed in one step under this mutex.
#[derive(Default)]
pub(crate) struct DiscoverySnapshots {
    pub masters: Vec<ConnectionInfo>,
    pub slaves: Vec<ConnectionInfo>,
}

/// Counters and per-shard instance states for introspection.
#[derive(Debug, Clone, Default)]
pub struct SentinelStatistics {
    /// Commands answered with a synthetic not-ready reply
    pub redis_not_ready: u64,
    pub sentinel: ShardStatistics,
    pub masters: HashMap<String, ShardStatistics>,
    pub slaves: HashMap<String, ShardStatistics>,
}

pub(crate) struct SentinelInner {
    pub(crate) weak_self: Weak<SentinelInner>,
    pub client_name: String,
    pub shard_group_name: String,
    /// Ordered shard names; indexes derive from this order
    pub init_shards: Vec<String>,
    /// Shard name → shard index
    pub shards: HashMap<String, usize>,
    /// Sentinel pool endpoints; passwords are cleared on cluster fallback
    pub conns: Mutex<Vec<ConnectionInfo>>,
    pub password: Option<String>,
    pub track_masters: bool,
    pub track_slaves: bool,
    pub is_subscriber: bool,
    pub check_interval: Duration,
    pub cluster_slots_timeout: Duration,
    pub factory: Arc<dyn ConnectionFactory>,
    pub ready_callback: Option<ReadyChangeCallback>,

    pub topology: RwLock<Topology>,
    pub connected_statuses: Vec<Arc<ConnectedStatus>>,
    /// Consulted only while in cluster mode
    pub slot_map: SlotMap,
    pub shard_info: ShardInfo,
    pub key_shard: RwLock<Option<Arc<dyn KeyShard>>>,
    pub keys_for_shards: Mutex<Option<Arc<KeysForShards>>>,

    pub snapshots: Mutex<DiscoverySnapshots>,
    /// Deferred commands waiting for a shard to become usable
    pub commands: Mutex<Vec<SentinelCommand>>,
    pub event_tx: EventSender,

    pub current_slots_shard: AtomicUsize,
    pub update_cluster_slots_flag: AtomicBool,
    pub cluster_mode_failed: AtomicBool,
    pub redis_not_ready: AtomicU64,
    pub stopped: AtomicBool,

    /// `(shard_idx, is_master)` whenever a tracked shard's instances change
    pub signal_instances_changed: Signal<(usize, bool)>,
    pub signal_not_in_cluster_mode: Signal<()>,
}

/// High-availability Redis client core.
///
/// Discovers masters and slaves through Redis Sentinel or through the
/// Redis Cluster `CLUSTER SLOTS` protocol, routes every command to the
/// correct shard, retries transient failures and redirections within the
/// command's deadline, and gates submission on per-shard readiness.
///
/// Command submission is allowed from any thread and never blocks;
/// completion is delivered through the command's callback. Topology
/// maintenance runs on a single control task armed by [`start`](Self::start)
/// (which must be called within a tokio runtime).
pub struct SentinelClient {
    inner: Arc<SentinelInner>,
    loop_rx: Mutex<Option<EventReceiver>>,
}

impl SentinelClient {
    pub fn new(config: SentinelConfig, factory: Arc<dyn ConnectionFactory>) -> Result<Self> {
        config.validate()?;

        let (event_tx, event_rx) = mpsc::unbounded();
        let mut shards = HashMap::new();
        let mut connected_statuses = Vec::with_capacity(config.shards.len());
        for (idx, name) in config.shards.iter().enumerate() {
            shards.insert(name.clone(), idx);
            connected_statuses.push(Arc::new(ConnectedStatus::default()));
        }
        let mut conns = config.conns;
        for conn in conns.iter_mut() {
            if conn.password.is_none() {
                conn.password = config.password.clone();
            }
        }

        let inner = Arc::new_cyclic(|weak_self| SentinelInner {
            weak_self: weak_self.clone(),
            client_name: config.client_name,
            shard_group_name: config.shard_group_name,
            init_shards: config.shards,
            shards,
            conns: Mutex::new(conns),
            password: config.password,
            track_masters: config.track_masters,
            track_slaves: config.track_slaves,
            is_subscriber: config.is_subscriber,
            check_interval: config.check_interval,
            cluster_slots_timeout: config.cluster_slots_timeout,
            factory,
            ready_callback: config.ready_callback,
            topology: RwLock::new(Topology::default()),
            connected_statuses,
            slot_map: SlotMap::new(),
            shard_info: ShardInfo::default(),
            key_shard: RwLock::new(config.key_shard),
            keys_for_shards: Mutex::new(None),
            snapshots: Mutex::new(DiscoverySnapshots::default()),
            commands: Mutex::new(Vec::new()),
            event_tx,
            current_slots_shard: AtomicUsize::new(0),
            update_cluster_slots_flag: AtomicBool::new(false),
            cluster_mode_failed: AtomicBool::new(false),
            redis_not_ready: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            signal_instances_changed: Signal::default(),
            signal_not_in_cluster_mode: Signal::default(),
        });
        inner.init();
        inner.init_key_shard();
        debug!(
            "created sentinel client, shard_group_name={}, cluster_mode={}",
            inner.shard_group_name,
            inner.is_in_cluster_mode()
        );

        Ok(Self {
            inner,
            loop_rx: Mutex::new(Some(event_rx)),
        })
    }

    /// Arms the control task: periodic maintenance, discovery and deferred
    /// command processing. Must be called within a tokio runtime.
    pub fn start(&self) {
        let Some(event_rx) = self.loop_rx.lock().unwrap().take() else {
            return;
        };
        let inner = self.inner.clone();
        tokio::spawn(run_loop(inner, event_rx));
    }

    /// Stops the control task, answers every deferred command with a
    /// not-ready reply and releases all connections.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Submits a command routed by `key`. Never blocks; the reply is
    /// delivered through the command's callback.
    pub fn async_command(&self, command: CommandPtr, key: &[u8], master_required: bool) {
        let shard = self.inner.shard_by_key(key);
        self.inner.async_command(
            SentinelCommand::new(command, master_required, shard, Instant::now()),
            0,
        );
    }

    /// Submits a command to an explicit shard.
    pub fn async_command_to_shard(
        &self,
        command: CommandPtr,
        shard: usize,
        master_required: bool,
    ) {
        self.inner.async_command(
            SentinelCommand::new(command, master_required, shard, Instant::now()),
            0,
        );
    }

    pub fn shard_by_key(&self, key: &[u8]) -> usize {
        self.inner.shard_by_key(key)
    }

    pub fn shard_count(&self) -> usize {
        self.inner.shard_count()
    }

    pub fn is_in_cluster_mode(&self) -> bool {
        self.inner.is_in_cluster_mode()
    }

    /// Blocks the calling thread until every shard satisfies the wait mode
    /// (and, in cluster mode, the slot table is initialized) or the timeout
    /// expires.
    pub fn wait_connected_once(&self, wait_connected: RedisWaitConnected) -> Result<()> {
        self.inner.wait_connected_once(wait_connected)
    }

    /// Debug helper polling until every configured server of every shard is
    /// connected.
    pub fn wait_connected_debug(&self, allow_empty_slaves: bool) {
        self.inner.wait_connected_debug(allow_empty_slaves);
    }

    /// Requests an immediate maintenance pass from the control task.
    pub fn force_update_hosts(&self) {
        self.inner.post(LoopEvent::RefreshHosts);
    }

    /// Pre-computes one sample key per shard. Sentinel-mode only.
    pub fn generate_keys_for_shards(&self, max_len: usize) -> Result<()> {
        self.inner.generate_keys_for_shards(max_len)
    }

    /// A key routed to `shard_idx`, from a previous
    /// [`generate_keys_for_shards`](Self::generate_keys_for_shards) run.
    /// Sentinel-mode only.
    pub fn any_key_for_shard(&self, shard_idx: usize) -> Result<String> {
        self.inner.any_key_for_shard(shard_idx)
    }

    /// Weighted view of the usable instances of one shard.
    pub fn available_servers_weighted(
        &self,
        shard_idx: usize,
        with_master: bool,
        control: &CommandControl,
    ) -> HashMap<ServerId, f64> {
        self.inner
            .available_servers_weighted(shard_idx, with_master, control)
    }

    pub fn statistics(&self) -> SentinelStatistics {
        self.inner.statistics()
    }

    pub fn signal_instances_changed(&self) -> &Signal<(usize, bool)> {
        &self.inner.signal_instances_changed
    }

    pub fn signal_not_in_cluster_mode(&self) -> &Signal<()> {
        &self.inner.signal_not_in_cluster_mode
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<SentinelInner> {
        &self.inner
    }

    #[cfg(test)]
    pub(crate) fn take_event_rx(&self) -> Option<EventReceiver> {
        self.loop_rx.lock().unwrap().take()
    }
}

impl Drop for SentinelClient {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

async fn run_loop(inner: Arc<SentinelInner>, mut event_rx: EventReceiver) {
    let mut check_timer = tokio::time::interval(inner.check_interval);
    check_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    'outer: loop {
        let event = tokio::select! {
            event = event_rx.next() => match event {
                Some(event) => event,
                None => break,
            },
            _ = check_timer.tick() => {
                inner.refresh_connection_info();
                continue;
            }
        };

        // coalesce bursts of identical wakeups into one handling pass
        let mut pending: SmallVec<[LoopEvent; 5]> = SmallVec::new();
        pending.push(event);
        while let Ok(Some(event)) = event_rx.try_next() {
            if !pending.contains(&event) {
                pending.push(event);
            }
        }

        for event in pending {
            match event {
                LoopEvent::StateChanged => inner.check_connections(),
                LoopEvent::InstancesUpdated => inner.update_instances(),
                LoopEvent::RefreshHosts => inner.refresh_connection_info(),
                LoopEvent::ClusterSlotsRequested => {
                    inner.update_cluster_slots(inner.current_slots_shard.load(Ordering::SeqCst));
                }
                LoopEvent::Stop => break 'outer,
            }
        }
    }
    debug!("end of sentinel control loop");
}

impl SentinelInner {
    pub(crate) fn post(&self, event: LoopEvent) {
        let _ = self.event_tx.unbounded_send(event);
    }

    pub(crate) fn shard_count(&self) -> usize {
        self.init_shards.len()
    }

    pub(crate) fn is_in_cluster_mode(&self) -> bool {
        self.key_shard.read().unwrap().is_none()
    }

    pub(crate) fn sentinels(&self) -> Option<Arc<Shard>> {
        self.topology.read().unwrap().sentinels.clone()
    }

    /// Builds the shard objects and the sentinel-pool shard, and wires
    /// their signals into the control channel.
    pub(crate) fn init(&self) {
        let master_shards = self.init_role_shards(true);
        let slaves_shards = self.init_role_shards(false);

        let weak = self.weak_self.clone();
        let options = ShardOptions {
            shard_name: "(sentinel)".to_owned(),
            shard_group_name: self.shard_group_name.clone(),
            cluster_mode: self.is_in_cluster_mode(),
            read_only: false,
            connection_infos: self.conns.lock().unwrap().clone(),
            ready_change_callback: Some(Arc::new({
                let weak = weak.clone();
                move |ready| {
                    if ready && let Some(inner) = weak.upgrade() {
                        inner.post(LoopEvent::RefreshHosts);
                    }
                }
            })),
            factory: self.factory.clone(),
        };
        let sentinels = Shard::new(options);
        sentinels.signal_instance_state_change().connect({
            let weak = weak.clone();
            move |(server_id, state)| {
                trace!(
                    "signaled sentinel server {} state={state}",
                    server_id.description()
                );
                if *state != ConnectionState::Init
                    && let Some(inner) = weak.upgrade()
                {
                    inner.post(LoopEvent::StateChanged);
                }
            }
        });
        sentinels.signal_not_in_cluster_mode().connect({
            let weak = weak.clone();
            move |_| {
                if let Some(inner) = weak.upgrade() {
                    inner.cluster_mode_failed.store(true, Ordering::SeqCst);
                    inner.post(LoopEvent::StateChanged);
                }
            }
        });

        let mut topology = self.topology.write().unwrap();
        *topology = Topology {
            sentinels: Some(sentinels),
            master_shards,
            slaves_shards,
        };
    }

    fn init_role_shards(&self, master: bool) -> Vec<Arc<Shard>> {
        let weak = self.weak_self.clone();
        let mut shard_objects = Vec::with_capacity(self.init_shards.len());
        for (idx, shard_name) in self.init_shards.iter().enumerate() {
            let ready_change_callback = self.ready_callback.clone().map(|ready_callback| {
                let shard_name = shard_name.clone();
                Arc::new(move |ready: bool| {
                    ready_callback(idx, &shard_name, master, ready);
                }) as Arc<dyn Fn(bool) + Send + Sync>
            });
            let shard = Shard::new(ShardOptions {
                shard_name: shard_name.clone(),
                shard_group_name: self.shard_group_name.clone(),
                cluster_mode: self.is_in_cluster_mode(),
                read_only: !master,
                connection_infos: Vec::new(),
                ready_change_callback,
                factory: self.factory.clone(),
            });
            shard.signal_instance_state_change().connect({
                let weak = weak.clone();
                move |(_server_id, state)| {
                    if *state != ConnectionState::Init
                        && let Some(inner) = weak.upgrade()
                    {
                        inner.post(LoopEvent::StateChanged);
                    }
                }
            });
            shard.signal_instance_ready().connect({
                let weak = weak.clone();
                move |server_id| {
                    if let Some(inner) = weak.upgrade() {
                        trace!(
                            "instance {} ready: shard_idx={idx}, master={master}",
                            server_id.description()
                        );
                        if master {
                            inner.connected_statuses[idx].set_master_ready();
                        } else {
                            inner.connected_statuses[idx].set_slave_ready();
                        }
                    }
                }
            });
            shard_objects.push(shard);
        }
        shard_objects
    }

    pub(crate) fn init_key_shard(&self) {
        let key_shard = self.key_shard.read().unwrap().clone();
        if let Some(key_shard) = key_shard
            && key_shard.is_generate_keys_enabled()
            && let Err(e) = self.generate_keys_for_shards(GENERATED_KEYS_MAX_LEN)
        {
            error!(
                "generating keys for shards failed: {e}, shard_group_name={}",
                self.shard_group_name
            );
        }
    }

    pub(crate) fn shard_by_key(&self, key: &[u8]) -> usize {
        let key_shard = self.key_shard.read().unwrap().clone();
        let shard = match key_shard {
            Some(key_shard) => key_shard.shard_by_key(key),
            None => self.slot_map.shard_by_slot(hash_slot(key)),
        };
        trace!("key={} shard={shard}", String::from_utf8_lossy(key));
        shard
    }

    /// Submits one attempt of a command, wrapping its callback into the
    /// retry trampoline. Tries the slave shard first unless the master is
    /// required; enqueues the command for the next maintenance pass when no
    /// instance accepts it.
    pub(crate) fn async_command(
        &self,
        scommand: SentinelCommand,
        prev_instance_idx: usize,
    ) {
        let command = scommand.command.clone();
        let shard = if scommand.shard == UNKNOWN_SHARD {
            0
        } else {
            scommand.shard
        };
        let master_required = scommand.master_required;
        let start = scommand.start;
        let counter = command.counter();

        let weak = self.weak_self.clone();
        let original = command.clone();
        let command_check_errors = Command::with_state(
            command.args.clone(),
            Arc::new(move |ccommand: &CommandPtr, reply: Reply| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                inner.on_attempt_reply(
                    &original,
                    ccommand,
                    reply,
                    shard,
                    master_required,
                    start,
                    counter,
                );
            }),
            command.control.clone(),
            counter,
            command.asking,
            prev_instance_idx,
            command.redirected,
        );

        let (slaves_shard, master_shard) = {
            let topology = self.topology.read().unwrap();
            (
                topology.slaves_shards.get(shard).cloned(),
                topology.master_shards.get(shard).cloned(),
            )
        };

        if !master_required
            && let Some(slaves_shard) = slaves_shard
            && slaves_shard.async_command(&command_check_errors)
        {
            return;
        }

        let sent = master_shard
            .map(|master_shard| master_shard.async_command(&command_check_errors))
            .unwrap_or(false);
        if !sent {
            self.async_command_failed(scommand);
        }
    }

    /// The retry state machine run on every attempt reply.
    #[allow(clippy::too_many_arguments)]
    fn on_attempt_reply(
        &self,
        command: &CommandPtr,
        ccommand: &CommandPtr,
        reply: Reply,
        shard: usize,
        master_required: bool,
        start: Instant,
        counter: usize,
    ) {
        // a redirect already spawned a successor for this command
        if counter != command.counter() {
            return;
        }

        let now = Instant::now();
        let error_ask = reply.data.is_error_ask();
        let error_moved = reply.data.is_error_moved();
        if error_moved {
            self.request_update_cluster_slots(shard);
        }
        let retry_to_master = !master_required
            && reply.data.is_nil()
            && command.control.force_retries_to_master_on_nil_reply;
        let retry = retry_to_master
            || !reply.is_ok()
            || error_ask
            || error_moved
            || reply.is_unusable_instance_error()
            || reply.is_readonly_error();

        if retry {
            let mut new_shard = shard;
            let mut retries_left = command.control.max_retries.saturating_sub(1);
            if error_ask || error_moved {
                debug!(
                    "got error '{}' reply, cmd={}, server={}",
                    reply.data.error_str().unwrap_or_default(),
                    reply.cmd,
                    reply.server_id.description()
                );
                let parsed_shard = self.parse_moved_shard(reply.data.error_str().unwrap_or(""));
                if parsed_shard != UNKNOWN_SHARD {
                    new_shard = parsed_shard;
                }
                command.bump_counter();
                if !command.redirected || (error_ask && !command.asking) {
                    retries_left += 1;
                }
            }
            let until = start + command.control.timeout_all;
            if now < until && retries_left > 0 {
                let timeout_all = until - now;
                let mut control = command.control.clone();
                control.timeout_single = control.timeout_single.min(timeout_all);
                control.timeout_all = timeout_all;
                control.max_retries = retries_left;

                let new_command = Command::with_state(
                    ccommand.args.clone(),
                    command.callback(),
                    control,
                    command.counter() + 1,
                    command.asking || error_ask,
                    0,
                    error_ask || error_moved,
                );
                self.async_command(
                    SentinelCommand::new(
                        new_command,
                        master_required || retry_to_master || (error_moved && shard == new_shard),
                        new_shard,
                        start,
                    ),
                    ccommand.instance_idx(),
                );
                return;
            }
        }

        let mut reply = reply;
        reply.time = now - start;
        invoke_command(command, reply);
    }

    /// Command callbacks only run on the control task; deferring keeps a
    /// refused submission from invoking its callback on the caller thread.
    fn async_command_failed(&self, scommand: SentinelCommand) {
        self.commands.lock().unwrap().push(scommand);
    }

    pub(crate) fn request_update_cluster_slots(&self, shard: usize) {
        self.current_slots_shard.store(shard, Ordering::SeqCst);
        self.post(LoopEvent::ClusterSlotsRequested);
    }

    /// Probes `CLUSTER SLOTS` on one master; concurrent requests coalesce
    /// into the in-flight probe.
    pub(crate) fn update_cluster_slots(&self, shard: usize) {
        if self.update_cluster_slots_flag.swap(true, Ordering::SeqCst) {
            return;
        }
        trace!("updating cluster slots, shard={shard}");
        let weak = self.weak_self.clone();
        let command = Command::new(
            cmd("CLUSTER").arg("SLOTS"),
            Arc::new(move |_command, reply| {
                if let Some(inner) = weak.upgrade() {
                    inner.apply_cluster_slots_reply(&reply);
                    inner
                        .update_cluster_slots_flag
                        .store(false, Ordering::SeqCst);
                }
            }),
            CommandControl {
                timeout_single: self.cluster_slots_timeout,
                timeout_all: self.cluster_slots_timeout,
                max_retries: 1,
                force_retries_to_master_on_nil_reply: false,
            },
        );
        let master_shard = self.topology.read().unwrap().master_shards.get(shard).cloned();
        let sent = master_shard
            .map(|master_shard| master_shard.async_command(&command))
            .unwrap_or(false);
        if !sent {
            self.update_cluster_slots_flag.store(false, Ordering::SeqCst);
        }
    }

    /// Applies a `CLUSTER SLOTS` reply to the slot table. Any entry failing
    /// the shape check aborts the whole update.
    pub(crate) fn apply_cluster_slots_reply(&self, reply: &Reply) {
        trace!("got reply to CLUSTER SLOTS: {}", reply.data);
        if !self.is_in_cluster_mode() {
            return;
        }
        let Some(entries) = reply.data.as_array() else {
            return;
        };
        let mut shard_intervals = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(entry) = entry.as_array() else {
                return;
            };
            if entry.len() < 3 {
                return;
            }
            let (Some(slot_min), Some(slot_max)) = (entry[0].as_integer(), entry[1].as_integer())
            else {
                return;
            };
            for host_info in &entry[2..] {
                let Some(host_info) = host_info.as_array() else {
                    return;
                };
                if host_info.len() < 2 {
                    return;
                }
                let (Some(host), Some(port)) = (host_info[0].as_str(), host_info[1].as_integer())
                else {
                    return;
                };
                let shard = self.shard_info.shard(host, port as u16);
                if shard != UNKNOWN_SHARD {
                    shard_intervals.push(ShardInterval::new(
                        slot_min as usize,
                        slot_max as usize,
                        shard,
                    ));
                    break;
                }
            }
        }
        self.slot_map.update_slots(&shard_intervals);
    }

    /// Resolves the target shard of a `MOVED <slot> <host>:<port>` /
    /// `ASK <slot> <host>:<port>` error string.
    pub(crate) fn parse_moved_shard(&self, error: &str) -> usize {
        let target = || -> Option<(&str, u16)> {
            let mut parts = error.split_whitespace();
            parts.next()?; // MOVED / ASK
            parts.next()?; // hash slot
            let address = parts.next()?;
            let (host, port) = address.rsplit_once(':')?;
            Some((host, port.parse::<u16>().ok()?))
        };
        match target() {
            Some((host, port)) => self.shard_info.shard(host, port),
            None => {
                warn!("cannot parse redirection target from {error:?}");
                UNKNOWN_SHARD
            }
        }
    }

    /// Periodic maintenance: advance connection creation, run a discovery
    /// pass and resubmit deferred commands.
    pub(crate) fn refresh_connection_info(&self) {
        let (sentinels, master_shards, slaves_shards) = {
            let topology = self.topology.read().unwrap();
            (
                topology.sentinels.clone(),
                topology.master_shards.clone(),
                topology.slaves_shards.clone(),
            )
        };
        if let Some(sentinels) = &sentinels {
            sentinels.process_creation();
        }
        if self.track_masters {
            for (shard_idx, shard) in master_shards.iter().enumerate() {
                if shard.process_creation() {
                    self.signal_instances_changed.emit(&(shard_idx, true));
                }
            }
        }
        if self.track_slaves {
            for (shard_idx, shard) in slaves_shards.iter().enumerate() {
                if shard.process_creation() {
                    self.signal_instances_changed.emit(&(shard_idx, false));
                }
            }
        }
        if self.is_in_cluster_mode() {
            self.read_cluster_hosts();
        } else {
            self.read_sentinels();
        }
        self.process_waiting_commands();
    }

    /// State-change handling: cluster fallback, dead-connection reaping and
    /// deferred command processing.
    pub(crate) fn check_connections(&self) {
        if self.cluster_mode_failed.load(Ordering::SeqCst) && self.is_in_cluster_mode() {
            self.switch_to_non_cluster_mode();
            return;
        }
        let (sentinels, master_shards, slaves_shards) = {
            let topology = self.topology.read().unwrap();
            (
                topology.sentinels.clone(),
                topology.master_shards.clone(),
                topology.slaves_shards.clone(),
            )
        };
        if let Some(sentinels) = &sentinels {
            sentinels.process_state_update();
        }
        for (shard_idx, shard) in master_shards.iter().enumerate() {
            if shard.process_state_update() {
                self.signal_instances_changed.emit(&(shard_idx, true));
            }
        }
        for (shard_idx, shard) in slaves_shards.iter().enumerate() {
            if shard.process_state_update() {
                self.signal_instances_changed.emit(&(shard_idx, false));
            }
        }
        self.process_waiting_commands();
    }

    /// Demotes the client from cluster mode to plain sharding: drains and
    /// cleans everything, drops the pool passwords (sentinels accept
    /// unauthenticated clients), installs the fallback key shard and
    /// rebuilds the shard objects. The demotion is permanent.
    fn switch_to_non_cluster_mode(&self) {
        self.halt_shards();
        {
            let mut conns = self.conns.lock().unwrap();
            for conn in conns.iter_mut() {
                conn.password = None;
            }
        }
        let strategy: Arc<dyn KeyShard> = if self.is_subscriber {
            Arc::new(KeyShardZero)
        } else {
            Arc::new(KeyShardCrc32::new(self.shard_count()))
        };
        warn!(
            "cannot run in redis cluster mode for client={}, switching to {} sharding strategy",
            self.client_name,
            strategy.name()
        );
        *self.key_shard.write().unwrap() = Some(strategy);
        self.init();
        self.init_key_shard();
        self.signal_not_in_cluster_mode.emit(&());
    }

    /// Installs the discovery snapshots into the shard objects.
    pub(crate) fn update_instances(&self) {
        let mut changed = false;
        {
            let snapshots = self.snapshots.lock().unwrap();
            let master_map = group_by_shard_name(&snapshots.masters);
            let slaves_map = group_by_shard_name(&snapshots.slaves);
            let topology = self.topology.read().unwrap();
            changed |= self.set_connection_info(master_map, &topology.master_shards, true);
            changed |= self.set_connection_info(slaves_map, &topology.slaves_shards, false);
        }
        if changed {
            self.post(LoopEvent::RefreshHosts);
        }
    }

    fn set_connection_info(
        &self,
        mut info_by_shard: HashMap<String, Vec<ConnectionInfo>>,
        shards: &[Arc<Shard>],
        master: bool,
    ) -> bool {
        // every configured shard must be present so a shard whose servers
        // all disappeared gets its last instance purged
        for shard_name in &self.init_shards {
            info_by_shard.entry(shard_name.clone()).or_default();
        }

        let mut changed = false;
        for (shard_name, infos) in info_by_shard {
            let Some(&shard_idx) = self.shards.get(&shard_name) else {
                continue;
            };
            let Some(shard) = shards.get(shard_idx) else {
                continue;
            };
            let conn_strs: Vec<String> = infos.iter().map(|info| info.fulltext()).collect();
            if shard.set_connection_info(infos) {
                info!(
                    "redis state changed for client={} shard={} role={}, now it is [{}], connections={}",
                    self.client_name,
                    shard_name,
                    if master { "master" } else { "slave" },
                    conn_strs.join(", "),
                    shard.instances_count(),
                );
                changed = true;
            }
        }
        changed
    }

    /// Sweeps the deferred queue: expired commands get one synthetic
    /// not-ready reply per argument chunk, the rest are resubmitted.
    pub(crate) fn process_waiting_commands(&self) {
        let waiting_commands: Vec<SentinelCommand> = {
            let mut commands = self.commands.lock().unwrap();
            std::mem::take(&mut *commands)
        };
        if !waiting_commands.is_empty() {
            info!(
                "processing waiting commands, client={} shard_group_name={} count={}",
                self.client_name,
                self.shard_group_name,
                waiting_commands.len()
            );
        }
        let now = Instant::now();
        for scommand in waiting_commands {
            if now >= scommand.start + scommand.command.control.timeout_all {
                self.deliver_not_ready(&scommand.command);
            } else {
                self.async_command(scommand, 0);
            }
        }
    }

    fn deliver_not_ready(&self, command: &CommandPtr) {
        for chunk in command.args.chunks() {
            let cmd_name = chunk
                .first()
                .map(|name| String::from_utf8_lossy(name).into_owned())
                .unwrap_or_default();
            error!(
                "killing request: {}",
                chunk
                    .iter()
                    .map(|arg| String::from_utf8_lossy(arg).into_owned())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            self.redis_not_ready.fetch_add(1, Ordering::Relaxed);
            invoke_command(command, Reply::not_ready(cmd_name));
        }
    }

    /// Drains the deferred queue with not-ready replies and releases every
    /// connection. Used by both shutdown and cluster fallback.
    fn halt_shards(&self) {
        let waiting_commands: Vec<SentinelCommand> = {
            let mut commands = self.commands.lock().unwrap();
            std::mem::take(&mut *commands)
        };
        for scommand in waiting_commands {
            self.deliver_not_ready(&scommand.command);
        }
        let topology = self.topology.read().unwrap();
        for shard in topology
            .master_shards
            .iter()
            .chain(topology.slaves_shards.iter())
        {
            shard.clean();
        }
        if let Some(sentinels) = &topology.sentinels {
            sentinels.clean();
        }
    }

    pub(crate) fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.post(LoopEvent::Stop);
        self.halt_shards();
    }

    pub(crate) fn wait_connected_once(&self, wait_connected: RedisWaitConnected) -> Result<()> {
        let deadline = Instant::now() + wait_connected.timeout;
        for (idx, status) in self.connected_statuses.iter().enumerate() {
            if !status.wait_ready(deadline, wait_connected.mode) {
                let msg = format!(
                    "cannot connect to redis, shard_group_name={}, shard={} in {} ms, mode={}",
                    self.shard_group_name,
                    self.init_shards[idx],
                    wait_connected.timeout.as_millis(),
                    wait_connected.mode
                );
                if wait_connected.fail_on_timeout {
                    return Err(Error::NotConnected(msg));
                }
                error!("{msg}, starting with not ready redis client");
            }
        }
        if self.is_in_cluster_mode() && !self.slot_map.wait_initialized(deadline) {
            let msg = format!(
                "cannot init cluster slots for redis, shard_group_name={} in {} ms, mode={}",
                self.shard_group_name,
                wait_connected.timeout.as_millis(),
                wait_connected.mode
            );
            if wait_connected.fail_on_timeout {
                return Err(Error::NotConnected(msg));
            }
            warn!("{msg}, starting with not ready redis client");
        }
        Ok(())
    }

    pub(crate) fn wait_connected_debug(&self, allow_empty_slaves: bool) {
        const POLL_INTERVAL: Duration = Duration::from_millis(50);

        loop {
            let connected_all = {
                let topology = self.topology.read().unwrap();
                topology
                    .master_shards
                    .iter()
                    .all(|shard| shard.is_connected_to_all_servers_debug(false))
                    && topology
                        .slaves_shards
                        .iter()
                        .all(|shard| shard.is_connected_to_all_servers_debug(allow_empty_slaves))
            };
            if connected_all && (!self.is_in_cluster_mode() || self.slot_map.is_initialized()) {
                return;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    pub(crate) fn generate_keys_for_shards(&self, max_len: usize) -> Result<()> {
        if self.is_in_cluster_mode() {
            return Err(Error::Client(
                "generating keys for shards is not supported in redis cluster mode".to_owned(),
            ));
        }
        let weak = self.weak_self.clone();
        let keys = KeysForShards::generate(
            self.shard_count(),
            move |key| {
                weak.upgrade()
                    .map(|inner| inner.shard_by_key(key.as_bytes()))
                    .unwrap_or(UNKNOWN_SHARD)
            },
            max_len,
        )?;
        *self.keys_for_shards.lock().unwrap() = Some(Arc::new(keys));
        Ok(())
    }

    pub(crate) fn any_key_for_shard(&self, shard_idx: usize) -> Result<String> {
        if self.is_in_cluster_mode() {
            return Err(Error::Client(
                "sample keys per shard are not supported in redis cluster mode".to_owned(),
            ));
        }
        let keys_for_shards = self.keys_for_shards.lock().unwrap().clone();
        let Some(keys_for_shards) = keys_for_shards else {
            return Err(Error::Client(
                "keys were not generated with generate_keys_for_shards()".to_owned(),
            ));
        };
        keys_for_shards
            .any_key_for_shard(shard_idx)
            .map(|key| key.to_owned())
    }

    pub(crate) fn available_servers_weighted(
        &self,
        shard_idx: usize,
        with_master: bool,
        control: &CommandControl,
    ) -> HashMap<ServerId, f64> {
        let topology = self.topology.read().unwrap();
        let mut result = topology
            .slaves_shards
            .get(shard_idx)
            .map(|shard| shard.available_servers_weighted(control))
            .unwrap_or_default();
        if with_master
            && let Some(master_shard) = topology.master_shards.get(shard_idx)
        {
            for (server_id, weight) in master_shard.available_servers_weighted(control) {
                result.entry(server_id).or_insert(weight);
            }
        }
        result
    }

    pub(crate) fn statistics(&self) -> SentinelStatistics {
        let topology = self.topology.read().unwrap();
        SentinelStatistics {
            redis_not_ready: self.redis_not_ready.load(Ordering::Relaxed),
            sentinel: topology
                .sentinels
                .as_ref()
                .map(|sentinels| sentinels.statistics())
                .unwrap_or_default(),
            masters: topology
                .master_shards
                .iter()
                .map(|shard| (shard.shard_name().to_owned(), shard.statistics()))
                .collect(),
            slaves: topology
                .slaves_shards
                .iter()
                .map(|shard| (shard.shard_name().to_owned(), shard.statistics()))
                .collect(),
        }
    }
}

fn group_by_shard_name(infos: &[ConnectionInfo]) -> HashMap<String, Vec<ConnectionInfo>> {
    let mut map: HashMap<String, Vec<ConnectionInfo>> = HashMap::new();
    for info in infos {
        map.entry(info.name.clone()).or_default().push(info.clone());
    }
    map
}
