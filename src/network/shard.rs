use crate::{
    command::{CommandControl, CommandPtr},
    network::{
        ConnectionFactory, ConnectionInfo, ConnectionState, RedisConnection, ServerId,
        StateChangeCallback,
    },
    signal::Signal,
};
use log::{debug, trace, warn};
use rand::Rng;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
    time::{Duration, Instant},
};

const RECONNECT_DELAY_INITIAL: Duration = Duration::from_millis(100);
const RECONNECT_DELAY_MAX: Duration = Duration::from_secs(10);

/// Construction parameters of a [`Shard`].
pub struct ShardOptions {
    pub shard_name: String,
    pub shard_group_name: String,
    pub cluster_mode: bool,
    pub read_only: bool,
    /// Initial endpoint set, connected on the first creation pass
    pub connection_infos: Vec<ConnectionInfo>,
    /// Invoked when the shard gains or loses its last usable instance
    pub ready_change_callback: Option<Arc<dyn Fn(bool) + Send + Sync>>,
    pub factory: Arc<dyn ConnectionFactory>,
}

struct Instance {
    info: ConnectionInfo,
    connection: Arc<dyn RedisConnection>,
    /// Consecutive failed connection attempts for this endpoint
    attempt: u32,
}

struct PendingConnection {
    info: ConnectionInfo,
    attempt: u32,
    not_before: Instant,
}

#[derive(Default)]
struct ShardState {
    instances: Vec<Instance>,
    pending: Vec<PendingConnection>,
    /// Desired endpoint set, as last reconciled
    target: Vec<ConnectionInfo>,
    ready: bool,
}

/// Connection state of one tracked instance, for introspection.
#[derive(Debug, Clone)]
pub struct InstanceStatistics {
    pub server_id: ServerId,
    pub endpoint: String,
    pub state: ConnectionState,
}

#[derive(Debug, Clone, Default)]
pub struct ShardStatistics {
    pub instances: Vec<InstanceStatistics>,
}

/// The connection set of one logical shard in one role (master or slave),
/// with load-balanced command dispatch across its healthy instances.
pub struct Shard {
    weak_self: Weak<Shard>,
    shard_name: String,
    shard_group_name: String,
    cluster_mode: bool,
    read_only: bool,
    factory: Arc<dyn ConnectionFactory>,
    ready_change_callback: Option<Arc<dyn Fn(bool) + Send + Sync>>,
    state: Mutex<ShardState>,
    signal_instance_state_change: Signal<(ServerId, ConnectionState)>,
    signal_instance_ready: Signal<ServerId>,
    signal_not_in_cluster_mode: Signal<()>,
}

impl Shard {
    pub fn new(options: ShardOptions) -> Arc<Self> {
        let now = Instant::now();
        let pending = options
            .connection_infos
            .iter()
            .map(|info| PendingConnection {
                info: info.clone(),
                attempt: 0,
                not_before: now,
            })
            .collect();
        Arc::new_cyclic(|weak_self| Shard {
            weak_self: weak_self.clone(),
            shard_name: options.shard_name,
            shard_group_name: options.shard_group_name,
            cluster_mode: options.cluster_mode,
            read_only: options.read_only,
            factory: options.factory,
            ready_change_callback: options.ready_change_callback,
            state: Mutex::new(ShardState {
                instances: Vec::new(),
                pending,
                target: options.connection_infos,
                ready: false,
            }),
            signal_instance_state_change: Signal::default(),
            signal_instance_ready: Signal::default(),
            signal_not_in_cluster_mode: Signal::default(),
        })
    }

    pub fn shard_name(&self) -> &str {
        &self.shard_name
    }

    pub fn shard_group_name(&self) -> &str {
        &self.shard_group_name
    }

    pub fn is_cluster_mode(&self) -> bool {
        self.cluster_mode
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn tag(&self) -> String {
        format!("{}/{}", self.shard_group_name, self.shard_name)
    }

    pub fn signal_instance_state_change(&self) -> &Signal<(ServerId, ConnectionState)> {
        &self.signal_instance_state_change
    }

    pub fn signal_instance_ready(&self) -> &Signal<ServerId> {
        &self.signal_instance_ready
    }

    pub fn signal_not_in_cluster_mode(&self) -> &Signal<()> {
        &self.signal_not_in_cluster_mode
    }

    /// Reconciles the desired endpoint set. Removed endpoints are closed,
    /// added ones are scheduled for the next creation pass. Returns whether
    /// the set changed.
    pub fn set_connection_info(&self, infos: Vec<ConnectionInfo>) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.target == infos {
            return false;
        }
        let tag = self.tag();
        state.instances.retain(|instance| {
            let keep = infos.contains(&instance.info);
            if !keep {
                debug!("[{tag}] closing connection to {}", instance.info.fulltext());
            }
            keep
        });
        state.pending.retain(|pending| infos.contains(&pending.info));
        let now = Instant::now();
        for info in &infos {
            let known = state.instances.iter().any(|i| i.info == *info)
                || state.pending.iter().any(|p| p.info == *info);
            if !known {
                debug!("[{tag}] scheduling connection to {}", info.fulltext());
                state.pending.push(PendingConnection {
                    info: info.clone(),
                    attempt: 0,
                    not_before: now,
                });
            }
        }
        state.target = infos;
        true
    }

    /// Picks a healthy instance round-robin, starting after the command's
    /// last-tried index, and hands the command over. Returns `false` when no
    /// instance is currently usable.
    pub fn async_command(&self, command: &CommandPtr) -> bool {
        let instances: Vec<Arc<dyn RedisConnection>> = {
            let state = self.state.lock().unwrap();
            state
                .instances
                .iter()
                .map(|instance| instance.connection.clone())
                .collect()
        };
        if instances.is_empty() {
            return false;
        }
        let prev = command.instance_idx() % instances.len();
        for offset in 1..=instances.len() {
            let idx = (prev + offset) % instances.len();
            let connection = &instances[idx];
            if connection.state() != ConnectionState::Connected {
                continue;
            }
            if connection.async_command(command.clone()) {
                command.set_instance_idx(idx);
                return true;
            }
        }
        false
    }

    /// Sends one command, built per instance, to every connected instance.
    /// Returns the number of instances that accepted.
    pub fn broadcast(&self, make_command: impl Fn(ServerId) -> CommandPtr) -> usize {
        let instances: Vec<Arc<dyn RedisConnection>> = {
            let state = self.state.lock().unwrap();
            state
                .instances
                .iter()
                .map(|instance| instance.connection.clone())
                .collect()
        };
        let mut sent = 0;
        for connection in instances {
            if connection.state() != ConnectionState::Connected {
                continue;
            }
            if connection.async_command(make_command(connection.server_id())) {
                sent += 1;
            }
        }
        sent
    }

    /// Advances pending connection attempts whose backoff has elapsed.
    /// Returns whether any instance was created.
    pub fn process_creation(&self) -> bool {
        let now = Instant::now();
        let due: Vec<PendingConnection> = {
            let mut state = self.state.lock().unwrap();
            let mut due = Vec::new();
            let mut idx = 0;
            while idx < state.pending.len() {
                if state.pending[idx].not_before <= now {
                    due.push(state.pending.swap_remove(idx));
                } else {
                    idx += 1;
                }
            }
            due
        };
        if due.is_empty() {
            return false;
        }

        let tag = self.tag();
        for pending in due {
            debug!(
                "[{tag}] connecting to {} (attempt {})",
                pending.info.fulltext(),
                pending.attempt
            );
            let weak = self.weak_self.clone();
            let on_state_change: StateChangeCallback = Arc::new(move |server_id, state| {
                if let Some(shard) = weak.upgrade() {
                    shard.on_instance_state_change(server_id, state);
                }
            });
            let connection = self.factory.create(&pending.info, on_state_change);
            let mut state = self.state.lock().unwrap();
            // the endpoint may have been dropped from the target set while
            // the connection was being created
            if state.target.contains(&pending.info) {
                state.instances.push(Instance {
                    info: pending.info,
                    connection,
                    attempt: pending.attempt,
                });
            }
        }
        self.update_ready();
        true
    }

    /// Reaps dead connections back into the pending set with an increased
    /// backoff. Returns whether any instance state changed.
    pub fn process_state_update(&self) -> bool {
        let mut changed = false;
        {
            let mut state = self.state.lock().unwrap();
            let now = Instant::now();
            let mut idx = 0;
            while idx < state.instances.len() {
                if state.instances[idx].connection.state() == ConnectionState::Disconnected {
                    let instance = state.instances.remove(idx);
                    let attempt = instance.attempt + 1;
                    let delay = reconnect_delay(attempt);
                    warn!(
                        "[{}] lost connection to {}, retrying in {:?}",
                        self.tag(),
                        instance.info.fulltext(),
                        delay
                    );
                    state.pending.push(PendingConnection {
                        info: instance.info,
                        attempt,
                        not_before: now + delay,
                    });
                    changed = true;
                } else {
                    idx += 1;
                }
            }
        }
        if changed {
            self.update_ready();
        }
        changed
    }

    fn on_instance_state_change(&self, server_id: ServerId, connection_state: ConnectionState) {
        trace!(
            "[{}] instance {} state={connection_state}",
            self.tag(),
            server_id.description()
        );
        if connection_state == ConnectionState::Connected {
            let mut state = self.state.lock().unwrap();
            if let Some(instance) = state
                .instances
                .iter_mut()
                .find(|instance| instance.connection.server_id() == server_id)
            {
                instance.attempt = 0;
            }
        }
        self.update_ready();
        self.signal_instance_state_change
            .emit(&(server_id, connection_state));
        if connection_state == ConnectionState::Connected {
            self.signal_instance_ready.emit(&server_id);
        }
    }

    fn update_ready(&self) {
        let flipped = {
            let mut state = self.state.lock().unwrap();
            let ready = state
                .instances
                .iter()
                .any(|instance| instance.connection.state() == ConnectionState::Connected);
            if ready != state.ready {
                state.ready = ready;
                Some(ready)
            } else {
                None
            }
        };
        if let Some(ready) = flipped
            && let Some(callback) = &self.ready_change_callback
        {
            callback(ready);
        }
    }

    pub fn instances_count(&self) -> usize {
        self.state.lock().unwrap().instances.len()
    }

    /// Weighted view of the currently usable instances. Weights are uniform
    /// for now; the control parameter is the hook for locality policies.
    pub fn available_servers_weighted(
        &self,
        _control: &CommandControl,
    ) -> HashMap<ServerId, f64> {
        let state = self.state.lock().unwrap();
        state
            .instances
            .iter()
            .filter(|instance| instance.connection.state() == ConnectionState::Connected)
            .map(|instance| (instance.connection.server_id(), 1.0))
            .collect()
    }

    pub fn is_connected_to_all_servers_debug(&self, allow_empty: bool) -> bool {
        let state = self.state.lock().unwrap();
        (allow_empty || !state.instances.is_empty())
            && state.pending.is_empty()
            && state
                .instances
                .iter()
                .all(|instance| instance.connection.state() == ConnectionState::Connected)
    }

    /// Releases every connection and pending attempt.
    pub fn clean(&self) {
        let mut state = self.state.lock().unwrap();
        state.instances.clear();
        state.pending.clear();
        state.target.clear();
        state.ready = false;
    }

    pub fn statistics(&self) -> ShardStatistics {
        let state = self.state.lock().unwrap();
        ShardStatistics {
            instances: state
                .instances
                .iter()
                .map(|instance| InstanceStatistics {
                    server_id: instance.connection.server_id(),
                    endpoint: format!("{}:{}", instance.info.host, instance.info.port),
                    state: instance.connection.state(),
                })
                .collect(),
        }
    }
}

/// Exponential backoff with jitter so a flapping shard does not reconnect
/// in lockstep.
fn reconnect_delay(attempt: u32) -> Duration {
    let base = RECONNECT_DELAY_INITIAL
        .saturating_mul(1u32 << attempt.min(10))
        .min(RECONNECT_DELAY_MAX);
    let jitter_ms = rand::rng().random_range(0..=(base.as_millis() as u64) / 4);
    base + Duration::from_millis(jitter_ms)
}
