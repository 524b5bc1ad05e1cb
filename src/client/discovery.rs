//! Quorum discovery over the sentinel pool: `SENTINEL MASTERS` /
//! `SENTINEL SLAVES` in sentinel mode, `CLUSTER SLOTS` in cluster mode.

use crate::{
    client::sentinel_client::{LoopEvent, SentinelInner},
    command::{Command, CommandControl, CommandPtr},
    network::{ConnectionInfo, Shard},
    resp::{Value, cmd},
    sharding::{HostPortToShardMap, ShardInterval},
};
use bytes::Bytes;
use log::{debug, trace, warn};
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

const SENTINEL_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// A majority of the requests actually sent must have produced a parsable
/// response before a discovery pass may touch any state.
pub(crate) fn check_quorum(requests_sent: usize, responses_parsed: usize) -> bool {
    let quorum = requests_sent / 2 + 1;
    responses_parsed >= quorum
}

fn sentinel_request_control() -> CommandControl {
    CommandControl {
        timeout_single: SENTINEL_REQUEST_TIMEOUT,
        timeout_all: SENTINEL_REQUEST_TIMEOUT,
        max_retries: 1,
        force_retries_to_master_on_nil_reply: false,
    }
}

/// Scatter-gather barrier for one fan-out: counts replies against the
/// number of requests actually sent and hands the parsed results to exactly
/// one finalizer.
pub(crate) struct ScatterContext<T> {
    state: Mutex<ScatterState<T>>,
}

struct ScatterState<T> {
    expected: Option<usize>,
    received: usize,
    parsed: Vec<T>,
    finished: bool,
}

type ScatterOutcome<T> = (Vec<T>, usize, usize);

impl<T> Default for ScatterContext<T> {
    fn default() -> Self {
        Self {
            state: Mutex::new(ScatterState {
                expected: None,
                received: 0,
                parsed: Vec::new(),
                finished: false,
            }),
        }
    }
}

impl<T> ScatterContext<T> {
    /// Records one reply; `parsed` is `None` for an unusable response.
    pub(crate) fn on_reply(&self, parsed: Option<T>) -> Option<ScatterOutcome<T>> {
        let mut state = self.state.lock().unwrap();
        state.received += 1;
        if let Some(parsed) = parsed {
            state.parsed.push(parsed);
        }
        Self::try_finish(&mut state)
    }

    /// Fixes the number of expected replies once the fan-out is done.
    /// Replies racing the fan-out are handled either way.
    pub(crate) fn set_expected(&self, expected: usize) -> Option<ScatterOutcome<T>> {
        let mut state = self.state.lock().unwrap();
        state.expected = Some(expected);
        Self::try_finish(&mut state)
    }

    fn try_finish(state: &mut ScatterState<T>) -> Option<ScatterOutcome<T>> {
        match state.expected {
            Some(expected) if state.received >= expected && !state.finished => {
                state.finished = true;
                let parsed = std::mem::take(&mut state.parsed);
                let responses_parsed = parsed.len();
                Some((parsed, expected, responses_parsed))
            }
            _ => None,
        }
    }
}

/// Rolling aggregation of the per-shard `SENTINEL SLAVES` fan-outs.
struct SlavesAggregate {
    state: Mutex<SlavesAggregateState>,
}

struct SlavesAggregateState {
    masters: Vec<ConnectionInfo>,
    slaves: Vec<ConnectionInfo>,
    host_port_to_shard: HostPortToShardMap,
    counter: usize,
    abandoned: bool,
}

/// One `CLUSTER SLOTS` entry: a slot interval with its owning endpoints.
struct RawClusterShard {
    slot_min: usize,
    slot_max: usize,
    master: (String, u16),
    slaves: Vec<(String, u16)>,
}

struct ClusterScatter {
    barrier: ScatterContext<Vec<RawClusterShard>>,
    non_cluster: AtomicBool,
}

/// Parses a `SENTINEL MASTERS` / `SENTINEL SLAVES` reply: an array of
/// key/value bulk-string arrays. Rows flagged unhealthy are skipped; any
/// malformed row fails the whole response.
fn parse_sentinel_hosts(data: &Value, password: &Option<String>) -> Option<Vec<ConnectionInfo>> {
    const BAD_FLAGS: [&str; 4] = ["s_down", "o_down", "master_down", "disconnected"];

    let rows = data.as_array()?;
    let mut hosts = Vec::with_capacity(rows.len());
    for row in rows {
        let row = row.as_array()?;
        let mut fields: HashMap<&str, &str> = HashMap::with_capacity(row.len() / 2);
        for pair in row.chunks(2) {
            if pair.len() < 2 {
                return None;
            }
            let (Some(key), Some(value)) = (pair[0].as_str(), pair[1].as_str()) else {
                return None;
            };
            fields.insert(key, value);
        }
        let host = *fields.get("ip")?;
        let port = fields.get("port")?.parse::<u16>().ok()?;
        if let Some(flags) = fields.get("flags")
            && flags.split(',').any(|flag| BAD_FLAGS.contains(&flag))
        {
            debug!("skipping unhealthy instance {host}:{port} (flags={flags})");
            continue;
        }
        let name = fields
            .get("name")
            .map(|name| (*name).to_owned())
            .unwrap_or_else(|| format!("{host}:{port}"));
        hosts.push(ConnectionInfo {
            host: host.to_owned(),
            port,
            password: password.clone(),
            name,
        });
    }
    Some(hosts)
}

/// Parses a `CLUSTER SLOTS` reply:
/// `[[slot_min, slot_max, [master_host, port, ...], [slave_host, port, ...]*]*]`.
/// Any entry failing the shape check fails the whole response.
fn parse_cluster_slots(data: &Value) -> Option<Vec<RawClusterShard>> {
    let entries = data.as_array()?;
    let mut shards = Vec::with_capacity(entries.len());
    for entry in entries {
        let entry = entry.as_array()?;
        if entry.len() < 3 {
            return None;
        }
        let (Some(slot_min), Some(slot_max)) = (entry[0].as_integer(), entry[1].as_integer())
        else {
            return None;
        };
        let mut endpoints = Vec::with_capacity(entry.len() - 2);
        for host_info in &entry[2..] {
            let host_info = host_info.as_array()?;
            if host_info.len() < 2 {
                return None;
            }
            let (Some(host), Some(port)) = (host_info[0].as_str(), host_info[1].as_integer())
            else {
                return None;
            };
            endpoints.push((host.to_owned(), port as u16));
        }
        let master = endpoints.remove(0);
        shards.push(RawClusterShard {
            slot_min: slot_min as usize,
            slot_max: slot_max as usize,
            master,
            slaves: endpoints,
        });
    }
    Some(shards)
}

fn is_non_cluster_error(data: &Value) -> bool {
    matches!(data.error_str(), Some(e) if e.contains("cluster support disabled"))
}

impl SentinelInner {
    /// Sentinel-mode discovery pass: fan `SENTINEL MASTERS` to the pool,
    /// then `SENTINEL SLAVES <name>` per discovered master, with quorum
    /// gating at each step.
    pub(crate) fn read_sentinels(&self) {
        let Some(sentinels) = self.sentinels() else {
            return;
        };
        let password = self.password.clone();
        let context = Arc::new(ScatterContext::<Vec<ConnectionInfo>>::default());
        let weak = self.weak_self.clone();
        let sentinels_pool = sentinels.clone();

        let requests_sent = sentinels.broadcast(|_server_id| {
            let context = context.clone();
            let weak = weak.clone();
            let password = password.clone();
            let sentinels_pool = sentinels_pool.clone();
            Command::new(
                cmd("SENTINEL").arg("MASTERS"),
                Arc::new(move |_command: &CommandPtr, reply| {
                    let parsed = if reply.is_ok() && !reply.data.is_error() {
                        parse_sentinel_hosts(&reply.data, &password)
                    } else {
                        None
                    };
                    if let Some(outcome) = context.on_reply(parsed)
                        && let Some(inner) = weak.upgrade()
                    {
                        inner.on_masters_discovered(&sentinels_pool, outcome);
                    }
                }),
                sentinel_request_control(),
            )
        });
        if let Some(outcome) = context.set_expected(requests_sent) {
            self.on_masters_discovered(&sentinels, outcome);
        }
    }

    fn on_masters_discovered(
        &self,
        sentinels: &Arc<Shard>,
        (parsed, requests_sent, responses_parsed): ScatterOutcome<Vec<ConnectionInfo>>,
    ) {
        if !check_quorum(requests_sent, responses_parsed) {
            warn!(
                "too many 'sentinel masters' requests failed: requests_sent={requests_sent} responses_parsed={responses_parsed}"
            );
            return;
        }

        // first sentinel to report a configured shard wins for that shard
        let mut masters: Vec<ConnectionInfo> = Vec::new();
        let mut host_port_to_shard = HostPortToShardMap::new();
        for info in parsed.into_iter().flatten() {
            if let Some(&shard_idx) = self.shards.get(&info.name)
                && !masters.iter().any(|master| master.name == info.name)
            {
                host_port_to_shard.insert((info.host.clone(), info.port), shard_idx);
                masters.push(info);
            }
        }
        if masters.is_empty() {
            debug!("the sentinel pool reported no configured master");
            return;
        }

        let shard_names: Vec<String> = masters.iter().map(|master| master.name.clone()).collect();
        let aggregate = Arc::new(SlavesAggregate {
            state: Mutex::new(SlavesAggregateState {
                counter: masters.len(),
                masters,
                slaves: Vec::new(),
                host_port_to_shard,
                abandoned: false,
            }),
        });

        for shard_name in shard_names {
            let context = Arc::new(ScatterContext::<Vec<ConnectionInfo>>::default());
            let weak = self.weak_self.clone();
            let password = self.password.clone();
            let aggregate = aggregate.clone();
            let requests_sent = sentinels.broadcast(|_server_id| {
                let context = context.clone();
                let weak = weak.clone();
                let password = password.clone();
                let aggregate = aggregate.clone();
                let shard_name = shard_name.clone();
                Command::new(
                    cmd("SENTINEL")
                        .arg("SLAVES")
                        .arg(Bytes::from(shard_name.clone())),
                    Arc::new(move |_command: &CommandPtr, reply| {
                        let parsed = if reply.is_ok() && !reply.data.is_error() {
                            parse_sentinel_hosts(&reply.data, &password)
                        } else {
                            None
                        };
                        if let Some(outcome) = context.on_reply(parsed)
                            && let Some(inner) = weak.upgrade()
                        {
                            inner.on_slaves_discovered(&aggregate, &shard_name, outcome);
                        }
                    }),
                    sentinel_request_control(),
                )
            });
            if let Some(outcome) = context.set_expected(requests_sent) {
                self.on_slaves_discovered(&aggregate, &shard_name, outcome);
            }
        }
    }

    fn on_slaves_discovered(
        &self,
        aggregate: &Arc<SlavesAggregate>,
        shard_name: &str,
        (parsed, requests_sent, responses_parsed): ScatterOutcome<Vec<ConnectionInfo>>,
    ) {
        if !check_quorum(requests_sent, responses_parsed) {
            warn!(
                "too many 'sentinel slaves' requests failed: requests_sent={requests_sent} responses_parsed={responses_parsed}"
            );
            aggregate.state.lock().unwrap().abandoned = true;
            return;
        }

        let finished = {
            let mut state = aggregate.state.lock().unwrap();
            if state.abandoned {
                return;
            }
            for mut info in parsed.into_iter().flatten() {
                info.name = shard_name.to_owned();
                let Some(&shard_idx) = self.shards.get(&info.name) else {
                    continue;
                };
                state
                    .host_port_to_shard
                    .insert((info.host.clone(), info.port), shard_idx);
                if !state
                    .slaves
                    .iter()
                    .any(|slave| slave.host == info.host && slave.port == info.port)
                {
                    state.slaves.push(info);
                }
            }
            state.counter -= 1;
            if state.counter == 0 {
                Some((
                    std::mem::take(&mut state.masters),
                    std::mem::take(&mut state.slaves),
                    std::mem::take(&mut state.host_port_to_shard),
                ))
            } else {
                None
            }
        };

        if let Some((masters, slaves, host_port_to_shard)) = finished {
            self.shard_info.update(host_port_to_shard);
            {
                let mut snapshots = self.snapshots.lock().unwrap();
                snapshots.masters = masters;
                snapshots.slaves = slaves;
            }
            self.post(LoopEvent::InstancesUpdated);
        }
    }

    /// Cluster-mode discovery pass: fan `CLUSTER SLOTS` to the pool with
    /// the same quorum rule; a "cluster support disabled" answer demotes
    /// the client instead.
    pub(crate) fn read_cluster_hosts(&self) {
        let Some(sentinels) = self.sentinels() else {
            return;
        };
        let scatter = Arc::new(ClusterScatter {
            barrier: ScatterContext::default(),
            non_cluster: AtomicBool::new(false),
        });
        let weak = self.weak_self.clone();

        let requests_sent = sentinels.broadcast(|_server_id| {
            let scatter = scatter.clone();
            let weak = weak.clone();
            Command::new(
                cmd("CLUSTER").arg("SLOTS"),
                Arc::new(move |_command: &CommandPtr, reply| {
                    let parsed = if reply.is_ok() && !reply.data.is_error() {
                        parse_cluster_slots(&reply.data)
                    } else {
                        if is_non_cluster_error(&reply.data) {
                            scatter.non_cluster.store(true, Ordering::SeqCst);
                        }
                        None
                    };
                    if let Some(outcome) = scatter.barrier.on_reply(parsed)
                        && let Some(inner) = weak.upgrade()
                    {
                        inner.on_cluster_hosts_discovered(&scatter, outcome);
                    }
                }),
                sentinel_request_control(),
            )
        });
        if let Some(outcome) = scatter.barrier.set_expected(requests_sent) {
            self.on_cluster_hosts_discovered(&scatter, outcome);
        }
    }

    fn on_cluster_hosts_discovered(
        &self,
        scatter: &ClusterScatter,
        (parsed, requests_sent, responses_parsed): ScatterOutcome<Vec<RawClusterShard>>,
    ) {
        if scatter.non_cluster.load(Ordering::SeqCst) {
            self.cluster_mode_failed.store(true, Ordering::SeqCst);
            self.post(LoopEvent::StateChanged);
            return;
        }
        if !check_quorum(requests_sent, responses_parsed) {
            warn!(
                "too many 'cluster slots' requests failed: requests_sent={requests_sent} responses_parsed={responses_parsed}"
            );
            return;
        }
        // quorum established agreement; the first fully-parsed reply is the
        // topology
        let Some(raw_shards) = parsed.into_iter().next() else {
            return;
        };
        if raw_shards.is_empty() {
            return;
        }

        struct ShardGroup {
            master: (String, u16),
            slaves: Vec<(String, u16)>,
            slot_intervals: Vec<(usize, usize)>,
        }
        let mut groups: Vec<ShardGroup> = Vec::new();
        for raw in raw_shards {
            if let Some(group) = groups.iter_mut().find(|group| group.master == raw.master) {
                group.slot_intervals.push((raw.slot_min, raw.slot_max));
                for slave in raw.slaves {
                    if !group.slaves.contains(&slave) {
                        group.slaves.push(slave);
                    }
                }
            } else {
                groups.push(ShardGroup {
                    master: raw.master,
                    slaves: raw.slaves,
                    slot_intervals: vec![(raw.slot_min, raw.slot_max)],
                });
            }
        }
        groups.sort_by_key(|group| {
            group
                .slot_intervals
                .iter()
                .map(|interval| interval.0)
                .min()
                .unwrap_or(0)
        });
        if groups.len() > self.shard_count() {
            warn!(
                "cluster reports {} shards but only {} are configured",
                groups.len(),
                self.shard_count()
            );
            return;
        }

        let mut masters = Vec::with_capacity(groups.len());
        let mut slaves = Vec::new();
        let mut host_port_to_shard = HostPortToShardMap::new();
        let mut shard_intervals = Vec::new();
        for (shard_idx, group) in groups.into_iter().enumerate() {
            let shard_name = &self.init_shards[shard_idx];
            for (slot_min, slot_max) in &group.slot_intervals {
                shard_intervals.push(ShardInterval::new(*slot_min, *slot_max, shard_idx));
            }
            let (master_host, master_port) = group.master;
            host_port_to_shard.insert((master_host.clone(), master_port), shard_idx);
            masters.push(ConnectionInfo {
                host: master_host,
                port: master_port,
                password: self.password.clone(),
                name: shard_name.clone(),
            });
            for (slave_host, slave_port) in group.slaves {
                host_port_to_shard.insert((slave_host.clone(), slave_port), shard_idx);
                slaves.push(ConnectionInfo {
                    host: slave_host,
                    port: slave_port,
                    password: self.password.clone(),
                    name: shard_name.clone(),
                });
            }
        }
        trace!(
            "cluster topology: {} master(s), {} slave(s), {} interval(s)",
            masters.len(),
            slaves.len(),
            shard_intervals.len()
        );

        self.shard_info.update(host_port_to_shard);
        {
            let mut snapshots = self.snapshots.lock().unwrap();
            snapshots.masters = masters;
            snapshots.slaves = slaves;
        }
        self.post(LoopEvent::InstancesUpdated);

        self.slot_map.update_slots(&shard_intervals);
    }
}
