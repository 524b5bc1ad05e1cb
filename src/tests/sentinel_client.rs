use crate::{
    Error,
    client::sentinel_client::LoopEvent,
    command::{Command, CommandControl},
    network::{RedisWaitConnected, WaitConnectedMode},
    resp::{ReplyStatus, Value, cmd},
    sharding::{ShardInterval, UNKNOWN_SHARD},
    tests::util::{
        ReplyCapture, cluster_client, connect_sentinels, data_reply, sentinel_client,
        server_error_reply, transport_error_reply,
    },
};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

fn map_endpoint(client: &crate::client::SentinelClient, host: &str, port: u16, shard: usize) {
    let mut map = crate::sharding::HostPortToShardMap::new();
    map.insert((host.to_owned(), port), shard);
    client.inner().shard_info.update(map);
}

fn two_shard_slot_map(client: &crate::client::SentinelClient) {
    client.inner().slot_map.update_slots(&[
        ShardInterval::new(0, 8191, 0),
        ShardInterval::new(8192, 16383, 1),
    ]);
}

#[test]
fn route_and_reply() {
    let (client, factory) = cluster_client(2, 1);
    two_shard_slot_map(&client);
    factory.set_script(
        "10.0.1.2",
        6379,
        Arc::new(|command| Some(data_reply(Value::BulkString(bulk_bytes("bar")), command))),
    );
    super::util::add_master(&client, 1, "10.0.1.2", 6379);

    // "foo" hashes to slot 12182, owned by shard 1
    assert_eq!(1, client.shard_by_key(b"foo"));
    let capture = ReplyCapture::new();
    let command = Command::new(cmd("GET").arg("foo"), capture.callback(), CommandControl::default());
    client.async_command(command, b"foo", false);

    assert_eq!(1, capture.count());
    let reply = capture.last().unwrap();
    assert_eq!(ReplyStatus::Ok, reply.status);
    assert_eq!(Value::BulkString(bulk_bytes("bar")), reply.data);
    assert!(reply.time > Duration::ZERO);
}

fn bulk_bytes(s: &str) -> bytes::Bytes {
    bytes::Bytes::copy_from_slice(s.as_bytes())
}

#[test]
fn moved_reroutes_and_restores_one_retry() {
    let (client, factory) = cluster_client(2, 1);
    let event_rx = client.take_event_rx();
    two_shard_slot_map(&client);
    factory.set_script(
        "10.0.1.2",
        6379,
        Arc::new(|command| {
            Some(server_error_reply("MOVED 12182 10.0.0.2:6379", command))
        }),
    );
    factory.set_script(
        "10.0.0.2",
        6379,
        Arc::new(|command| Some(data_reply(Value::BulkString(bulk_bytes("bar")), command))),
    );
    super::util::add_master(&client, 1, "10.0.1.2", 6379);
    super::util::add_master(&client, 0, "10.0.0.2", 6379);
    map_endpoint(&client, "10.0.0.2", 6379, 0);

    let capture = ReplyCapture::new();
    let control = CommandControl {
        max_retries: 2,
        ..CommandControl::default()
    };
    let command = Command::new(cmd("GET").arg("foo"), capture.callback(), control);
    client.async_command(command, b"foo", false);

    // delivered exactly once, from the shard the redirect pointed at
    assert_eq!(1, capture.count());
    assert_eq!(
        Value::BulkString(bulk_bytes("bar")),
        capture.last().unwrap().data
    );
    let old_master = factory.connections_to("10.0.1.2", 6379).remove(0);
    let new_master = factory.connections_to("10.0.0.2", 6379).remove(0);
    assert_eq!(1, old_master.sent_count());
    assert_eq!(1, new_master.sent_count());
    // the restored retry compensates the redirect: the successor still has
    // the full budget
    assert_eq!(2, new_master.sent_at(0).control.max_retries);
    // the redirect requested a slot-table refresh for the source shard
    assert_eq!(1, client.inner().current_slots_shard.load(Ordering::SeqCst));
    let mut saw_slots_request = false;
    if let Some(mut event_rx) = event_rx {
        while let Ok(Some(event)) = event_rx.try_next() {
            if event == LoopEvent::ClusterSlotsRequested {
                saw_slots_request = true;
            }
        }
    }
    assert!(saw_slots_request);
}

#[test]
fn ask_sets_the_asking_flag_and_keeps_the_budget() {
    let (client, factory) = cluster_client(2, 1);
    two_shard_slot_map(&client);
    factory.set_script(
        "10.0.1.2",
        6379,
        Arc::new(|command| Some(server_error_reply("ASK 12182 10.0.0.2:6379", command))),
    );
    factory.set_script(
        "10.0.0.2",
        6379,
        Arc::new(|command| Some(data_reply(Value::BulkString(bulk_bytes("bar")), command))),
    );
    super::util::add_master(&client, 1, "10.0.1.2", 6379);
    super::util::add_master(&client, 0, "10.0.0.2", 6379);
    map_endpoint(&client, "10.0.0.2", 6379, 0);

    let capture = ReplyCapture::new();
    let control = CommandControl {
        max_retries: 1,
        ..CommandControl::default()
    };
    let command = Command::new(cmd("GET").arg("foo"), capture.callback(), control);
    client.async_command(command, b"foo", false);

    assert_eq!(1, capture.count());
    let new_master = factory.connections_to("10.0.0.2", 6379).remove(0);
    assert_eq!(1, new_master.sent_count());
    let successor = new_master.sent_at(0);
    assert!(successor.asking);
    assert_eq!(1, successor.control.max_retries);
}

#[test]
fn nil_reply_on_slave_is_retried_on_master() {
    let (client, factory) = cluster_client(1, 1);
    factory.set_script(
        "10.0.1.1",
        6379,
        Arc::new(|command| Some(data_reply(Value::Nil, command))),
    );
    factory.set_script(
        "10.0.0.1",
        6379,
        Arc::new(|command| Some(data_reply(Value::BulkString(bulk_bytes("bar")), command))),
    );
    super::util::add_slave(&client, 0, "10.0.1.1", 6379);
    super::util::add_master(&client, 0, "10.0.0.1", 6379);

    let capture = ReplyCapture::new();
    let control = CommandControl {
        force_retries_to_master_on_nil_reply: true,
        ..CommandControl::default()
    };
    let command = Command::new(cmd("GET").arg("foo"), capture.callback(), control);
    client.async_command_to_shard(command, 0, false);

    let slave = factory.connections_to("10.0.1.1", 6379).remove(0);
    let master = factory.connections_to("10.0.0.1", 6379).remove(0);
    assert_eq!(1, slave.sent_count());
    assert_eq!(1, master.sent_count());
    assert_eq!(1, capture.count());
    assert_eq!(
        Value::BulkString(bulk_bytes("bar")),
        capture.last().unwrap().data
    );
}

#[test]
fn without_force_flag_a_nil_reply_is_delivered() {
    let (client, factory) = cluster_client(1, 1);
    factory.set_script(
        "10.0.1.1",
        6379,
        Arc::new(|command| Some(data_reply(Value::Nil, command))),
    );
    super::util::add_slave(&client, 0, "10.0.1.1", 6379);
    super::util::add_master(&client, 0, "10.0.0.1", 6379);

    let capture = ReplyCapture::new();
    let command = Command::new(
        cmd("GET").arg("foo"),
        capture.callback(),
        CommandControl::default(),
    );
    client.async_command_to_shard(command, 0, false);

    assert_eq!(1, capture.count());
    assert!(capture.last().unwrap().data.is_nil());
    assert_eq!(0, factory.connections_to("10.0.0.1", 6379)[0].sent_count());
}

#[test]
fn unroutable_command_is_deferred_then_killed_after_deadline() {
    let (client, _factory) = cluster_client(1, 1);
    // no instance anywhere
    let capture = ReplyCapture::new();
    let control = CommandControl {
        timeout_all: Duration::from_millis(20),
        ..CommandControl::default()
    };
    let command = Command::new(cmd("GET").arg("foo"), capture.callback(), control);
    client.async_command_to_shard(command, 0, false);

    assert_eq!(1, client.inner().commands.lock().unwrap().len());
    assert_eq!(0, capture.count());

    // before the deadline the sweep just re-defers
    client.inner().process_waiting_commands();
    assert_eq!(1, client.inner().commands.lock().unwrap().len());
    assert_eq!(0, capture.count());

    std::thread::sleep(Duration::from_millis(30));
    client.inner().process_waiting_commands();
    assert_eq!(0, client.inner().commands.lock().unwrap().len());
    assert_eq!(1, capture.count());
    assert_eq!(ReplyStatus::NotReady, capture.last().unwrap().status);
    assert_eq!(1, client.statistics().redis_not_ready);
}

#[test]
fn batched_command_gets_one_not_ready_reply_per_chunk() {
    let (client, _factory) = cluster_client(1, 1);
    let capture = ReplyCapture::new();
    let control = CommandControl {
        timeout_all: Duration::ZERO,
        ..CommandControl::default()
    };
    let args = cmd("SUBSCRIBE").arg("a").batch(cmd("SUBSCRIBE").arg("b"));
    let command = Command::new(args, capture.callback(), control);
    client.async_command_to_shard(command, 0, false);
    client.inner().process_waiting_commands();

    assert_eq!(2, capture.count());
    assert_eq!(2, client.statistics().redis_not_ready);
}

#[test]
fn transport_errors_consume_the_whole_retry_budget() {
    let (client, factory) = cluster_client(1, 1);
    factory.set_script(
        "10.0.0.1",
        6379,
        Arc::new(|command| Some(transport_error_reply(command))),
    );
    super::util::add_master(&client, 0, "10.0.0.1", 6379);

    let capture = ReplyCapture::new();
    let control = CommandControl {
        max_retries: 3,
        ..CommandControl::default()
    };
    let command = Command::new(cmd("GET").arg("foo"), capture.callback(), control);
    client.async_command_to_shard(command, 0, true);

    let master = factory.connections_to("10.0.0.1", 6379).remove(0);
    assert_eq!(3, master.sent_count());
    assert_eq!(1, capture.count());
    assert_eq!(ReplyStatus::Error, capture.last().unwrap().status);
    // the deadline shrinks hop by hop
    assert!(
        master.sent_at(1).control.timeout_all <= master.sent_at(0).control.timeout_all
    );
}

#[test]
fn expired_deadline_suppresses_retries() {
    let (client, factory) = cluster_client(1, 1);
    factory.set_script(
        "10.0.0.1",
        6379,
        Arc::new(|command| Some(transport_error_reply(command))),
    );
    super::util::add_master(&client, 0, "10.0.0.1", 6379);

    let capture = ReplyCapture::new();
    let control = CommandControl {
        max_retries: 5,
        timeout_all: Duration::ZERO,
        ..CommandControl::default()
    };
    let command = Command::new(cmd("GET").arg("foo"), capture.callback(), control);
    client.async_command_to_shard(command, 0, true);

    let master = factory.connections_to("10.0.0.1", 6379).remove(0);
    assert_eq!(1, master.sent_count());
    assert_eq!(1, capture.count());
}

#[test]
fn stale_reply_is_dropped_after_a_redirect() {
    let (client, factory) = cluster_client(1, 1);
    // no scripted reply: the test drives completions by hand
    factory.set_default_script(Arc::new(|_command| None));
    super::util::add_master(&client, 0, "10.0.0.1", 6379);

    let capture = ReplyCapture::new();
    let command = Command::new(
        cmd("GET").arg("foo"),
        capture.callback(),
        CommandControl::default(),
    );
    client.async_command_to_shard(command, 0, true);

    let master = factory.connections_to("10.0.0.1", 6379).remove(0);
    assert_eq!(1, master.sent_count());
    let first_attempt = master.sent_at(0);

    // an unmapped MOVED target keeps the command on the same shard
    Command::complete(
        &first_attempt,
        server_error_reply("MOVED 12182 10.9.9.9:7009", &first_attempt),
    );
    assert_eq!(2, master.sent_count());
    assert_eq!(0, capture.count());

    // a late duplicate answer to the superseded attempt must be ignored
    Command::complete(
        &first_attempt,
        data_reply(Value::BulkString(bulk_bytes("old")), &first_attempt),
    );
    assert_eq!(2, master.sent_count());
    assert_eq!(0, capture.count());

    let second_attempt = master.sent_at(1);
    Command::complete(
        &second_attempt,
        data_reply(Value::BulkString(bulk_bytes("new")), &second_attempt),
    );
    assert_eq!(1, capture.count());
    assert_eq!(
        Value::BulkString(bulk_bytes("new")),
        capture.last().unwrap().data
    );
}

#[test]
fn readonly_error_is_retried() {
    let (client, factory) = cluster_client(1, 1);
    let failed_once = Arc::new(AtomicBool::new(false));
    factory.set_script(
        "10.0.1.1",
        6379,
        Arc::new({
            let failed_once = failed_once.clone();
            move |command| {
                if failed_once.swap(true, Ordering::SeqCst) {
                    Some(data_reply(Value::BulkString(bulk_bytes("bar")), command))
                } else {
                    Some(server_error_reply(
                        "READONLY You can't write against a read only replica.",
                        command,
                    ))
                }
            }
        }),
    );
    super::util::add_slave(&client, 0, "10.0.1.1", 6379);
    super::util::add_master(&client, 0, "10.0.0.1", 6379);

    let capture = ReplyCapture::new();
    let command = Command::new(
        cmd("SET").arg("foo").arg("bar"),
        capture.callback(),
        CommandControl::default(),
    );
    client.async_command_to_shard(command, 0, false);

    assert_eq!(1, capture.count());
    assert_eq!(ReplyStatus::Ok, capture.last().unwrap().status);
}

#[test]
fn cluster_fallback_switches_to_crc32_sharding() {
    let factory = super::util::FakeFactory::new();
    let config = crate::client::SentinelConfig::new(
        super::util::shard_names(3),
        super::util::sentinel_conns(1),
    )
    .with_password("secret");
    let client = crate::client::SentinelClient::new(config, factory.clone()).unwrap();
    factory.set_default_script(Arc::new(|command| {
        Some(server_error_reply(
            "ERR This instance has cluster support disabled",
            command,
        ))
    }));

    let demoted = Arc::new(AtomicBool::new(false));
    client.signal_not_in_cluster_mode().connect({
        let demoted = demoted.clone();
        move |_| demoted.store(true, Ordering::SeqCst)
    });

    assert!(client.is_in_cluster_mode());
    {
        let conns = client.inner().conns.lock().unwrap();
        assert!(conns.iter().all(|conn| conn.password.is_some()));
    }

    connect_sentinels(&client);
    client.inner().read_cluster_hosts();
    client.inner().check_connections();

    assert!(!client.is_in_cluster_mode());
    assert!(demoted.load(Ordering::SeqCst));
    {
        let conns = client.inner().conns.lock().unwrap();
        assert!(conns.iter().all(|conn| conn.password.is_none()));
    }
    // commands now route through the fallback key shard
    for key in [b"foo".as_slice(), b"bar", b"baz"] {
        assert!(client.shard_by_key(key) < 3);
    }
    // the demotion is permanent
    client.inner().check_connections();
    assert!(!client.is_in_cluster_mode());
}

#[test]
fn subscriber_fallback_uses_shard_zero() {
    let factory = super::util::FakeFactory::new();
    let config = crate::client::SentinelConfig::new(
        super::util::shard_names(3),
        super::util::sentinel_conns(1),
    )
    .subscriber(true);
    let client = crate::client::SentinelClient::new(config, factory.clone()).unwrap();
    factory.set_default_script(Arc::new(|command| {
        Some(server_error_reply(
            "ERR This instance has cluster support disabled",
            command,
        ))
    }));
    connect_sentinels(&client);
    client.inner().read_cluster_hosts();
    client.inner().check_connections();

    assert!(!client.is_in_cluster_mode());
    for key in [b"foo".as_slice(), b"bar", b"baz"] {
        assert_eq!(0, client.shard_by_key(key));
    }
}

#[test]
fn unknown_shard_routes_to_shard_zero() {
    let (client, factory) = cluster_client(2, 1);
    factory.set_script(
        "10.0.0.1",
        6379,
        Arc::new(|command| Some(data_reply(Value::Status("PONG".to_owned()), command))),
    );
    super::util::add_master(&client, 0, "10.0.0.1", 6379);

    // slot table not initialized: the key resolves to the unknown shard
    assert_eq!(UNKNOWN_SHARD, client.shard_by_key(b"foo"));
    let capture = ReplyCapture::new();
    let command = Command::new(cmd("PING"), capture.callback(), CommandControl::default());
    client.async_command(command, b"foo", true);

    assert_eq!(1, capture.count());
    assert_eq!(1, factory.connections_to("10.0.0.1", 6379)[0].sent_count());
}

#[test]
fn wait_connected_once_honors_fail_on_timeout() {
    let (client, _factory) = cluster_client(1, 1);
    let result = client.wait_connected_once(RedisWaitConnected {
        mode: WaitConnectedMode::Master,
        fail_on_timeout: true,
        timeout: Duration::from_millis(20),
    });
    assert!(matches!(result, Err(Error::NotConnected(_))));

    // degraded start only logs
    let result = client.wait_connected_once(RedisWaitConnected {
        mode: WaitConnectedMode::Master,
        fail_on_timeout: false,
        timeout: Duration::from_millis(20),
    });
    assert!(result.is_ok());
}

#[test]
fn wait_connected_once_passes_when_ready() {
    let (client, _factory) = cluster_client(1, 1);
    super::util::add_master(&client, 0, "10.0.0.1", 6379);
    client
        .inner()
        .slot_map
        .update_slots(&[ShardInterval::new(0, 16383, 0)]);

    let result = client.wait_connected_once(RedisWaitConnected {
        mode: WaitConnectedMode::Master,
        fail_on_timeout: true,
        timeout: Duration::from_millis(100),
    });
    assert!(result.is_ok());
}

#[test]
fn keyed_helpers_are_rejected_in_cluster_mode() {
    let (client, _factory) = cluster_client(1, 1);
    assert!(matches!(
        client.generate_keys_for_shards(4),
        Err(Error::Client(_))
    ));
    assert!(matches!(client.any_key_for_shard(0), Err(Error::Client(_))));
}

#[test]
fn keyed_helpers_work_in_sentinel_mode() {
    let (client, _factory) = sentinel_client(3, 1);
    // keys were generated at construction for the CRC-32 strategy
    for shard_idx in 0..3 {
        let key = client.any_key_for_shard(shard_idx).unwrap();
        assert_eq!(shard_idx, client.shard_by_key(key.as_bytes()));
    }
}

#[test]
fn available_servers_include_the_master_on_request() {
    let (client, _factory) = cluster_client(1, 1);
    super::util::add_master(&client, 0, "10.0.0.1", 6379);
    super::util::add_slave(&client, 0, "10.0.1.1", 6379);

    let control = CommandControl::default();
    assert_eq!(1, client.available_servers_weighted(0, false, &control).len());
    assert_eq!(2, client.available_servers_weighted(0, true, &control).len());
}

#[test]
fn statistics_expose_shard_instances() {
    let (client, _factory) = cluster_client(2, 1);
    super::util::add_master(&client, 0, "10.0.0.1", 6379);

    let statistics = client.statistics();
    assert_eq!(0, statistics.redis_not_ready);
    assert_eq!(1, statistics.masters["shard0"].instances.len());
    assert_eq!(0, statistics.masters["shard1"].instances.len());
}

#[test]
fn stop_kills_deferred_commands() {
    let (client, _factory) = cluster_client(1, 1);
    let capture = ReplyCapture::new();
    let command = Command::new(
        cmd("GET").arg("foo"),
        capture.callback(),
        CommandControl::default(),
    );
    client.async_command_to_shard(command, 0, false);
    assert_eq!(0, capture.count());

    client.stop();
    assert_eq!(1, capture.count());
    assert_eq!(ReplyStatus::NotReady, capture.last().unwrap().status);
}
