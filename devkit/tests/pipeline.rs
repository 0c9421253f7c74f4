//! End-to-end pipeline tests: scripted devices -> queue -> publisher -> stub broker

use forgeedge_devkit::test_utils::HarnessSettings;
use forgeedge_devkit::{ConfigBuilder, DeviceBuilder, TestHarness};
use forgeedge_gateway::field::RegisterKind;
use forgeedge_gateway::publisher::ConnectionState;
use forgeedge_gateway::store::load_startup_config;
use forgeedge_gateway::QueueItem;
use std::time::Duration;

fn tank1() -> DeviceBuilder {
    DeviceBuilder::new("tank1", "10.0.0.5").parameter("level", "holding", 10, 1, 0.1)
}

fn payloads(harness: &TestHarness, topic: &str) -> Vec<String> {
    harness
        .broker
        .find_messages_by_topic(topic)
        .into_iter()
        .map(|msg| String::from_utf8(msg.payload).unwrap())
        .collect()
}

#[tokio::test]
async fn test_tank1_level_is_scaled() {
    let mut harness = TestHarness::new().unwrap();
    harness.bus.set_registers("10.0.0.5", 10, &[250]);
    harness.start(&ConfigBuilder::new("edge-01").device(tank1())).unwrap();

    let messages = harness
        .wait_for_messages("forgeedge/edge-01/tank1/data", 1, 2000)
        .await
        .unwrap();
    let record = &messages[0];
    assert_eq!(record["edge_id"], "edge-01");
    assert_eq!(record["io_device_id"], "tank1");
    assert!(record["timestamp"].as_i64().unwrap() > 0);

    let entry = &record["data"][0];
    assert_eq!(entry["name"], "level");
    assert_eq!(entry["type"], "holding");
    assert!((entry["value"].as_f64().unwrap() - 25.0).abs() < 1e-9);

    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_type_omitted_and_zero_count_reads_one() {
    let mut harness = TestHarness::new().unwrap();
    harness.bus.set_registers("10.0.0.5", 0, &[1, 2, 3]);
    let device = DeviceBuilder::new("tank1", "10.0.0.5")
        .parameter("mystery", "float32", 0, 2, 1.0)
        .parameter("level", "holding", 1, 0, 1.0);
    harness.start(&ConfigBuilder::new("edge-01").device(device)).unwrap();

    let messages = harness
        .wait_for_messages("forgeedge/edge-01/tank1/data", 1, 2000)
        .await
        .unwrap();
    harness.shutdown().await.unwrap();

    let data = messages[0]["data"].as_array().unwrap();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0]["name"], "level");
    assert_eq!(data[0]["value"], 2.0);

    let reads = harness.bus.reads();
    assert!(reads.iter().all(|r| r.kind == RegisterKind::HoldingRegister && r.count == 1));
}

#[tokio::test]
async fn test_raw_mode_and_bit_payloads() {
    let mut harness = TestHarness::new().unwrap();
    harness.bus.set_registers("10.0.0.7", 0, &[1, 0, 300, 400]);
    let device = DeviceBuilder::new("press", "10.0.0.7")
        .parameter("running", "coils", 0, 1, 1.0)
        .parameter("alarms", "discrete_inputs", 0, 2, 1.0)
        .parameter("pressure", "input_registers", 2, 2, 0.5);
    harness
        .start(&ConfigBuilder::new("edge-01").data_mode("raw").device(device))
        .unwrap();

    let messages = harness
        .wait_for_messages("forgeedge/edge-01/press/data", 1, 2000)
        .await
        .unwrap();
    harness.shutdown().await.unwrap();

    let data = &messages[0]["data"];
    assert_eq!(data[0]["type"], "coil");
    assert_eq!(data[0]["raw"], 1);
    assert_eq!(data[1]["type"], "discrete");
    assert_eq!(data[1]["raw"], serde_json::json!([1, 0]));
    assert_eq!(data[2]["type"], "input");
    assert_eq!(data[2]["raw"], serde_json::json!([300, 400]));
    assert!(data[2].get("value").is_none());
}

#[tokio::test]
async fn test_in_flight_item_retried_once_after_loss() {
    let mut harness = TestHarness::new().unwrap();
    for n in 0..10 {
        harness
            .queue
            .enqueue(QueueItem::new("forgeedge/edge-01/seq/data", n.to_string()))
            .await
            .unwrap();
    }
    harness.broker.fail_publishes(1);
    harness.start(&ConfigBuilder::new("edge-01")).unwrap();

    harness
        .wait_for_messages("forgeedge/edge-01/seq/data", 10, 2000)
        .await
        .unwrap();
    let stats = harness.stats().unwrap();
    harness.shutdown().await.unwrap();

    let expected: Vec<String> = (0..10).map(|n| n.to_string()).collect();
    assert_eq!(payloads(&harness, "forgeedge/edge-01/seq/data"), expected);
    assert_eq!(harness.broker.publish_attempts(), 11);
    assert_eq!(stats.failed(), 1);
    assert_eq!(stats.losses(), 1);
    assert_eq!(stats.connects(), 2);
}

#[tokio::test]
async fn test_reconnects_after_connection_drop() {
    let mut harness = TestHarness::new().unwrap();
    harness.start(&ConfigBuilder::new("edge-01").device(tank1())).unwrap();
    let stats = harness.stats().unwrap();

    harness.wait_for_state(ConnectionState::Connected, 1000).await.unwrap();
    harness.broker.drop_connection().unwrap();
    harness
        .wait_until("second session", 2000, || stats.connects() >= 2)
        .await
        .unwrap();

    // Telemetry keeps flowing on the new session
    let before = harness.broker.find_messages_by_topic("forgeedge/edge-01/tank1/data").len();
    harness
        .wait_for_messages("forgeedge/edge-01/tank1/data", before + 2, 2000)
        .await
        .unwrap();
    assert_eq!(stats.losses(), 1);
    assert_eq!(harness.broker.get_subscriptions().len(), 2);

    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_connect_retried_at_fixed_interval() {
    let mut harness = TestHarness::new().unwrap();
    harness.broker.refuse_connects(3);
    harness.start(&ConfigBuilder::new("edge-01").device(tank1())).unwrap();

    harness.wait_for_state(ConnectionState::Connected, 2000).await.unwrap();
    harness
        .wait_for_messages("forgeedge/edge-01/tank1/data", 1, 2000)
        .await
        .unwrap();
    assert_eq!(harness.stats().unwrap().connects(), 1);

    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_device_is_retried() {
    let mut harness = TestHarness::new().unwrap();
    harness.bus.refuse_connects("10.0.0.5", 2);
    harness.bus.set_registers("10.0.0.5", 10, &[100]);
    harness.start(&ConfigBuilder::new("edge-01").device(tank1())).unwrap();

    let messages = harness
        .wait_for_messages("forgeedge/edge-01/tank1/data", 1, 2000)
        .await
        .unwrap();
    assert!((messages[0]["data"][0]["value"].as_f64().unwrap() - 10.0).abs() < 1e-9);
    assert_eq!(harness.bus.connects("10.0.0.5"), 1);

    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_reads_publish_entries_without_value() {
    let mut harness = TestHarness::new().unwrap();
    harness.bus.fail_reads("10.0.0.5", true);
    harness.start(&ConfigBuilder::new("edge-01").device(tank1())).unwrap();

    let messages = harness
        .wait_for_messages("forgeedge/edge-01/tank1/data", 2, 2000)
        .await
        .unwrap();
    assert_eq!(
        messages[0]["data"][0],
        serde_json::json!({ "name": "level", "type": "holding" })
    );
    // An I/O read failure drops the link, so every cycle reconnects
    assert!(harness.bus.connects("10.0.0.5") >= 2);

    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reconfigure_device_set() {
    let mut harness = TestHarness::new().unwrap();
    let a = DeviceBuilder::new("A", "10.0.1.1").parameter("v", "holding", 0, 1, 1.0);
    let b = DeviceBuilder::new("B", "10.0.1.2").parameter("v", "holding", 0, 1, 1.0);
    let c = DeviceBuilder::new("C", "10.0.1.3").parameter("v", "holding", 0, 1, 1.0);

    harness
        .start(&ConfigBuilder::new("edge-01").device(a).device(b.clone()))
        .unwrap();
    harness.wait_for_messages("forgeedge/edge-01/A/data", 1, 2000).await.unwrap();
    harness.wait_for_messages("forgeedge/edge-01/B/data", 1, 2000).await.unwrap();
    assert_eq!(harness.bus.connects("10.0.1.2"), 1);

    harness
        .send_config(&ConfigBuilder::new("edge-01").device(b).device(c))
        .unwrap();
    let stats = harness.stats().unwrap();
    harness
        .wait_until("configuration applied", 2000, || stats.applied() == 1)
        .await
        .unwrap();

    // A was joined before apply returned: no read of A after this point
    let reads_of_a = harness.bus.reads_for("10.0.1.1");
    harness.wait_for_messages("forgeedge/edge-01/C/data", 1, 2000).await.unwrap();
    let bus = harness.bus.clone();
    harness
        .wait_until("B restarted", 2000, || bus.connects("10.0.1.2") == 2)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.bus.reads_for("10.0.1.1"), reads_of_a);

    assert_eq!(harness.live_config().unwrap().device_ids(), vec!["B", "C"]);
    assert_eq!(harness.store.writes(), 1);
    assert_eq!(harness.broker.sessions().len(), 1);

    let coordinator = harness.shutdown().await.unwrap();
    assert!(coordinator.pool().is_empty());
}

#[tokio::test]
async fn test_rejected_configuration_changes_nothing() {
    let mut harness = TestHarness::new().unwrap();
    harness.start(&ConfigBuilder::new("edge-01").device(tank1())).unwrap();
    harness
        .wait_for_messages("forgeedge/edge-01/tank1/data", 1, 2000)
        .await
        .unwrap();
    let before = harness.live_config().unwrap();

    harness.send_control(b"{ this is not json".to_vec()).unwrap();
    let stats = harness.stats().unwrap();
    harness
        .wait_until("rejection", 2000, || stats.rejected() == 1)
        .await
        .unwrap();

    assert_eq!(harness.live_config().unwrap(), before);
    assert_eq!(harness.store.writes(), 0);
    assert_eq!(harness.bus.connects("10.0.0.5"), 1);
    assert_eq!(harness.broker.sessions().len(), 1);

    // Telemetry continues uninterrupted
    let seen = harness.broker.find_messages_by_topic("forgeedge/edge-01/tank1/data").len();
    harness
        .wait_for_messages("forgeedge/edge-01/tank1/data", seen + 2, 2000)
        .await
        .unwrap();

    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_empty_device_list_suspends_polling() {
    let mut harness = TestHarness::new().unwrap();
    harness.start(&ConfigBuilder::new("edge-01").device(tank1())).unwrap();
    harness
        .wait_for_messages("forgeedge/edge-01/tank1/data", 1, 2000)
        .await
        .unwrap();

    harness.send_config(&ConfigBuilder::new("edge-01")).unwrap();
    let stats = harness.stats().unwrap();
    harness
        .wait_until("configuration applied", 2000, || stats.applied() == 1)
        .await
        .unwrap();

    let reads = harness.bus.reads_for("10.0.0.5");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.bus.reads_for("10.0.0.5"), reads);
    assert!(harness.live_config().unwrap().io_devices.is_empty());

    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_broker_change_recreates_session() {
    let mut harness = TestHarness::new().unwrap();
    harness.start(&ConfigBuilder::new("edge-01").device(tank1())).unwrap();
    harness.wait_for_state(ConnectionState::Connected, 1000).await.unwrap();

    harness
        .send_config(&ConfigBuilder::new("edge-01").broker("other.local", 8883).device(tank1()))
        .unwrap();
    let broker = harness.broker.clone();
    harness
        .wait_until("second session", 2000, || broker.sessions().len() == 2)
        .await
        .unwrap();
    assert_eq!(
        harness.broker.sessions(),
        vec!["broker.local:1883", "other.local:8883"]
    );

    let seen = harness.broker.find_messages_by_topic("forgeedge/edge-01/tank1/data").len();
    harness
        .wait_for_messages("forgeedge/edge-01/tank1/data", seen + 1, 2000)
        .await
        .unwrap();

    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_configuration_without_id_keeps_identity() {
    let mut harness = TestHarness::new().unwrap();
    harness.start(&ConfigBuilder::new("edge-01")).unwrap();
    harness.wait_for_state(ConnectionState::Connected, 1000).await.unwrap();

    harness
        .send_config(&ConfigBuilder::new("ignored").without("forge_edge_id").device(tank1()))
        .unwrap();
    harness
        .wait_for_messages("forgeedge/edge-01/tank1/data", 1, 2000)
        .await
        .unwrap();
    assert_eq!(harness.live_config().unwrap().forge_edge_id, "edge-01");

    // A restart from the stored document publishes under the same identity
    let restarted = load_startup_config(harness.store.as_ref(), Some("SN-0042")).await;
    assert_eq!(restarted.forge_edge_id, "edge-01");
    assert_eq!(restarted.device_ids(), vec!["tank1"]);

    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_persist_failure_still_activates() {
    let mut harness = TestHarness::new().unwrap();
    harness.start(&ConfigBuilder::new("edge-01").device(tank1())).unwrap();
    harness
        .wait_for_messages("forgeedge/edge-01/tank1/data", 1, 2000)
        .await
        .unwrap();

    harness.store.fail_writes(true);
    let c = DeviceBuilder::new("C", "10.0.1.3")
        .poll_interval_ms(50)
        .parameter("v", "holding", 0, 1, 1.0);
    harness
        .send_config(&ConfigBuilder::new("edge-01").device(tank1()).device(c))
        .unwrap();

    harness.wait_for_messages("forgeedge/edge-01/C/data", 1, 2000).await.unwrap();
    let stats = harness.stats().unwrap();
    assert_eq!(stats.applied(), 1);
    assert_eq!(stats.rejected(), 0);
    assert_eq!(harness.store.writes(), 0);
    assert_eq!(harness.live_config().unwrap().device_ids(), vec!["tank1", "C"]);

    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_drains_backlog() {
    let mut harness = TestHarness::new().unwrap();
    harness.broker.refuse_connects(usize::MAX);
    harness.start(&ConfigBuilder::new("edge-01").device(tank1())).unwrap();
    let stats = harness.stats().unwrap();

    let queue = harness.queue.clone();
    harness
        .wait_until("backlog", 2000, || queue.len() >= 3)
        .await
        .unwrap();

    harness.broker.refuse_connects(0);
    let coordinator = harness.shutdown().await.unwrap();

    assert!(coordinator.pool().is_empty());
    assert!(harness.queue.is_empty());
    assert!(harness.queue.is_stopped());
    assert!(harness.broker.find_messages_by_topic("forgeedge/edge-01/tank1/data").len() >= 3);
    assert_eq!(stats.abandoned(), 0);
    assert!(stats.delivered() >= 3);
}

#[tokio::test]
async fn test_backpressure_and_drain_timeout() {
    let settings = HarnessSettings {
        queue_capacity: 2,
        drain_timeout: Duration::from_millis(200),
        ..HarnessSettings::default()
    };
    let mut harness = TestHarness::with_settings(settings).unwrap();
    harness.broker.refuse_connects(usize::MAX);
    harness.start(&ConfigBuilder::new("edge-01").device(tank1())).unwrap();
    let stats = harness.stats().unwrap();

    let queue = harness.queue.clone();
    harness.wait_until("full queue", 2000, || queue.len() == 2).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.queue.len(), 2);

    let started = tokio::time::Instant::now();
    harness.shutdown().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(stats.abandoned(), 2);
    assert_eq!(stats.delivered(), 0);
}
