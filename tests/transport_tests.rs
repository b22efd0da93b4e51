//! Transport behaviour against the mock adapter and broker.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use rs_softstart::config::{BluetoothConfig, MqttConfig};
use rs_softstart::hal::{event_log, MockAudit, MockMqttConnector, MockSppAdapter};
use rs_softstart::protocol::{encode_speed, MotorCommand};
use rs_softstart::traits::{
    BluetoothDevice, ConnectionState, MotorController, MqttClient, TransportError,
};
use rs_softstart::transport::TELEMETRY_LEAVES;
use rs_softstart::{BluetoothTransport, MqttTransport, TransportKind, TransportManager};

fn bt_config() -> BluetoothConfig {
    BluetoothConfig::default()
        .with_connect_attempts(3)
        .with_retry_delay_ms(1000)
        .with_step_delay_ms(10)
}

fn device() -> BluetoothDevice {
    BluetoothDevice::new(Some("ESP32-SoftStart"), "AA:BB:CC:DD:EE:FF")
}

// ============================================================================
// Bluetooth
// ============================================================================

#[tokio::test(start_paused = true)]
async fn bluetooth_retries_then_connects() {
    let adapter = Arc::new(MockSppAdapter::new());
    adapter.fail_next_opens(2);
    let transport = BluetoothTransport::new(Arc::clone(&adapter), bt_config()).with_device(device());

    let started = tokio::time::Instant::now();
    transport.connect().await.unwrap();

    assert_eq!(adapter.open_attempts(), 3);
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(transport.is_connected());
}

#[tokio::test(start_paused = true)]
async fn bluetooth_gives_up_after_configured_attempts() {
    let adapter = Arc::new(MockSppAdapter::new());
    adapter.fail_next_opens(10);
    let transport = BluetoothTransport::new(Arc::clone(&adapter), bt_config()).with_device(device());

    let err = transport.connect().await.unwrap_err();
    assert!(matches!(err, TransportError::Connect(_)));
    assert_eq!(adapter.open_attempts(), 3);
    assert!(matches!(transport.connection_state(), ConnectionState::Error(_)));
}

#[tokio::test]
async fn bluetooth_requires_a_device() {
    let adapter = Arc::new(MockSppAdapter::new());
    let transport = BluetoothTransport::new(adapter, bt_config());
    assert_eq!(transport.connect().await, Err(TransportError::NoDevice));
    assert_eq!(transport.send_stop().await, Err(TransportError::NotConnected));
}

#[tokio::test(start_paused = true)]
async fn bluetooth_streams_soft_start_tokens_in_order() {
    let adapter = Arc::new(MockSppAdapter::new());
    let transport = BluetoothTransport::new(Arc::clone(&adapter), bt_config()).with_device(device());
    transport.connect().await.unwrap();
    let mut peer = adapter.take_peer().unwrap();

    transport
        .send_soft_start([50, 100, 150, 200, 250, 300])
        .await
        .unwrap();
    transport.send_stop().await.unwrap();

    let expected = "50a100b150c200d250e254f0p";
    let mut buf = vec![0u8; expected.len()];
    peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(String::from_utf8(buf).unwrap(), expected);
}

#[tokio::test]
async fn bluetooth_reads_drive_speed_and_status() {
    let adapter = Arc::new(MockSppAdapter::new());
    let transport = BluetoothTransport::new(Arc::clone(&adapter), bt_config()).with_device(device());

    let speed = Arc::new(AtomicI32::new(-1));
    let status = Arc::new(Mutex::new(String::new()));
    let s = Arc::clone(&speed);
    transport.on_speed(move |v| s.store(v, Ordering::SeqCst));
    let st = Arc::clone(&status);
    transport.on_status(move |v| *st.lock() = v.to_string());

    transport.connect().await.unwrap();
    let mut peer = adapter.take_peer().unwrap();
    peer.write_all(&[encode_speed(120).unwrap()]).await.unwrap();

    for _ in 0..100 {
        if speed.load(Ordering::SeqCst) == 120 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(speed.load(Ordering::SeqCst), 120);
    assert_eq!(*status.lock(), "running");

    // Peer hang-up ends the session
    drop(peer);
    let mut state = transport.subscribe_state();
    state
        .wait_for(|s| *s == ConnectionState::Disconnected)
        .await
        .unwrap();
}

#[tokio::test]
async fn bluetooth_discovery_dedups_and_cancels() {
    let adapter = Arc::new(MockSppAdapter::new());
    let transport = BluetoothTransport::new(Arc::clone(&adapter), bt_config());

    let found = Arc::new(Mutex::new(Vec::new()));
    let f = Arc::clone(&found);
    let discovery = transport
        .discover(move |d| f.lock().push(d.address.clone()))
        .await
        .unwrap();

    assert!(adapter.emit_device("ESP32-A", "11:11:11:11:11:11"));
    assert!(adapter.emit_device("ESP32-A", "11:11:11:11:11:11"));
    assert!(adapter.emit_device("ESP32-B", "22:22:22:22:22:22"));

    let mut devices = discovery.subscribe();
    devices.wait_for(|d| d.len() == 2).await.unwrap();

    discovery.cancel();
    discovery.finished().await;
    assert!(!adapter.is_discovering());
    assert_eq!(adapter.discovery_stops(), 1);

    // Late events are not reported
    assert!(!adapter.emit_device("ESP32-C", "33:33:33:33:33:33"));
    assert_eq!(found.lock().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn bluetooth_connect_recovers_from_abandoned_attempt() {
    let adapter = Arc::new(MockSppAdapter::new());
    adapter.fail_next_opens(1);
    let transport = BluetoothTransport::new(Arc::clone(&adapter), bt_config()).with_device(device());

    // Gives up while waiting out the first retry delay
    let abandoned = tokio::time::timeout(Duration::from_millis(500), transport.connect()).await;
    assert!(abandoned.is_err());
    assert_eq!(transport.connection_state(), ConnectionState::Disconnected);

    transport.connect().await.unwrap();
    assert!(transport.is_connected());
    assert_eq!(adapter.open_attempts(), 2);
}

// ============================================================================
// MQTT
// ============================================================================

#[tokio::test]
async fn mqtt_subscribes_six_leaves_and_switches_device() {
    let connector = Arc::new(MockMqttConnector::new());
    let transport = MqttTransport::new(Arc::clone(&connector), MqttConfig::default());
    transport.connect().await.unwrap();

    let client = connector.client();
    assert_eq!(client.subscriptions().len(), 6);
    assert!(client.is_subscribed("motor/esp32_001/speed"));

    transport.set_device_id("esp32_002").await.unwrap();
    let subscriptions = client.subscriptions();
    assert_eq!(subscriptions.len(), 6);
    assert!(subscriptions.iter().all(|t| t.starts_with("motor/esp32_002/")));
    assert_eq!(transport.subscribed_topics().len(), 6);

    transport.send_continuous().await.unwrap();
    assert_eq!(client.published_to("motor/esp32_002/command"), vec!["0i"]);
    assert_eq!(client.published_to("motor/esp32_002/type"), vec!["continuo"]);
    assert!(client.published_to("motor/esp32_001/command").is_empty());
}

#[tokio::test]
async fn mqtt_telemetry_reaches_callbacks() {
    let connector = Arc::new(MockMqttConnector::new());
    let transport = MqttTransport::new(Arc::clone(&connector), MqttConfig::default());
    let current = Arc::new(Mutex::new(None));
    let c = Arc::clone(&current);
    transport.on_current(move |v| *c.lock() = Some(v));
    transport.connect().await.unwrap();

    assert!(connector.inject("motor/esp32_001/current", "1.25"));
    for _ in 0..100 {
        if current.lock().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(*current.lock(), Some(1.25));

    connector.drop_connection();
    let mut state = transport.subscribe_state();
    state
        .wait_for(|s| *s == ConnectionState::Disconnected)
        .await
        .unwrap();
    assert_eq!(
        transport.send_stop().await,
        Err(TransportError::NotConnected)
    );
}

#[tokio::test]
async fn mqtt_rejects_overlapping_connects() {
    let connector = Arc::new(MockMqttConnector::new());
    let gate = connector.hold_connects();
    let transport = Arc::new(MqttTransport::new(
        Arc::clone(&connector),
        MqttConfig::default(),
    ));

    let first = tokio::spawn({
        let transport = Arc::clone(&transport);
        async move { transport.connect().await }
    });
    while connector.connect_count() == 0 {
        tokio::task::yield_now().await;
    }

    assert_eq!(
        transport.connect().await,
        Err(TransportError::AlreadyConnecting)
    );
    gate.notify_one();
    first.await.unwrap().unwrap();
    assert_eq!(connector.connect_count(), 1);
}

#[tokio::test]
async fn mqtt_connect_recovers_from_abandoned_attempt() {
    let connector = Arc::new(MockMqttConnector::new());
    connector.hold_connects();
    let transport = MqttTransport::new(Arc::clone(&connector), MqttConfig::default());

    let abandoned = tokio::time::timeout(Duration::from_millis(20), transport.connect()).await;
    assert!(abandoned.is_err());
    assert_eq!(transport.connection_state(), ConnectionState::Disconnected);

    connector.release_connects();
    transport.connect().await.unwrap();
    assert!(transport.is_connected());
    assert_eq!(connector.connect_count(), 2);
}

#[tokio::test]
async fn mqtt_disconnect_drops_every_subscription() {
    let connector = Arc::new(MockMqttConnector::new());
    let transport = MqttTransport::new(Arc::clone(&connector), MqttConfig::default());
    transport.connect().await.unwrap();
    let client = connector.client();
    assert_eq!(client.subscriptions().len(), 6);

    transport.disconnect().await;
    assert!(client.subscriptions().is_empty());
    assert!(transport.subscribed_topics().is_empty());
    assert!(!client.is_connected());
    assert_eq!(transport.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn mqtt_device_switch_is_all_or_nothing() {
    let connector = Arc::new(MockMqttConnector::new());
    let transport = MqttTransport::new(Arc::clone(&connector), MqttConfig::default());
    transport.connect().await.unwrap();
    let client = connector.client();
    client.refuse_subscription("motor/esp32_002/current");

    assert!(matches!(
        transport.set_device_id("esp32_002").await,
        Err(TransportError::Subscribe(_))
    ));
    assert_eq!(transport.device_id(), "esp32_001");
    let subscriptions = client.subscriptions();
    assert_eq!(subscriptions.len(), 6);
    assert!(subscriptions.iter().all(|t| t.starts_with("motor/esp32_001/")));

    transport.send_stop().await.unwrap();
    assert_eq!(client.published_to("motor/esp32_001/command"), vec!["0p"]);
}

// ============================================================================
// Manager
// ============================================================================

#[tokio::test]
async fn switching_closes_old_link_before_opening_new() {
    let log = event_log();
    let adapter = Arc::new(MockSppAdapter::new().with_log(Arc::clone(&log)));
    let connector = Arc::new(MockMqttConnector::new().with_log(Arc::clone(&log)));
    let manager: TransportManager<MockSppAdapter, Arc<MockMqttConnector>> = TransportManager::new();

    manager
        .activate(BluetoothTransport::new(Arc::clone(&adapter), bt_config()).with_device(device()))
        .await
        .unwrap();
    assert_eq!(manager.active_kind(), Some(TransportKind::Bluetooth));

    manager
        .activate(MqttTransport::new(
            Arc::clone(&connector),
            MqttConfig::default(),
        ))
        .await
        .unwrap();

    let events = log.lock().clone();
    let close = events.iter().position(|e| e.starts_with("bt close")).unwrap();
    let open = events.iter().position(|e| e.starts_with("mqtt connect")).unwrap();
    assert!(close < open, "events out of order: {:?}", events);
    assert_eq!(adapter.live_streams(), 0);
    assert_eq!(manager.active_kind(), Some(TransportKind::Mqtt));
}

#[tokio::test]
async fn manager_audits_successful_sends() {
    let connector = Arc::new(MockMqttConnector::new());
    let audit = Arc::new(MockAudit::new());
    let manager: TransportManager<MockSppAdapter, Arc<MockMqttConnector>, MockAudit> =
        TransportManager::with_audit(Arc::clone(&audit));

    manager
        .activate(MqttTransport::new(
            Arc::clone(&connector),
            MqttConfig::default(),
        ))
        .await
        .unwrap();
    manager.send_soft_start([10, 20, 30, 40, 50, 60]).await.unwrap();
    manager.send_stop().await.unwrap();

    assert_eq!(
        audit.recorded(),
        vec![
            MotorCommand::soft_start([10, 20, 30, 40, 50, 60]),
            MotorCommand::EmergencyStop
        ]
    );

    manager.set_device_id("esp32_009").await.unwrap();
    let client = connector.client();
    assert!(client.is_subscribed("motor/esp32_009/state"));
    for leaf in TELEMETRY_LEAVES {
        assert!(client.is_subscribed(&format!("motor/esp32_009/{}", leaf)));
        assert!(!client.is_subscribed(&format!("motor/esp32_001/{}", leaf)));
    }
    assert_eq!(client.subscriptions().len(), TELEMETRY_LEAVES.len());

    manager.deactivate().await;
    assert_eq!(manager.active_kind(), None);
    assert!(!manager.is_connected().await);
}
