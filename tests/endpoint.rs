//! Endpoint and item-group integration tests: lifecycle, reconnection, area
//! slicing, grouped reads/writes and diagnostics against the mock controller.

mod common;

use bytes::Bytes;
use common::{init_tracing, spawn_mock, MockConfig, MockHandle};
use s7link::protocol::frame::types::FunctionGroup;
use s7link::{
    Duplex, EndpointEvent, EndpointOptions, ErrorKind, ItemGroup, ItemValue, MemoryArea,
    S7Endpoint, TransportFactory,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;

struct MockFleet {
    pub connects: Arc<AtomicUsize>,
    pub handles: Arc<Mutex<Vec<MockHandle>>>,
}

fn mock_factory(config: MockConfig) -> (TransportFactory, MockFleet) {
    let connects = Arc::new(AtomicUsize::new(0));
    let handles: Arc<Mutex<Vec<MockHandle>>> = Arc::new(Mutex::new(Vec::new()));
    let fleet = MockFleet {
        connects: Arc::clone(&connects),
        handles: Arc::clone(&handles),
    };
    let factory: TransportFactory = Arc::new(move || {
        let config = config.clone();
        let connects = Arc::clone(&connects);
        let handles = Arc::clone(&handles);
        Box::pin(async move {
            connects.fetch_add(1, Ordering::SeqCst);
            let (client, server) = tokio::io::duplex(16 * 1024);
            handles.lock().unwrap().push(spawn_mock(server, config));
            Ok(Box::new(client) as Box<dyn Duplex>)
        })
    });
    (factory, fleet)
}

fn options(auto_reconnect_ms: u64) -> EndpointOptions {
    EndpointOptions {
        auto_reconnect_ms,
        ..Default::default()
    }
}

async fn next_event(rx: &mut tokio::sync::broadcast::Receiver<EndpointEvent>) -> EndpointEvent {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("event wait timed out")
        .expect("event channel closed")
}

#[tokio::test]
async fn connect_is_idempotent_and_emits_events() {
    init_tracing();
    let (factory, fleet) = mock_factory(MockConfig::default());
    let endpoint = S7Endpoint::with_transport(options(0), Some(factory));
    let mut events = endpoint.subscribe();

    endpoint.connect().await.unwrap();
    assert!(matches!(next_event(&mut events).await, EndpointEvent::Connecting));
    assert!(matches!(next_event(&mut events).await, EndpointEvent::Connected));
    assert!(matches!(
        next_event(&mut events).await,
        EndpointEvent::PduSize(480)
    ));
    assert_eq!(endpoint.pdu_size(), 480);

    // A second connect is a no-op.
    endpoint.connect().await.unwrap();
    assert_eq!(fleet.connects.load(Ordering::SeqCst), 1);

    endpoint.disconnect().await;
    assert!(!endpoint.is_connected());
    assert_eq!(endpoint.pdu_size(), 0);
    // Disconnect again: still fine.
    endpoint.disconnect().await;
}

#[tokio::test]
async fn reconnects_after_transport_loss() {
    init_tracing();
    let shutdown = Arc::new(Notify::new());
    let config = MockConfig {
        shutdown: Some(Arc::clone(&shutdown)),
        ..Default::default()
    };
    let (factory, fleet) = mock_factory(config);
    let endpoint = S7Endpoint::with_transport(options(100), Some(factory));

    endpoint.connect().await.unwrap();
    let mut events = endpoint.subscribe();

    // Kill the first mock's transport.
    shutdown.notify_waiters();

    assert!(matches!(
        next_event(&mut events).await,
        EndpointEvent::Disconnected
    ));
    assert!(matches!(
        next_event(&mut events).await,
        EndpointEvent::Connecting
    ));
    assert!(matches!(
        next_event(&mut events).await,
        EndpointEvent::Connected
    ));
    // The PDU size is re-emitted even though it is unchanged.
    assert!(matches!(
        next_event(&mut events).await,
        EndpointEvent::PduSize(480)
    ));
    assert_eq!(fleet.connects.load(Ordering::SeqCst), 2);
    assert!(endpoint.is_connected());

    endpoint.disconnect().await;
}

#[tokio::test]
async fn read_area_slices_across_pdu_limit() {
    init_tracing();
    let (factory, fleet) = mock_factory(MockConfig {
        pdu_size: 240,
        ..Default::default()
    });
    let endpoint = S7Endpoint::with_transport(options(0), Some(factory));
    endpoint.connect().await.unwrap();

    let pattern: Vec<u8> = (0..500u32).map(|i| (i % 251) as u8).collect();
    {
        let handles = fleet.handles.lock().unwrap();
        handles[0].poke(MemoryArea::Flags as u8, 0, 0, &pattern);
    }

    let data = endpoint.read_flags(0, 500).await.unwrap();
    assert_eq!(&data[..], &pattern[..]);

    // Three jobs: 222 + 222 + 56.
    let refs = fleet.handles.lock().unwrap()[0].seen_refs.lock().unwrap().len();
    assert_eq!(refs, 1 + 3); // setup + three read slices

    endpoint.disconnect().await;
}

#[tokio::test]
async fn write_area_slices_and_lands() {
    init_tracing();
    let (factory, fleet) = mock_factory(MockConfig {
        pdu_size: 240,
        ..Default::default()
    });
    let endpoint = S7Endpoint::with_transport(options(0), Some(factory));
    endpoint.connect().await.unwrap();

    let pattern: Vec<u8> = (0..300u32).map(|i| (i % 256) as u8).collect();
    endpoint.write_db(2, 50, &pattern).await.unwrap();

    let written = fleet.handles.lock().unwrap()[0].peek(MemoryArea::Db as u8, 2, 50, 300);
    assert_eq!(written, pattern);

    endpoint.disconnect().await;
}

#[tokio::test]
async fn group_write_then_read_echoes_values() {
    init_tracing();
    let (factory, _fleet) = mock_factory(MockConfig::default());
    let endpoint = S7Endpoint::with_transport(options(0), Some(factory));
    endpoint.connect().await.unwrap();

    let mut group = ItemGroup::new(Arc::clone(&endpoint));
    group
        .add_items(["DB1,REAL0", "DB1,INT4", "DB1,DI6", "M10.3", "QB2"])
        .unwrap();

    let tags = ["DB1,REAL0", "DB1,INT4", "DB1,DI6", "M10.3", "QB2"];
    let values = [
        ItemValue::Real(3.25),
        ItemValue::Int(-123),
        ItemValue::DInt(7_000_000),
        ItemValue::Bool(true),
        ItemValue::Byte(0x5A),
    ];
    group.write_items(&tags, &values).await.unwrap();

    let read = group.read_all_items().await.unwrap();
    assert_eq!(read.len(), 5);
    for (tag, value) in tags.iter().zip(&values) {
        assert_eq!(read.get(*tag), Some(value), "mismatch for {tag}");
    }

    endpoint.disconnect().await;
}

#[tokio::test]
async fn group_write_accepts_unknown_tags() {
    // Writes never require prior add_items; unknown tags become throwaway
    // items.
    init_tracing();
    let (factory, fleet) = mock_factory(MockConfig::default());
    let endpoint = S7Endpoint::with_transport(options(0), Some(factory));
    endpoint.connect().await.unwrap();

    let mut group = ItemGroup::new(Arc::clone(&endpoint));
    group
        .write_items(&["DB3,W0"], &[ItemValue::Word(0xBEEF)])
        .await
        .unwrap();
    assert_eq!(group.len(), 0);

    let written = fleet.handles.lock().unwrap()[0].peek(MemoryArea::Db as u8, 3, 0, 2);
    assert_eq!(written, vec![0xBE, 0xEF]);

    endpoint.disconnect().await;
}

#[tokio::test]
async fn oversized_write_item_fails_fast() {
    init_tracing();
    let (factory, _fleet) = mock_factory(MockConfig {
        pdu_size: 240,
        ..Default::default()
    });
    let endpoint = S7Endpoint::with_transport(options(0), Some(factory));
    endpoint.connect().await.unwrap();

    // 300 data bytes cannot fit a 240-byte PDU and writes never split.
    let mut group = ItemGroup::new(Arc::clone(&endpoint));
    let value = ItemValue::Array((0..300).map(|i| ItemValue::Byte(i as u8)).collect());
    let err = group
        .write_items(&["DB1,B0.300"], &[value])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ItemTooBig);

    endpoint.disconnect().await;
}

#[tokio::test]
async fn group_read_surfaces_first_failing_part() {
    init_tracing();
    let (factory, _fleet) = mock_factory(MockConfig {
        fail_read_db: Some((5, 0x05)),
        ..Default::default()
    });
    let endpoint = S7Endpoint::with_transport(options(0), Some(factory));
    endpoint.connect().await.unwrap();

    let mut group = ItemGroup::new(Arc::clone(&endpoint));
    group
        .add_items(["DB1,W0", "DB5,W0", "DB6,W0"])
        .unwrap();
    let err = group.read_all_items().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReturnCode(0x05));
    let msg = err.to_string();
    assert!(msg.contains("db 5"), "context missing from: {msg}");

    endpoint.disconnect().await;
}

#[tokio::test]
async fn group_translation_callback_rewrites_tags() {
    init_tracing();
    let (factory, fleet) = mock_factory(MockConfig::default());
    let endpoint = S7Endpoint::with_transport(options(0), Some(factory));
    endpoint.connect().await.unwrap();

    let table: HashMap<&str, &str> = HashMap::from([("MotorSpeed", "DB1,INT0")]);
    let mut group = ItemGroup::new(Arc::clone(&endpoint));
    group.set_translation_callback(move |tag| {
        table.get(tag).map(|s| s.to_string()).unwrap_or_else(|| tag.to_string())
    });
    group.add_items(["MotorSpeed"]).unwrap();

    fleet.handles.lock().unwrap()[0].poke(MemoryArea::Db as u8, 1, 0, &[0x01, 0x00]);
    let read = group.read_all_items().await.unwrap();
    assert_eq!(read.get("MotorSpeed"), Some(&ItemValue::Int(256)));

    endpoint.disconnect().await;
}

#[tokio::test]
async fn reads_fail_cleanly_when_not_connected() {
    init_tracing();
    let (factory, _fleet) = mock_factory(MockConfig::default());
    let endpoint = S7Endpoint::with_transport(options(0), Some(factory));

    let err = endpoint.read_db(1, 0, 4).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);

    let mut group = ItemGroup::new(Arc::clone(&endpoint));
    group.add_items(["DB1,W0"]).unwrap();
    let err = group.read_all_items().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
}

#[tokio::test]
async fn ssl_envelope_parses_entries_and_keeps_raw() {
    init_tracing();
    // SSL 0x0011 envelope: id, index, entry length 28, one entry.
    let mut entry = vec![0x00, 0x01];
    entry.extend_from_slice(b"6ES7 315-2AG10-0AB0 ");
    entry.extend_from_slice(&[0x00; 6]);
    let mut envelope = vec![0x00, 0x11, 0x00, 0x00, 0x00, 0x1C, 0x00, 0x01];
    envelope.extend_from_slice(&entry);

    let mut user_data = HashMap::new();
    user_data.insert(
        (FunctionGroup::CpuFunctions as u8, 0x01),
        vec![Bytes::from(envelope.clone())],
    );
    let (factory, _fleet) = mock_factory(MockConfig {
        user_data,
        ..Default::default()
    });
    let endpoint = S7Endpoint::with_transport(options(0), Some(factory));
    endpoint.connect().await.unwrap();

    let ssl = endpoint.get_ssl(0x0011, 0x0000).await.unwrap();
    assert_eq!(ssl.id, 0x0011);
    assert_eq!(ssl.entry_len, 28);
    assert_eq!(ssl.count, 1);
    assert_eq!(ssl.entries.len(), 1);
    assert_eq!(&ssl.raw[..], &envelope[..]);

    let modules = endpoint.get_module_identification().await.unwrap();
    assert_eq!(modules.len(), 1);
    assert_eq!(modules[0].index, 1);
    assert_eq!(modules[0].order_number, "6ES7 315-2AG10-0AB0");

    endpoint.disconnect().await;
}
