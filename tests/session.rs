//! Connection-level integration tests against the in-memory mock controller.

mod common;

use bytes::Bytes;
use chrono::NaiveDate;
use common::{init_tracing, spawn_mock, MockConfig, MockHandle};
use futures::future::join_all;
use s7link::protocol::frame::types::FunctionGroup;
use s7link::protocol::frame::VarSpec;
use s7link::protocol::session::{ConnectionState, S7Connection, SessionConfig};
use s7link::{BlockType, ErrorKind, MemoryArea, ReturnCode, Transport};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

async fn connect(mock: MockConfig, session: SessionConfig) -> (Arc<S7Connection>, MockHandle) {
    init_tracing();
    let (client, server) = tokio::io::duplex(16 * 1024);
    let handle = spawn_mock(server, mock);
    let conn = S7Connection::open(Box::new(client), session)
        .await
        .expect("handshake against mock");
    (conn, handle)
}

fn byte_spec(area: MemoryArea, db: u16, offset: u32, count: u16) -> VarSpec {
    VarSpec {
        transport: Transport::Byte,
        count,
        db,
        area,
        byte_offset: offset,
        bit_offset: 0,
    }
}

#[tokio::test]
async fn negotiates_pdu_size_and_window() {
    let mock = MockConfig {
        pdu_size: 240,
        amq: 4,
        ..Default::default()
    };
    let (conn, _h) = connect(mock, SessionConfig::default()).await;
    assert_eq!(conn.pdu_size(), 240);
    assert_eq!(conn.max_jobs(), 4);
    assert_eq!(conn.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn read_returns_memory_image_bytes() {
    let (conn, h) = connect(MockConfig::default(), SessionConfig::default()).await;
    h.poke(MemoryArea::Db as u8, 1, 10, &[0xDE, 0xAD, 0xBE, 0xEF]);

    let results = conn
        .request_read_vars(vec![byte_spec(MemoryArea::Db, 1, 10, 4)])
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].code.is_ok());
    assert_eq!(&results[0].data[..], &[0xDE, 0xAD, 0xBE, 0xEF]);
}

#[tokio::test]
async fn write_lands_in_memory_image() {
    let (conn, h) = connect(MockConfig::default(), SessionConfig::default()).await;
    let codes = conn
        .request_write_vars(
            vec![byte_spec(MemoryArea::Flags, 0, 20, 3)],
            vec![s7link::protocol::frame::owned::WriteDataItem {
                transport: Transport::Byte,
                data: Bytes::from_static(&[1, 2, 3]),
            }],
        )
        .await
        .unwrap();
    assert_eq!(codes, vec![ReturnCode::DataOk]);
    assert_eq!(h.peek(MemoryArea::Flags as u8, 0, 20, 3), vec![1, 2, 3]);
}

#[tokio::test]
async fn window_saturation_caps_outstanding_jobs() {
    // 20 concurrent reads on a window of 8: the controller never observes
    // more than 8 undispatched jobs, and every read completes.
    let mock = MockConfig {
        hold_batches: true,
        amq: 32,
        ..Default::default()
    };
    let session = SessionConfig {
        max_jobs: 8,
        timeout: Duration::from_millis(5000),
        ..Default::default()
    };
    let (conn, h) = connect(mock, session).await;
    assert_eq!(conn.max_jobs(), 8);

    for i in 0..20u8 {
        h.poke(MemoryArea::Db as u8, 1, i as usize, &[i + 1]);
    }
    let reads = (0..20u32)
        .map(|i| conn.request_read_vars(vec![byte_spec(MemoryArea::Db, 1, i, 1)]))
        .collect::<Vec<_>>();
    let results = join_all(reads).await;

    for (i, res) in results.into_iter().enumerate() {
        let res = res.expect("read must complete");
        assert_eq!(&res[0].data[..], &[i as u8 + 1]);
    }
    let peak = h.max_outstanding.load(std::sync::atomic::Ordering::Relaxed);
    assert!(peak <= 8, "controller saw {peak} outstanding jobs");
    assert_eq!(peak, 8);
}

#[tokio::test]
async fn pdu_references_are_unique_and_nonzero() {
    let (conn, h) = connect(MockConfig::default(), SessionConfig::default()).await;
    for i in 0..50u32 {
        conn.request_read_vars(vec![byte_spec(MemoryArea::Db, 1, i, 1)])
            .await
            .unwrap();
    }
    let refs = h.seen_refs.lock().unwrap().clone();
    assert!(refs.len() >= 50);
    assert!(refs.iter().all(|&r| r != 0));
    let mut dedup = refs.clone();
    dedup.sort_unstable();
    dedup.dedup();
    assert_eq!(dedup.len(), refs.len());
}

#[tokio::test]
async fn per_item_return_codes_surface() {
    let mock = MockConfig {
        fail_read_db: Some((5, 0x05)),
        ..Default::default()
    };
    let (conn, _h) = connect(mock, SessionConfig::default()).await;
    let results = conn
        .request_read_vars(vec![
            byte_spec(MemoryArea::Db, 1, 0, 2),
            byte_spec(MemoryArea::Db, 5, 0, 2),
            byte_spec(MemoryArea::Db, 1, 8, 2),
        ])
        .await
        .unwrap();
    assert!(results[0].code.is_ok());
    assert_eq!(results[1].code, ReturnCode::InvalidAddress);
    assert!(results[2].code.is_ok());
}

#[tokio::test]
async fn job_timeout_poisons_the_connection() {
    let mock = MockConfig {
        stop_after: Some(1), // answer only the setup exchange
        ..Default::default()
    };
    let session = SessionConfig {
        timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let (conn, _h) = connect(mock, session).await;

    let err = conn
        .request_read_vars(vec![byte_spec(MemoryArea::Db, 1, 0, 1)])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    // The stuck job tears the multiplexer down.
    let mut state = conn.state_watch();
    state
        .wait_for(|s| matches!(s, ConnectionState::Disconnected))
        .await
        .unwrap();
    let err = conn
        .request_read_vars(vec![byte_spec(MemoryArea::Db, 1, 0, 1)])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
}

#[tokio::test]
async fn user_data_reassembles_multiple_data_units() {
    let mut user_data = HashMap::new();
    user_data.insert(
        (FunctionGroup::CpuFunctions as u8, 0x01),
        vec![
            Bytes::from_static(&[0x00, 0x11, 0x00, 0x00, 0x00, 0x04, 0x00, 0x02]),
            Bytes::from_static(&[0xAA, 0xBB, 0xCC, 0xDD]),
            Bytes::from_static(&[0x11, 0x22, 0x33, 0x44]),
        ],
    );
    let mock = MockConfig {
        user_data,
        ..Default::default()
    };
    let (conn, _h) = connect(mock, SessionConfig::default()).await;

    let data = conn
        .send_user_data(
            FunctionGroup::CpuFunctions,
            0x01,
            Bytes::from_static(&[0x00, 0x11, 0x00, 0x00]),
        )
        .await
        .unwrap();
    assert_eq!(
        &data[..],
        &[
            0x00, 0x11, 0x00, 0x00, 0x00, 0x04, 0x00, 0x02, 0xAA, 0xBB, 0xCC, 0xDD, 0x11, 0x22,
            0x33, 0x44
        ]
    );
}

#[tokio::test]
async fn user_data_error_head_fails_the_exchange() {
    // No canned entry -> the mock responds "service not implemented".
    let (conn, _h) = connect(MockConfig::default(), SessionConfig::default()).await;
    let err = conn
        .send_user_data(FunctionGroup::CpuFunctions, 0x01, Bytes::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PlcError);
}

#[tokio::test]
async fn upload_handshake_concatenates_chunks() {
    let mut blocks = HashMap::new();
    blocks.insert("_0A00001A".to_string(), vec![vec![0xAA, 0xBB], vec![0xCC]]);
    let mock = MockConfig {
        blocks,
        ..Default::default()
    };
    let (conn, _h) = connect(mock, SessionConfig::default()).await;

    let data = conn.upload_block("_0A00001A").await.unwrap();
    assert_eq!(&data[..], &[0xAA, 0xBB, 0xCC]);
}

#[tokio::test]
async fn upload_of_unknown_block_fails_with_plc_error() {
    let (conn, _h) = connect(MockConfig::default(), SessionConfig::default()).await;
    let err = conn.upload_block("_0A09999A").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PlcError);
}

#[tokio::test]
async fn clock_round_trips() {
    let (conn, _h) = connect(MockConfig::default(), SessionConfig::default()).await;
    let dt = NaiveDate::from_ymd_opt(2026, 8, 2)
        .unwrap()
        .and_hms_milli_opt(10, 20, 30, 0)
        .unwrap();
    conn.set_time(dt).await.unwrap();
    assert_eq!(conn.get_time().await.unwrap(), dt);
}

#[tokio::test]
async fn block_count_and_list() {
    let mut user_data = HashMap::new();
    // Two (type, count) pairs: 8 OBs, 5 DBs.
    user_data.insert(
        (FunctionGroup::BlockFunctions as u8, 0x01),
        vec![Bytes::from_static(&[
            0x30, 0x38, 0x00, 0x08, 0x30, 0x41, 0x00, 0x05,
        ])],
    );
    // Two DB entries: numbers 1 and 5.
    user_data.insert(
        (FunctionGroup::BlockFunctions as u8, 0x02),
        vec![Bytes::from_static(&[
            0x00, 0x01, 0x22, 0x01, 0x00, 0x05, 0x22, 0x01,
        ])],
    );
    let mock = MockConfig {
        user_data,
        ..Default::default()
    };
    let (conn, _h) = connect(mock, SessionConfig::default()).await;

    let counts = conn.block_count().await.unwrap();
    assert_eq!(counts.get(&BlockType::Ob), Some(&8));
    assert_eq!(counts.get(&BlockType::Db), Some(&5));

    let list = conn.list_blocks(BlockType::Db).await.unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0].number, 1);
    assert_eq!(list[1].number, 5);
    assert_eq!(list[0].flags, 0x22);
    assert_eq!(list[0].language, 0x01);
}

#[tokio::test]
async fn shutdown_fails_queued_jobs_with_interrupted() {
    let mock = MockConfig {
        stop_after: Some(1),
        ..Default::default()
    };
    let session = SessionConfig {
        timeout: Duration::from_millis(5000),
        ..Default::default()
    };
    let (conn, _h) = connect(mock, session).await;

    let pending = {
        let conn = Arc::clone(&conn);
        tokio::spawn(async move {
            conn.request_read_vars(vec![byte_spec(MemoryArea::Db, 1, 0, 1)])
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    conn.shutdown().await;

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Interrupted);
}
