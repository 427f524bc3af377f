//! Client session tests against a scripted server over an in-memory
//! stream: beacon-filter sync, batch flushing, and the dispatched-command
//! round trip.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use waypost_proto::{
    BeaconData, BeaconLogPacket, BeaconResponsePacket, MAX_REQUEST_FRAME, RequestFlags,
    ResponseFlags, Uuid, framing::FramedStream,
};
use waypost_edge::{BeaconRecord, EdgeClient, EdgeConfig, RecordingRunner};

const ACTIVE_BEACON: [u8; 16] = [0x5a; 16];

fn config() -> EdgeConfig {
    EdgeConfig {
        uuid: Uuid::from_bytes([0x42; 16]),
        host: "localhost".to_string(),
        port: waypost_proto::DEFAULT_PORT,
        beacon_refresh_interval: Duration::from_secs(60),
        batch_flush_interval: Duration::from_millis(50),
    }
}

fn active_beacon() -> BeaconData {
    BeaconData { uuid: Uuid::from_bytes(ACTIVE_BEACON), major: 1, minor: 1 }
}

fn record(data: BeaconData, rssi: i16) -> BeaconRecord {
    BeaconRecord { data, at: Utc::now(), rssi }
}

async fn expect_request(
    framed: &mut FramedStream<tokio::io::DuplexStream>,
) -> BeaconLogPacket {
    let raw = framed.read_record(MAX_REQUEST_FRAME).await.unwrap();
    BeaconLogPacket::decode(&raw).unwrap()
}

async fn respond(
    framed: &mut FramedStream<tokio::io::DuplexStream>,
    response: &BeaconResponsePacket,
) {
    framed.write_record(&response.encode().unwrap()).await.unwrap();
}

#[tokio::test]
async fn session_syncs_filters_and_completes_commands() {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let cancel = CancellationToken::new();
    let runner = Arc::new(RecordingRunner::new("restarted\n"));

    let (tx, rx) = mpsc::channel(16);
    let mut client = EdgeClient::new(config(), rx, runner.clone(), cancel.clone());
    let session = tokio::spawn(async move { client.run_session(client_io).await });

    let mut server = FramedStream::new(server_io, CancellationToken::new());
    server.handshake().await.unwrap();

    // SYNCING: the first request must be a beacon-list refresh
    let request = expect_request(&mut server).await;
    assert_eq!(request.flags, RequestFlags::with(RequestFlags::BEACON_UPDATES));
    assert_eq!(request.uuid, Uuid::from_bytes([0x42; 16]));
    respond(
        &mut server,
        &BeaconResponsePacket {
            flags: ResponseFlags::with(ResponseFlags::OK | ResponseFlags::BEACON_UPDATES),
            data: active_beacon().to_string(),
        },
    )
    .await;

    // Scan records: one listed beacon, one stranger
    tx.send(record(active_beacon(), -61)).await.unwrap();
    tx.send(record(
        BeaconData { uuid: Uuid::from_bytes([0x7c; 16]), major: 9, minor: 9 },
        -40,
    ))
    .await
    .unwrap();
    tx.send(record(active_beacon(), -63)).await.unwrap();

    // RUNNING: the flush timer sends the batch; the stranger was filtered
    let batch = expect_request(&mut server).await;
    assert_eq!(batch.beacons, vec![active_beacon()]);
    assert_eq!(batch.logs.len(), 2);
    assert_eq!(batch.logs[0].rssi, -61);
    assert_eq!(batch.logs[1].rssi, -63);
    assert_eq!(batch.logs[1].beacon_index, 0);

    // Piggy-back a dispatched command on the response
    let mut with_command = BeaconResponsePacket::new(ResponseFlags::OK);
    with_command.flags.insert(ResponseFlags::SYSTEM);
    with_command.data = "42\n[\"systemctl\",\"restart\",\"scanner\"]".to_string();
    respond(&mut server, &with_command).await;

    // The completion uplink carries the runner's output under the same id
    let complete = expect_request(&mut server).await;
    assert_eq!(complete.flags, RequestFlags::with(RequestFlags::CONTROL_COMPLETE));
    assert_eq!(complete.control_data, "42\nrestarted\n");
    respond(&mut server, &BeaconResponsePacket::new(ResponseFlags::OK)).await;

    assert_eq!(
        runner.calls(),
        vec![vec![
            "systemctl".to_string(),
            "restart".to_string(),
            "scanner".to_string()
        ]]
    );

    cancel.cancel();
    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn full_beacon_table_flushes_without_waiting_for_the_timer() {
    let (client_io, server_io) = tokio::io::duplex(256 * 1024);
    let cancel = CancellationToken::new();

    // Flush timer far in the future: only the cap can trigger the flush
    let mut slow = config();
    slow.batch_flush_interval = Duration::from_secs(60);

    let (tx, rx) = mpsc::channel(16);
    let mut client =
        EdgeClient::new(slow, rx, Arc::new(RecordingRunner::new("")), cancel.clone());
    let session = tokio::spawn(async move { client.run_session(client_io).await });

    let mut server = FramedStream::new(server_io, CancellationToken::new());
    server.handshake().await.unwrap();

    // Authorize 256 distinct beacons
    let beacons: Vec<BeaconData> = (0..256u16)
        .map(|i| {
            let mut bytes = [0u8; 16];
            bytes[0] = (i >> 8) as u8;
            bytes[1] = (i & 0xFF) as u8;
            BeaconData { uuid: Uuid::from_bytes(bytes), major: i, minor: 0 }
        })
        .collect();
    let _refresh = expect_request(&mut server).await;
    respond(
        &mut server,
        &BeaconResponsePacket {
            flags: ResponseFlags::with(ResponseFlags::OK | ResponseFlags::BEACON_UPDATES),
            data: beacons
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("\n"),
        },
    )
    .await;

    for beacon in &beacons {
        tx.send(record(*beacon, -60)).await.unwrap();
    }

    // The batch arrives as soon as the table hits the protocol cap
    let batch = expect_request(&mut server).await;
    assert_eq!(batch.beacons.len(), 256);
    assert_eq!(batch.logs.len(), 256);
    respond(&mut server, &BeaconResponsePacket::new(ResponseFlags::OK)).await;

    cancel.cancel();
    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn terminal_response_tears_the_session_down() {
    let (client_io, server_io) = tokio::io::duplex(4096);
    let cancel = CancellationToken::new();
    let (_tx, rx) = mpsc::channel(16);
    let mut client =
        EdgeClient::new(config(), rx, Arc::new(RecordingRunner::new("")), cancel);
    let session = tokio::spawn(async move { client.run_session(client_io).await });

    let mut server = FramedStream::new(server_io, CancellationToken::new());
    server.handshake().await.unwrap();
    let _refresh = expect_request(&mut server).await;
    respond(&mut server, &BeaconResponsePacket::new(ResponseFlags::INVALID)).await;

    let err = session.await.unwrap().unwrap_err();
    assert!(matches!(err, waypost_edge::EdgeError::ServerRejected(_)));
}

#[tokio::test]
async fn malformed_control_payload_is_fatal_to_the_session() {
    let (client_io, server_io) = tokio::io::duplex(4096);
    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::channel(16);
    let mut client =
        EdgeClient::new(config(), rx, Arc::new(RecordingRunner::new("")), cancel);
    let session = tokio::spawn(async move { client.run_session(client_io).await });

    let mut server = FramedStream::new(server_io, CancellationToken::new());
    server.handshake().await.unwrap();
    let _refresh = expect_request(&mut server).await;
    respond(
        &mut server,
        &BeaconResponsePacket {
            flags: ResponseFlags::with(ResponseFlags::OK | ResponseFlags::BEACON_UPDATES),
            data: active_beacon().to_string(),
        },
    )
    .await;

    tx.send(record(active_beacon(), -61)).await.unwrap();
    let _batch = expect_request(&mut server).await;

    let mut garbled = BeaconResponsePacket::new(ResponseFlags::OK);
    garbled.flags.insert(ResponseFlags::SYSTEM);
    garbled.data = "not-a-number\n[\"echo\"]".to_string();
    respond(&mut server, &garbled).await;

    let err = session.await.unwrap().unwrap_err();
    assert!(matches!(err, waypost_edge::EdgeError::ControlPayload(_)));
}
