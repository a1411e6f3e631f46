//! Downlink command flow: outbox → socket → device response → history.

mod support;

use fleet_codec::{Frame, FrameReader, CODEC_COMMAND};
use gateway::commands::DeliveryMethod;
use std::time::Duration;
use support::{connect_device, start_gateway, wait_until, GatewayOptions, IDENTITY};
use tokio::io::AsyncWriteExt;

fn identity() -> fleet_proto::Identity {
    IDENTITY.parse().unwrap()
}

#[tokio::test]
async fn command_round_trip_reaches_history() {
    let gw = start_gateway(GatewayOptions::default()).await;
    let device = connect_device(gw.addr, IDENTITY).await;

    gw.store
        .insert_outbox(&identity(), DeliveryMethod::Gprs, "getinfo");

    // Within a poll interval the framed command arrives on the socket.
    let mut reader = FrameReader::new(device);
    let frame = tokio::time::timeout(Duration::from_secs(2), reader.read_frame())
        .await
        .expect("command within one poll interval")
        .unwrap();
    let Frame::Data { codec_id, payload, .. } = frame else {
        panic!("expected framed command");
    };
    assert_eq!(codec_id, CODEC_COMMAND);
    let decoded = fleet_codec::decode_command_payload(&payload).unwrap();
    assert!(!decoded.is_response);
    assert_eq!(decoded.text, "getinfo");

    // Device responds; the correlator closes the loop.
    let mut device = reader.into_inner();
    device
        .write_all(&fleet_codec::testkit::encode_response("OK"))
        .await
        .unwrap();

    wait_until(Duration::from_secs(2), || {
        let history = gw.store.history();
        history
            .iter()
            .any(|h| h.direction == "outgoing" && h.status == "successful")
            && history
                .iter()
                .any(|h| h.direction == "incoming" && h.status == "received" && h.payload == "OK")
    })
    .await;
    assert_eq!(gw.store.sent_len(), 0);
    assert_eq!(gw.metrics.responses_matched_total.get(), 1);
}

#[tokio::test]
async fn credentials_are_stripped_before_encoding() {
    let gw = start_gateway(GatewayOptions::default()).await;
    let device = connect_device(gw.addr, IDENTITY).await;

    gw.store
        .insert_outbox(&identity(), DeliveryMethod::Gprs, "admin 0000 getver");

    let mut reader = FrameReader::new(device);
    let frame = tokio::time::timeout(Duration::from_secs(2), reader.read_frame())
        .await
        .expect("command arrives")
        .unwrap();
    let Frame::Data { payload, .. } = frame else {
        panic!("expected framed command");
    };
    let decoded = fleet_codec::decode_command_payload(&payload).unwrap();
    assert_eq!(decoded.text, "getver");
}

#[tokio::test]
async fn unanswered_command_expires_to_no_reply() {
    let gw = start_gateway(GatewayOptions {
        run_sweep: true,
        reply_timeout: Duration::from_millis(100),
        outbox_timeout: Duration::from_secs(60),
        ..GatewayOptions::default()
    })
    .await;
    let _device = connect_device(gw.addr, IDENTITY).await;

    gw.store
        .insert_outbox(&identity(), DeliveryMethod::Gprs, "getinfo");

    // The command is polled and sent, but the device never answers; the
    // sweep must close it out.
    wait_until(Duration::from_secs(3), || {
        gw.store
            .history()
            .iter()
            .any(|h| h.status == "no_reply")
    })
    .await;
    assert_eq!(gw.store.sent_len(), 0);
    assert_eq!(gw.store.outbox_len(), 0);
}

#[tokio::test]
async fn offline_device_command_expires_to_failed() {
    let gw = start_gateway(GatewayOptions {
        run_sweep: true,
        reply_timeout: Duration::from_secs(60),
        outbox_timeout: Duration::from_millis(100),
        ..GatewayOptions::default()
    })
    .await;
    // No device connects; the outbox row can never be polled.
    gw.store
        .insert_outbox(&identity(), DeliveryMethod::Gprs, "getinfo");

    wait_until(Duration::from_secs(3), || {
        gw.store.history().iter().any(|h| h.status == "failed")
    })
    .await;
    assert_eq!(gw.store.outbox_len(), 0);
}
