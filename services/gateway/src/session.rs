//! Per-connection session: handshake, then the streaming state machine.
//!
//! One task per connection owns the read loop. The connection's single
//! writer is serialised behind [`crate::conn_table::spawn_writer`]. Parse
//! errors are connection-fatal; the device reconnects and re-handshakes.

use crate::commands::correlator::ResponseEvent;
use crate::conn_table::{spawn_writer, ConnState, ConnectionTable};
use crate::metrics::GatewayMetrics;
use crate::publisher::OutboundRecord;
use chrono::Utc;
use fleet_codec::{Frame, FrameError, FrameReader, CODEC_COMMAND, CODEC_DATA};
use fleet_proto::{AlarmKind, AlarmRecord, Identity, RecordKind, TelemetryRecord};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const HANDSHAKE_ACCEPT: u8 = 0x01;
const HANDSHAKE_REJECT: u8 = 0x00;

/// Everything a session needs, cloned per connection.
#[derive(Clone)]
pub struct SessionCtx {
    pub table: Arc<ConnectionTable>,
    pub records_tx: mpsc::Sender<OutboundRecord>,
    pub responses_tx: mpsc::Sender<ResponseEvent>,
    pub metrics: Arc<GatewayMetrics>,
    pub idle_timeout: Duration,
    pub device_utc_offset_minutes: i32,
}

/// Why a session ended; becomes the disconnection counter label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    HandshakeRejected,
    TableFull,
    Replaced,
    Idle,
    Eof,
    CrcMismatch,
    ParseError,
    WriteFailed,
    ShuttingDown,
}

impl CloseReason {
    fn label(self) -> &'static str {
        match self {
            CloseReason::HandshakeRejected => "handshake_rejected",
            CloseReason::TableFull => "table_full",
            CloseReason::Replaced => "replaced",
            CloseReason::Idle => "idle",
            CloseReason::Eof => "eof",
            CloseReason::CrcMismatch => "crc_mismatch",
            CloseReason::ParseError => "parse_error",
            CloseReason::WriteFailed => "write_failed",
            CloseReason::ShuttingDown => "shutting_down",
        }
    }
}

/// Run one connection to completion.
pub async fn run_session(stream: TcpStream, peer: SocketAddr, ctx: SessionCtx) {
    let reason = drive(stream, peer, &ctx).await;
    ctx.metrics
        .disconnections_total
        .with_label_values(&[reason.label()])
        .inc();
    debug!(addr = %peer, reason = reason.label(), "session closed");
}

async fn drive(stream: TcpStream, peer: SocketAddr, ctx: &SessionCtx) -> CloseReason {
    let (read_half, write_half) = stream.into_split();
    let writer = spawn_writer(write_half);
    let mut reader = FrameReader::new(read_half);

    // --- awaiting_handshake ---------------------------------------------
    let handshake = tokio::time::timeout(ctx.idle_timeout, reader.read_handshake()).await;
    let raw_identity = match handshake {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            debug!(addr = %peer, error = %e, "handshake read failed");
            return CloseReason::HandshakeRejected;
        }
        Err(_) => return CloseReason::Idle,
    };

    let identity: Identity = match raw_identity.parse() {
        Ok(id) => id,
        Err(e) => {
            warn!(addr = %peer, error = %e, "invalid identity in handshake");
            let _ = writer.write(vec![HANDSHAKE_REJECT]).await;
            writer.kick();
            return CloseReason::HandshakeRejected;
        }
    };

    if ctx
        .table
        .register(identity.clone(), writer.clone(), peer)
        .is_err()
    {
        warn!(addr = %peer, identity = %identity, "connection table full, rejecting");
        let _ = writer.write(vec![HANDSHAKE_REJECT]).await;
        writer.kick();
        return CloseReason::TableFull;
    }
    if writer.write(vec![HANDSHAKE_ACCEPT]).await.is_err() {
        ctx.table.remove(&identity, peer);
        return CloseReason::WriteFailed;
    }
    info!(identity = %identity, addr = %peer, "device authenticated");

    // --- authenticated / streaming --------------------------------------
    let mut kicked = writer.kicked();
    let mut sequence: u64 = 0;
    let mut streaming = false;

    let reason = loop {
        let frame = tokio::select! {
            biased;
            // wait_for also fires when the kick landed before this
            // subscription saw it, and when the writer task is gone.
            _ = kicked.wait_for(|v| *v) => break CloseReason::Replaced,
            frame = tokio::time::timeout(ctx.idle_timeout, reader.read_frame()) => frame,
        };

        let frame = match frame {
            Ok(Ok(frame)) => frame,
            Ok(Err(FrameError::CrcMismatch { computed, carried })) => {
                warn!(identity = %identity, computed, carried, "crc mismatch, closing connection");
                break CloseReason::CrcMismatch;
            }
            Ok(Err(FrameError::Io(e))) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break CloseReason::Eof;
            }
            Ok(Err(e)) => {
                warn!(identity = %identity, error = %e, "frame error, closing connection");
                break CloseReason::ParseError;
            }
            Err(_) => break CloseReason::Idle,
        };

        ctx.table.touch(&identity);

        match frame {
            Frame::KeepAlive => {}
            Frame::Data { codec_id, payload, .. } => {
                ctx.metrics.frames_total.inc();
                match codec_id {
                    CODEC_DATA => {
                        if !streaming {
                            streaming = true;
                            ctx.table.set_state(&identity, ConnState::Streaming);
                        }
                        match handle_data_frame(ctx, &identity, &payload, &mut sequence).await {
                            Ok(accepted) => {
                                let ack = u32::try_from(accepted).unwrap_or(u32::MAX);
                                if writer.write(ack.to_be_bytes().to_vec()).await.is_err() {
                                    break CloseReason::WriteFailed;
                                }
                            }
                            Err(reason) => break reason,
                        }
                    }
                    CODEC_COMMAND => {
                        match fleet_codec::decode_command_payload(&payload) {
                            Ok(response) if response.is_response => {
                                if ctx
                                    .responses_tx
                                    .send(ResponseEvent {
                                        identity: identity.clone(),
                                        text: response.text,
                                    })
                                    .await
                                    .is_err()
                                {
                                    break CloseReason::ShuttingDown;
                                }
                            }
                            Ok(_) => {
                                // A command packet echoed back; nothing to do.
                                debug!(identity = %identity, "ignoring echoed command packet");
                            }
                            Err(e) => {
                                warn!(
                                    identity = %identity,
                                    error = %e,
                                    bytes = %truncated_hex(&payload),
                                    "command payload malformed, closing connection"
                                );
                                break CloseReason::ParseError;
                            }
                        }
                    }
                    other => {
                        warn!(identity = %identity, codec = other, "unsupported codec, closing connection");
                        break CloseReason::ParseError;
                    }
                }
            }
        }
    };

    // --- closing ---------------------------------------------------------
    ctx.table.remove(&identity, peer);
    reason
}

/// Decode one data frame, forward its records, and return the accepted
/// count for the wire ack.
async fn handle_data_frame(
    ctx: &SessionCtx,
    identity: &Identity,
    payload: &[u8],
    sequence: &mut u64,
) -> Result<usize, CloseReason> {
    let records = match fleet_codec::parse_data_payload(payload) {
        Ok(records) => records,
        Err(e) => {
            warn!(
                identity = %identity,
                error = %e,
                bytes = %truncated_hex(payload),
                "data payload malformed, closing connection"
            );
            return Err(CloseReason::ParseError);
        }
    };
    let accepted = records.len();
    let now = Utc::now();

    for raw in &records {
        *sequence += 1;
        let Some(record) = TelemetryRecord::from_raw(
            raw,
            identity.clone(),
            *sequence,
            ctx.device_utc_offset_minutes,
            now,
        ) else {
            ctx.metrics.records_no_fix_total.inc();
            continue;
        };
        if !record.timestamp_valid {
            ctx.metrics.records_invalid_timestamp_total.inc();
        }

        let kind = RecordKind::from_priority(raw.priority);
        let payload = match kind {
            RecordKind::Alarm => {
                let alarm_kind = AlarmKind::from_event_channel(raw.event_channel);
                serde_json::to_vec(&AlarmRecord {
                    severity: alarm_kind.severity(),
                    kind: alarm_kind,
                    record,
                })
            }
            RecordKind::Telemetry | RecordKind::Event => serde_json::to_vec(&record),
        };
        let payload = match payload {
            Ok(payload) => payload,
            Err(e) => {
                warn!(identity = %identity, error = %e, "record serialization failed");
                continue;
            }
        };

        // Blocks when the staging buffer is full: this is the back-pressure
        // path that ultimately throttles the socket read.
        if ctx
            .records_tx
            .send(OutboundRecord {
                routing_key: kind.routing_key(),
                payload,
            })
            .await
            .is_err()
        {
            return Err(CloseReason::ShuttingDown);
        }
        ctx.metrics.records_total.inc();
    }

    Ok(accepted)
}

fn truncated_hex(bytes: &[u8]) -> String {
    let shown: String = bytes.iter().take(24).map(|b| format!("{b:02x}")).collect();
    if bytes.len() > 24 {
        format!("{shown}.. ({} bytes)", bytes.len())
    } else {
        shown
    }
}
