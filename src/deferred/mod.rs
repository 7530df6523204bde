//! Deferred-Start Shim (C10)
//!
//! When a Stream's upstream is slow to produce its first byte and tolerates
//! only one live connection, Plex would otherwise time the request out
//! waiting on a blank pipe. This shim pads the downstream response with
//! valid null MPEG-TS packets until the Transcoder Supervisor produces real
//! bytes, then hands off seamlessly. New construction: nothing earlier in
//! this codebase needed a padding stage, since upstream accounts always
//! permitted multiple connections before.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::observer::Observer;
use crate::supervisor::Frame;

pub const MPEGTS_PACKET_SIZE: usize = 188;
pub const NULL_PACKET_PID: u16 = 0x1FFF;
pub const SYNC_BYTE: u8 = 0x47;
pub const PACKET_PACING: Duration = Duration::from_millis(10);
pub const HANDOVER_DEADLINE: Duration = Duration::from_secs(30);

/// A single MPEG-TS null packet: sync byte, PID 0x1FFF, an adaptation-field
/// stuffed payload. Every byte after the 4-byte header is adaptation-field
/// padding (0xFF), which decoders are required to ignore.
pub fn null_packet() -> [u8; MPEGTS_PACKET_SIZE] {
    let mut packet = [0xFFu8; MPEGTS_PACKET_SIZE];
    packet[0] = SYNC_BYTE;
    // byte 1: transport_error(0) + payload_unit_start(0) + transport_priority(0) + PID[12:8]
    packet[1] = ((NULL_PACKET_PID >> 8) & 0x1F) as u8;
    packet[2] = (NULL_PACKET_PID & 0xFF) as u8;
    // adaptation_field_control = 10 (adaptation field only, no payload), continuity_counter = 0
    packet[3] = 0x20;
    // adaptation_field_length: remaining 184 bytes minus the length byte itself
    packet[4] = (MPEGTS_PACKET_SIZE - 5) as u8;
    // adaptation_field flags byte: all zero (no optional fields present)
    packet[5] = 0x00;
    packet
}

pub enum DeferredEvent {
    Chunk(Vec<u8>),
    HandoverComplete,
    Closed,
}

/// Drive the deferred-start handoff: emit paced null packets while the
/// supervisor spins up, switch over the instant `supervisor_rx` yields a
/// real frame, and give up cleanly after `HANDOVER_DEADLINE`. `observer`, if
/// given, is credited with one `deferred_start_invocations` count per call —
/// this shim only ever runs when a Stream needed the padding path.
pub async fn run(
    mut supervisor_rx: mpsc::Receiver<Frame>,
    out: mpsc::Sender<DeferredEvent>,
    observer: Option<Arc<Observer>>,
) {
    if let Some(observer) = &observer {
        observer.record_deferred_start();
    }

    let deadline = tokio::time::sleep(HANDOVER_DEADLINE);
    tokio::pin!(deadline);

    let mut ticker = tokio::time::interval(PACKET_PACING);
    let mut supervisor_closed = false;

    loop {
        tokio::select! {
            _ = &mut deadline => {
                let _ = out.send(DeferredEvent::Closed).await;
                return;
            }
            _ = ticker.tick() => {
                if out.send(DeferredEvent::Chunk(null_packet().to_vec())).await.is_err() {
                    return;
                }
            }
            frame = supervisor_rx.recv(), if !supervisor_closed => {
                match frame {
                    Some(Frame::Bytes(bytes)) => {
                        let _ = out.send(DeferredEvent::HandoverComplete).await;
                        let _ = out.send(DeferredEvent::Chunk(bytes)).await;
                        pump_remaining(supervisor_rx, out).await;
                        return;
                    }
                    Some(Frame::End) | Some(Frame::Error(_)) | None => {
                        // Supervisor failed before producing a real packet;
                        // stop polling it and keep padding until the deadline.
                        supervisor_closed = true;
                    }
                }
            }
        }
    }
}

async fn pump_remaining(mut supervisor_rx: mpsc::Receiver<Frame>, out: mpsc::Sender<DeferredEvent>) {
    while let Some(frame) = supervisor_rx.recv().await {
        match frame {
            Frame::Bytes(bytes) => {
                if out.send(DeferredEvent::Chunk(bytes)).await.is_err() {
                    return;
                }
            }
            Frame::End | Frame::Error(_) => {
                let _ = out.send(DeferredEvent::Closed).await;
                return;
            }
        }
    }
}
