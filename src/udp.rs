//! UDP transport adapter.
//!
//! Binds port 1799 deterministically at startup, before anything that could
//! block on BLE, decodes MeshCom frames into canonical records and publishes
//! them on `mesh_message`. Outbound messages are framed, checksummed and
//! sent to the configured radio host on the same port.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::message::{MeshMessage, MessageKind, OutboundMessage, PositionReport, TelemetryReadings};
use crate::router::{MessageRouter, MeshTransport, RouterEvent, Topic};
use crate::wire::{self, FramePayload, OutboundFrame, WireFrame};
use crate::ble::protocol as ble_protocol;

/// MeshCom UDP port, both directions.
pub const MESHCOM_UDP_PORT: u16 = 1799;

/// Default outbound max-hop.
const DEFAULT_MAX_HOP: u8 = 5;

/// The UDP adapter.
pub struct UdpAdapter {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    router: Arc<MessageRouter>,
    /// Rolling outbound message id
    next_msg_id: AtomicU32,
}

impl UdpAdapter {
    /// Bind the listen socket. Failure here is fatal for the process.
    pub async fn bind(
        listen_port: u16,
        target_host: &str,
        router: Arc<MessageRouter>,
    ) -> GatewayResult<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", listen_port)).await?;
        let target: SocketAddr = tokio::net::lookup_host((target_host, MESHCOM_UDP_PORT))
            .await?
            .next()
            .ok_or_else(|| {
                GatewayError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("cannot resolve radio host {target_host}"),
                ))
            })?;
        info!(port = listen_port, target = %target, "UDP adapter bound");
        Ok(Self {
            socket: Arc::new(socket),
            target,
            router,
            next_msg_id: AtomicU32::new(chrono::Utc::now().timestamp() as u32),
        })
    }

    /// Run the receive loop until cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut buf = vec![0u8; 2048];
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("UDP listener stopped");
                    return;
                }
                recv = self.socket.recv_from(&mut buf) => {
                    match recv {
                        Ok((len, peer)) => {
                            self.handle_datagram(&buf[..len], peer).await;
                        }
                        Err(e) => {
                            warn!(error = %e, "UDP receive failed");
                        }
                    }
                }
            }
        }
    }

    async fn handle_datagram(&self, raw: &[u8], peer: SocketAddr) {
        let frame = match wire::decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(peer = %peer, error = %e, "dropping undecodable datagram");
                return;
            }
        };

        let own = self.router.my_callsign().unwrap_or("");
        let mesh = match frame_to_message(frame, own) {
            Some(mesh) => mesh,
            None => return,
        };

        debug!(src = %mesh.src, dst = %mesh.dst, kind = mesh.kind.as_str(), "UDP frame decoded");
        self.router
            .publish("udp", Topic::MeshMessage, RouterEvent::Mesh(mesh))
            .await;
    }
}

#[async_trait]
impl MeshTransport for UdpAdapter {
    async fn send_message(&self, out: &OutboundMessage) -> GatewayResult<()> {
        let msg_id = self.next_msg_id.fetch_add(1, Ordering::Relaxed);
        let frame = OutboundFrame {
            msg_id,
            max_hop: DEFAULT_MAX_HOP,
            mesh_info: 0,
            src: out
                .src
                .clone()
                .or_else(|| self.router.my_callsign().map(str::to_string))
                .unwrap_or_default(),
            dst: out.dst.clone(),
            message: out.msg.clone(),
            hw_id: 0,
            lora_mod: 0,
            fw: 0,
            time_ms: chrono::Utc::now().timestamp_millis() as u32,
        };
        let raw = wire::encode_text(&frame);
        self.socket.send_to(&raw, self.target).await?;
        debug!(dst = %out.dst, msg_id = %format!("{msg_id:08X}"), "UDP frame sent");
        Ok(())
    }
}

/// Convert a decoded wire frame into the canonical record.
///
/// Position frames carry either an APRS position report or `T#` telemetry;
/// both are parsed here so the storage layer sees typed fields.
pub fn frame_to_message(frame: WireFrame, own_callsign: &str) -> Option<MeshMessage> {
    match frame {
        WireFrame::Ack(ack) => {
            let mut mesh = MeshMessage::new("", "", "", MessageKind::Ack, "lora");
            mesh.msg_id = Some(format!("{:08X}", ack.msg_id));
            mesh.ack_id = Some(format!("{:08X}", ack.ack_id));
            mesh.max_hop = Some(ack.hop_count);
            mesh.transformer = Some("ack".to_string());
            Some(mesh)
        }
        WireFrame::Text(p) => Some(text_frame_to_message(p, own_callsign)),
        WireFrame::Position(p) => {
            if p.message.starts_with("T#") {
                Some(tele_frame_to_message(p, own_callsign))
            } else {
                Some(pos_frame_to_message(p, own_callsign))
            }
        }
    }
}

fn base_message(p: &FramePayload, kind: MessageKind, own_callsign: &str) -> MeshMessage {
    let (src, via) = ble_protocol::split_path(&p.path, own_callsign);
    let mut mesh = MeshMessage::new(&src, &p.dest, &p.message, kind, "lora");
    mesh.msg_id = Some(format!("{:08X}", p.msg_id));
    mesh.transformer = Some(kind.as_str().to_string());
    mesh.via = if via.is_empty() { None } else { Some(via) };
    mesh.hw_id = Some(p.hw_id);
    mesh.lora_mod = Some(p.lora_mod);
    mesh.max_hop = Some(p.max_hop);
    mesh.mesh_info = Some(p.mesh_info);
    mesh.firmware = Some(p.fw.to_string());
    mesh.fw_sub = if p.fw_sub != 0 {
        Some(char::from(p.fw_sub).to_string())
    } else {
        None
    };
    mesh
}

fn text_frame_to_message(p: FramePayload, own_callsign: &str) -> MeshMessage {
    base_message(&p, MessageKind::Msg, own_callsign)
}

fn pos_frame_to_message(p: FramePayload, own_callsign: &str) -> MeshMessage {
    let mut mesh = base_message(&p, MessageKind::Pos, own_callsign);
    let parsed = ble_protocol::parse_aprs_position(&p.message);
    if let Some(aprs) = parsed {
        mesh.position = Some(PositionReport {
            lat: Some(aprs.lat),
            lon: Some(aprs.lon),
            alt: aprs.alt,
            aprs_symbol: Some(aprs.symbol),
            aprs_symbol_group: Some(aprs.symbol_group),
            batt: aprs.battery,
        });
        if aprs.weather.is_some() {
            mesh.telemetry = aprs.weather;
        }
    }
    // Position beacons are addressed to everyone.
    mesh.dst = "*".to_string();
    mesh
}

fn tele_frame_to_message(p: FramePayload, own_callsign: &str) -> MeshMessage {
    let mut mesh = base_message(&p, MessageKind::Tele, own_callsign);
    mesh.telemetry = ble_protocol::parse_aprs_telemetry(&p.message)
        .or_else(|| Some(TelemetryReadings::default()));
    mesh.dst = "*".to_string();
    mesh
}
