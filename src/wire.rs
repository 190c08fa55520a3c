//! MeshCom binary wire format.
//!
//! Frames start with an `@` sentinel; the following byte doubles as the
//! payload type: `A` (0x41) for ACK frames, `:` (0x3A) for direct/group
//! text, `!` (0x21) for position and telemetry. Bytes 1-6 hold the
//! little-endian header `<payload_type:u8, msg_id:u32, hop_raw:u8>`; the
//! low nibble of `hop_raw` is the max-hop count, the high nibble the mesh
//! info flags. A variable region follows (relay path terminated by `>`,
//! destination terminated by `:` for text or `*` for position, then the
//! body and a NUL), and the frame ends with a fixed 13-byte footer plus a
//! terminator.
//!
//! The FCS is the byte-wise sum of everything between the sentinel and the
//! FCS field itself, with the two 8-bit halves swapped. Mismatches are
//! reported but the frame is still processed: several encoders in the
//! ecosystem disagree on the summed region.

use crate::error::{GatewayError, GatewayResult};

/// Payload type byte for ACK frames (`A`).
pub const PAYLOAD_ACK: u8 = 0x41;
/// Payload type byte for direct/group text (`:`).
pub const PAYLOAD_TEXT: u8 = 0x3A;
/// Payload type byte for position/telemetry (`!`).
pub const PAYLOAD_POS: u8 = 0x21;

/// Footer length: `<0, hw_id, lora_mod, fcs:u16, fw, lasthw, fw_sub, ending, time_ms:u32>`.
const FOOTER_LEN: usize = 13;
/// Minimum parseable text/pos frame: sentinel + header + `>` + sep + NUL + footer + terminator.
const MIN_FRAME_LEN: usize = 1 + 6 + 3 + FOOTER_LEN + 1;

/// Decoded text or position frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FramePayload {
    pub msg_id: u32,
    pub max_hop: u8,
    pub mesh_info: u8,
    /// Relay path including the trailing `>`
    pub path: String,
    /// Destination (without its terminator for text, with `*` for position)
    pub dest: String,
    /// Message body (leading `:` stripped for text frames)
    pub message: String,
    pub hw_id: u8,
    pub lora_mod: u8,
    pub fw: u8,
    pub fw_sub: u8,
    pub last_hw_id: u8,
    pub last_sending: bool,
    pub time_ms: u32,
    /// Whether the footer FCS matched the computed sum
    pub fcs_ok: bool,
}

/// Decoded ACK frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckPayload {
    pub msg_id: u32,
    /// Message id being acknowledged
    pub ack_id: u32,
    /// 0x00 node ACK, 0x01 gateway ACK
    pub ack_type: u8,
    pub server_flag: bool,
    pub hop_count: u8,
}

/// One decoded MeshCom frame.
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    Ack(AckPayload),
    /// `@:` direct or group text
    Text(FramePayload),
    /// `@!` position or telemetry
    Position(FramePayload),
}

/// Frame check sequence: byte sum with the 16-bit halves swapped.
pub fn calc_fcs(payload: &[u8]) -> u16 {
    let sum: u32 = payload.iter().map(|&b| u32::from(b)).sum();
    (((sum & 0xFF) << 8) | ((sum & 0xFF00) >> 8)) as u16
}

/// Decode a raw MeshCom frame.
pub fn decode(raw: &[u8]) -> GatewayResult<WireFrame> {
    if raw.len() < 12 || raw[0] != b'@' {
        return Err(GatewayError::decode("not a MeshCom frame", raw));
    }

    let payload_type = raw[1];
    let msg_id = u32::from_le_bytes([raw[2], raw[3], raw[4], raw[5]]);
    let hop_raw = raw[6];

    match payload_type {
        PAYLOAD_ACK => decode_ack(raw, msg_id, hop_raw),
        PAYLOAD_TEXT | PAYLOAD_POS => decode_message(raw, payload_type, msg_id, hop_raw),
        other => Err(GatewayError::decode(
            format!("unknown payload type 0x{other:02X}"),
            raw,
        )),
    }
}

fn decode_ack(raw: &[u8], msg_id: u32, hop_raw: u8) -> GatewayResult<WireFrame> {
    // ACK format: @A <msg_id:u32> <flags> <ack_msg_id:u32> <ack_type> <0x00>
    if raw.len() < 12 {
        return Err(GatewayError::decode("truncated ACK frame", raw));
    }
    let ack_id = u32::from_le_bytes([raw[6], raw[7], raw[8], raw[9]]);
    let ack_type = raw[10];
    Ok(WireFrame::Ack(AckPayload {
        msg_id,
        ack_id,
        ack_type,
        server_flag: hop_raw & 0x80 != 0,
        hop_count: hop_raw & 0x7F,
    }))
}

fn decode_message(
    raw: &[u8],
    payload_type: u8,
    msg_id: u32,
    hop_raw: u8,
) -> GatewayResult<WireFrame> {
    if raw.len() < MIN_FRAME_LEN {
        return Err(GatewayError::decode("truncated frame", raw));
    }

    let max_hop = hop_raw & 0x0F;
    let mesh_info = hop_raw >> 4;

    // Variable region between header and footer.
    let body_end = raw.len() - FOOTER_LEN - 1;
    let variable = &raw[7..body_end];

    let path_end = variable
        .iter()
        .position(|&b| b == b'>')
        .ok_or_else(|| GatewayError::decode("relay path terminator missing", raw))?;
    let path = String::from_utf8_lossy(&variable[..=path_end]).into_owned();
    let rest = &variable[path_end + 1..];

    // Destination terminator differs per payload type: `:` for text frames
    // (separator stays with the body), `*` for position frames (stays with
    // the destination).
    let (dest, body) = if payload_type == PAYLOAD_TEXT {
        let idx = rest
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(|| GatewayError::decode("destination terminator missing", raw))?;
        let dest = String::from_utf8_lossy(&rest[..idx]).into_owned();
        let body = &rest[idx + 1..];
        (dest, body)
    } else {
        let idx = rest
            .iter()
            .position(|&b| b == b'*')
            .ok_or_else(|| GatewayError::decode("destination terminator missing", raw))?;
        let dest = String::from_utf8_lossy(&rest[..=idx]).into_owned();
        let body = &rest[idx + 1..];
        (dest, body)
    };

    let body_until_nul = match body.iter().position(|&b| b == 0) {
        Some(n) => &body[..n],
        None => body,
    };
    let message = String::from_utf8_lossy(body_until_nul).trim().to_string();

    // Footer sits in the last FOOTER_LEN+1 bytes; the final byte is a
    // terminator outside the struct.
    let f = &raw[raw.len() - FOOTER_LEN - 1..raw.len() - 1];
    let hw_id = f[1];
    let lora_mod = f[2];
    let fcs = u16::from_le_bytes([f[3], f[4]]);
    let fw = f[5];
    let lasthw = f[6];
    let fw_sub = f[7];
    let time_ms = u32::from_le_bytes([f[9], f[10], f[11], f[12]]);

    // FCS covers everything after the sentinel up to the FCS field itself.
    let computed = calc_fcs(&raw[1..raw.len() - 11]);
    let fcs_ok = computed == fcs;
    if !fcs_ok {
        tracing::debug!(
            computed = %format!("0x{computed:04X}"),
            received = %format!("0x{fcs:04X}"),
            msg_id = %format!("{msg_id:08X}"),
            "frame checksum mismatch, processing anyway"
        );
    }

    let payload = FramePayload {
        msg_id,
        max_hop,
        mesh_info,
        path,
        dest,
        message,
        hw_id,
        lora_mod,
        fw,
        fw_sub,
        last_hw_id: lasthw & 0x7F,
        last_sending: lasthw & 0x80 != 0,
        time_ms,
        fcs_ok,
    };

    if payload_type == PAYLOAD_TEXT {
        Ok(WireFrame::Text(payload))
    } else {
        Ok(WireFrame::Position(payload))
    }
}

/// Parameters for an outbound text frame.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub msg_id: u32,
    pub max_hop: u8,
    pub mesh_info: u8,
    /// Source callsign; encoded as the relay path `SRC>`
    pub src: String,
    pub dst: String,
    pub message: String,
    pub hw_id: u8,
    pub lora_mod: u8,
    pub fw: u8,
    pub time_ms: u32,
}

/// Encode an outbound text frame (`@:`), computing the FCS over the same
/// region the decoder checks.
pub fn encode_text(frame: &OutboundFrame) -> Vec<u8> {
    let hop_raw = (frame.mesh_info << 4) | (frame.max_hop & 0x0F);

    let mut buf = Vec::with_capacity(64 + frame.message.len());
    buf.push(b'@');
    buf.push(PAYLOAD_TEXT);
    buf.extend_from_slice(&frame.msg_id.to_le_bytes());
    buf.push(hop_raw);
    buf.extend_from_slice(frame.src.as_bytes());
    buf.push(b'>');
    buf.extend_from_slice(frame.dst.as_bytes());
    buf.push(b':');
    buf.extend_from_slice(frame.message.as_bytes());
    buf.push(0x00);

    // Footer up to the FCS field, so the checksum can cover it.
    buf.push(0x00); // zero
    buf.push(frame.hw_id);
    buf.push(frame.lora_mod);

    let fcs = calc_fcs(&buf[1..]);
    buf.extend_from_slice(&fcs.to_le_bytes());
    buf.push(frame.fw);
    buf.push(0x00); // lasthw
    buf.push(0x00); // fw_sub
    buf.push(0x00); // ending
    buf.extend_from_slice(&frame.time_ms.to_le_bytes());
    buf.push(0x00); // terminator

    buf
}
