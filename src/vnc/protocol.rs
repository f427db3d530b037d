//! RFB protocol message builders and parsers.
//!
//! Client → Server and Server → Client message framing per RFC 6143.

use crate::vnc::types::{ClientMessageType, EncodingType, PixelFormat};

// ── Client → Server message builders ────────────────────────────────────

/// Build SetPixelFormat message (§7.5.1).
/// 1 byte type + 3 padding + 16 bytes pixel format = 20 bytes.
pub fn build_set_pixel_format(pf: &PixelFormat) -> Vec<u8> {
    let mut buf = Vec::with_capacity(20);
    buf.push(ClientMessageType::SetPixelFormat as u8);
    buf.extend_from_slice(&[0, 0, 0]); // padding
    buf.extend_from_slice(&pf.to_bytes());
    buf
}

/// Build SetEncodings message (§7.5.2).
/// 1 byte type + 1 padding + 2 bytes count + 4 bytes per encoding.
pub fn build_set_encodings(encodings: &[EncodingType]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + encodings.len() * 4);
    buf.push(ClientMessageType::SetEncodings as u8);
    buf.push(0); // padding
    buf.extend_from_slice(&(encodings.len() as u16).to_be_bytes());
    for enc in encodings {
        buf.extend_from_slice(&enc.to_i32().to_be_bytes());
    }
    buf
}

/// Build FramebufferUpdateRequest (§7.5.3).
/// `incremental`: false = full refresh of the rectangle.
pub fn build_fb_update_request(incremental: bool, x: u16, y: u16, width: u16, height: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(10);
    buf.push(ClientMessageType::FramebufferUpdateRequest as u8);
    buf.push(u8::from(incremental));
    buf.extend_from_slice(&x.to_be_bytes());
    buf.extend_from_slice(&y.to_be_bytes());
    buf.extend_from_slice(&width.to_be_bytes());
    buf.extend_from_slice(&height.to_be_bytes());
    buf
}

/// Build KeyEvent message (§7.5.4).
pub fn build_key_event(down: bool, key: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8);
    buf.push(ClientMessageType::KeyEvent as u8);
    buf.push(u8::from(down));
    buf.extend_from_slice(&[0, 0]); // padding
    buf.extend_from_slice(&key.to_be_bytes());
    buf
}

/// Build PointerEvent message (§7.5.5).
pub fn build_pointer_event(button_mask: u8, x: u16, y: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(6);
    buf.push(ClientMessageType::PointerEvent as u8);
    buf.push(button_mask);
    buf.extend_from_slice(&x.to_be_bytes());
    buf.extend_from_slice(&y.to_be_bytes());
    buf
}

/// Build ClientCutText message (§7.5.6).
pub fn build_client_cut_text(text: &str) -> Vec<u8> {
    let bytes = text.as_bytes();
    let mut buf = Vec::with_capacity(8 + bytes.len());
    buf.push(ClientMessageType::ClientCutText as u8);
    buf.extend_from_slice(&[0, 0, 0]); // padding
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
    buf
}

/// Build the 1-byte ClientInit message. `shared` = allow other clients.
pub fn build_client_init(shared: bool) -> Vec<u8> {
    vec![u8::from(shared)]
}

// ── Server → Client parsing helpers ─────────────────────────────────────

/// Parse the ServerInit header (24 bytes, name follows separately).
/// Returns (width, height, pixel_format, name_length).
pub fn parse_server_init_header(data: &[u8; 24]) -> (u16, u16, PixelFormat, usize) {
    let width = u16::from_be_bytes([data[0], data[1]]);
    let height = u16::from_be_bytes([data[2], data[3]]);
    let mut pf_bytes = [0u8; 16];
    pf_bytes.copy_from_slice(&data[4..20]);
    let pixel_format = PixelFormat::from_bytes(&pf_bytes);
    let name_len = u32::from_be_bytes([data[20], data[21], data[22], data[23]]) as usize;
    (width, height, pixel_format, name_len)
}

/// Parse a FramebufferUpdate rectangle header (12 bytes).
/// Returns (x, y, width, height, encoding).
pub fn parse_rect_header(data: &[u8; 12]) -> (u16, u16, u16, u16, EncodingType) {
    let x = u16::from_be_bytes([data[0], data[1]]);
    let y = u16::from_be_bytes([data[2], data[3]]);
    let w = u16::from_be_bytes([data[4], data[5]]);
    let h = u16::from_be_bytes([data[6], data[7]]);
    let enc = i32::from_be_bytes([data[8], data[9], data[10], data[11]]);
    (x, y, w, h, EncodingType::from_i32(enc))
}
