//! Minimal in-process RFB server pieces shared by the protocol and
//! engine tests. Only ever compiled into the test harness.

use std::io::{Read, Write};
use std::net::TcpStream;

use crate::vnc::types::PixelFormat;

/// Serve the full server side of an RFB 3.8 handshake with `None`
/// security and consume the client's SetPixelFormat + SetEncodings.
pub fn serve_handshake_none_auth(stream: &mut TcpStream, width: u16, height: u16, name: &str) {
    stream.write_all(b"RFB 003.008\n").unwrap();
    let mut version = [0u8; 12];
    stream.read_exact(&mut version).unwrap();
    assert_eq!(&version, b"RFB 003.008\n");

    stream.write_all(&[1, 1]).unwrap(); // one security type: None
    let mut choice = [0u8; 1];
    stream.read_exact(&mut choice).unwrap();
    assert_eq!(choice[0], 1);
    stream.write_all(&0u32.to_be_bytes()).unwrap(); // SecurityResult OK

    let mut client_init = [0u8; 1];
    stream.read_exact(&mut client_init).unwrap();

    let mut server_init = Vec::new();
    server_init.extend_from_slice(&width.to_be_bytes());
    server_init.extend_from_slice(&height.to_be_bytes());
    server_init.extend_from_slice(&PixelFormat::rgb32().to_bytes());
    server_init.extend_from_slice(&(name.len() as u32).to_be_bytes());
    server_init.extend_from_slice(name.as_bytes());
    stream.write_all(&server_init).unwrap();

    // SetPixelFormat (fixed 20 bytes)
    let mut spf = [0u8; 20];
    stream.read_exact(&mut spf).unwrap();
    assert_eq!(spf[0], 0);

    // SetEncodings (4-byte header + 4 bytes per encoding)
    let mut se_header = [0u8; 4];
    stream.read_exact(&mut se_header).unwrap();
    assert_eq!(se_header[0], 2);
    let count = u16::from_be_bytes([se_header[2], se_header[3]]) as usize;
    let mut encodings = vec![0u8; count * 4];
    stream.read_exact(&mut encodings).unwrap();
}

/// Build one FramebufferUpdate message with a single full-frame Raw rect
/// where every pixel is `pixel` (framebuffer byte order).
pub fn raw_update_message(width: u16, height: u16, pixel: [u8; 4]) -> Vec<u8> {
    let mut msg = vec![0u8, 0]; // type + padding
    msg.extend_from_slice(&1u16.to_be_bytes()); // one rectangle
    msg.extend_from_slice(&0u16.to_be_bytes()); // x
    msg.extend_from_slice(&0u16.to_be_bytes()); // y
    msg.extend_from_slice(&width.to_be_bytes());
    msg.extend_from_slice(&height.to_be_bytes());
    msg.extend_from_slice(&0i32.to_be_bytes()); // Raw
    for _ in 0..width as usize * height as usize {
        msg.extend_from_slice(&pixel);
    }
    msg
}

/// A client message observed by the test server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMsg {
    SetPixelFormat,
    SetEncodings,
    UpdateRequest { incremental: bool },
    Key { key: u32, down: bool },
    Pointer { x: u16, y: u16, mask: u8 },
    CutText(String),
}

/// Parse exactly one client-to-server message off the wire.
pub fn read_client_message(stream: &mut TcpStream) -> std::io::Result<ClientMsg> {
    let mut msg_type = [0u8; 1];
    stream.read_exact(&mut msg_type)?;
    match msg_type[0] {
        0 => {
            let mut rest = [0u8; 19];
            stream.read_exact(&mut rest)?;
            Ok(ClientMsg::SetPixelFormat)
        }
        2 => {
            let mut header = [0u8; 3];
            stream.read_exact(&mut header)?;
            let count = u16::from_be_bytes([header[1], header[2]]) as usize;
            let mut encodings = vec![0u8; count * 4];
            stream.read_exact(&mut encodings)?;
            Ok(ClientMsg::SetEncodings)
        }
        3 => {
            let mut rest = [0u8; 9];
            stream.read_exact(&mut rest)?;
            Ok(ClientMsg::UpdateRequest { incremental: rest[0] != 0 })
        }
        4 => {
            let mut rest = [0u8; 7];
            stream.read_exact(&mut rest)?;
            let key = u32::from_be_bytes([rest[3], rest[4], rest[5], rest[6]]);
            Ok(ClientMsg::Key { key, down: rest[0] != 0 })
        }
        5 => {
            let mut rest = [0u8; 5];
            stream.read_exact(&mut rest)?;
            Ok(ClientMsg::Pointer {
                mask: rest[0],
                x: u16::from_be_bytes([rest[1], rest[2]]),
                y: u16::from_be_bytes([rest[3], rest[4]]),
            })
        }
        6 => {
            let mut rest = [0u8; 7];
            stream.read_exact(&mut rest)?;
            let len = u32::from_be_bytes([rest[3], rest[4], rest[5], rest[6]]) as usize;
            let mut text = vec![0u8; len];
            stream.read_exact(&mut text)?;
            Ok(ClientMsg::CutText(String::from_utf8_lossy(&text).into_owned()))
        }
        other => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unexpected client message type {other}"),
        )),
    }
}
