//! Blocking RFB client.
//!
//! Owns the TCP stream for one session: drives the full handshake
//! (version, security including the vendor subtype, and init), polls
//! for server messages, parses them into typed values, and sends client
//! messages. All I/O is blocking with per-operation read timeouts; the
//! connection engine calls in from its worker thread only.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::vnc::auth;
use crate::vnc::encoding::{self, DecodedRect};
use crate::vnc::interfaces::CredentialProvider;
use crate::vnc::protocol;
use crate::vnc::types::{
    ConnectionQuality, EncodingType, PixelFormat, RfbVersion, SecurityType, ServerMessageType,
    VeyonAuthType, VncError, VncErrorKind,
};
use crate::vnc::veyon;

/// Generous ceiling for blocking reads inside a single server message.
const MESSAGE_READ_TIMEOUT: Duration = Duration::from_secs(30);
/// Read budget for each handshake step.
const HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_NAME_LEN: usize = 4096;
const MAX_CUT_TEXT_LEN: usize = 4 * 1024 * 1024;
const MAX_RRE_SUBRECTS: usize = 1 << 20;

/// Credential context for the security negotiation.
pub struct SecurityContext<'a> {
    pub credentials: &'a dyn CredentialProvider,
    pub preferred_auth: VeyonAuthType,
}

/// Why a handshake failed, with the observations the engine needs to
/// classify the failure.
#[derive(Debug)]
pub struct HandshakeError {
    pub error: VncError,
    /// At least one byte arrived from the server.
    pub service_reachable: bool,
    /// ServerInit was parsed, so the framebuffer dimensions are known.
    pub framebuffer_initialized: bool,
}

/// One parsed server-to-client message.
#[derive(Debug)]
pub enum ServerMessage {
    /// A complete framebuffer update (all rectangles of one message).
    FramebufferUpdate(Vec<UpdateRect>),
    Bell,
    CutText(String),
    /// Colour map updates are consumed and ignored (true-colour only).
    ColourMap,
}

/// One rectangle inside a framebuffer update.
#[derive(Debug)]
pub enum UpdateRect {
    /// Decoded pixels to blit.
    Pixels(DecodedRect),
    /// Copy a region already present in the framebuffer.
    Copy { src_x: u16, src_y: u16, x: u16, y: u16, width: u16, height: u16 },
    /// Cursor shape in framebuffer pixel format plus packed 1-bit mask.
    Cursor { pixels: Vec<u8>, mask: Vec<u8>, width: u16, height: u16, hot_x: u16, hot_y: u16 },
    CursorPos { x: u16, y: u16 },
    /// Server-side framebuffer resize.
    Resize { width: u16, height: u16 },
}

/// Blocking RFB protocol client for one session.
#[derive(Debug)]
pub struct RfbClient {
    stream: TcpStream,
    version: RfbVersion,
    width: u16,
    height: u16,
    server_name: String,
    pixel_format: PixelFormat,
    security_type: SecurityType,
    service_reachable: bool,
    framebuffer_initialized: bool,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl RfbClient {
    /// Resolve and connect the underlying TCP stream.
    pub fn connect(host: &str, port: u16, timeout: Duration) -> std::io::Result<TcpStream> {
        let addr = format!("{host}:{port}");
        let socket_addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| std::io::Error::new(ErrorKind::NotFound, format!("no address for {addr}")))?;
        let stream = TcpStream::connect_timeout(&socket_addr, timeout)?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Run the full RFB handshake on a fresh stream.
    pub fn establish(
        stream: TcpStream,
        quality: ConnectionQuality,
        ctx: &SecurityContext<'_>,
    ) -> Result<Self, HandshakeError> {
        let mut client = RfbClient {
            stream,
            version: RfbVersion::V3_8,
            width: 0,
            height: 0,
            server_name: String::new(),
            pixel_format: PixelFormat::rgb32(),
            security_type: SecurityType::None,
            service_reachable: false,
            framebuffer_initialized: false,
            bytes_sent: 0,
            bytes_received: 0,
        };
        match client.handshake(quality, ctx) {
            Ok(()) => Ok(client),
            Err(error) => Err(HandshakeError {
                service_reachable: client.service_reachable,
                framebuffer_initialized: client.framebuffer_initialized,
                error,
            }),
        }
    }

    fn handshake(
        &mut self,
        quality: ConnectionQuality,
        ctx: &SecurityContext<'_>,
    ) -> Result<(), VncError> {
        self.stream.set_read_timeout(Some(HANDSHAKE_READ_TIMEOUT))?;

        // ── Version exchange ────────────────────────────────────────
        let mut banner = [0u8; 12];
        self.read_exact_counted(&mut banner)?;
        self.service_reachable = true;

        let banner_str = String::from_utf8_lossy(&banner);
        let version = RfbVersion::from_version_string(&banner_str).ok_or_else(|| {
            VncError::new(
                VncErrorKind::UnsupportedVersion,
                format!("unsupported server version: {}", banner_str.trim()),
            )
        })?;
        self.write_counted(version.banner())?;
        self.version = version;
        log::debug!("negotiated RFB {version}");

        // ── Security negotiation ────────────────────────────────────
        let security_type = match version {
            RfbVersion::V3_3 => {
                let t = self.read_u32()?;
                SecurityType::from_byte(t as u8)
                    .ok_or_else(|| VncError::protocol(format!("server-chosen security type {t} unsupported")))?
            }
            _ => {
                let count = self.read_u8()? as usize;
                if count == 0 {
                    let reason = self.read_reason_string()?;
                    return Err(VncError::auth_failed(format!("server refused: {reason}")));
                }
                let mut type_bytes = vec![0u8; count];
                self.read_exact_counted(&mut type_bytes)?;
                let offered: Vec<SecurityType> =
                    type_bytes.iter().filter_map(|b| SecurityType::from_byte(*b)).collect();
                let selected = auth::select_security_type(&offered).ok_or_else(|| {
                    VncError::new(
                        VncErrorKind::AuthUnsupported,
                        format!("no supported security type in {type_bytes:?}"),
                    )
                })?;
                self.write_counted(&[selected.to_byte()])?;
                selected
            }
        };
        self.security_type = security_type;
        log::debug!("using security type {security_type}");

        match security_type {
            SecurityType::None => {
                if version == RfbVersion::V3_8 {
                    self.read_security_result()?;
                }
            }
            SecurityType::VncAuthentication => {
                let mut challenge = [0u8; 16];
                self.read_exact_counted(&mut challenge)?;
                let password = ctx.credentials.logon_password().unwrap_or_default();
                self.write_counted(&auth::handle_vnc_auth(&challenge, &password))?;
                self.read_security_result()?;
            }
            SecurityType::Veyon => {
                veyon::negotiate(&mut self.stream, ctx.credentials, ctx.preferred_auth)?;
                self.read_security_result()?;
            }
        }

        // ── ClientInit / ServerInit ─────────────────────────────────
        self.write_counted(&protocol::build_client_init(true))?;

        let mut header = [0u8; 24];
        self.read_exact_counted(&mut header)?;
        let (width, height, server_pf, name_len) = protocol::parse_server_init_header(&header);
        if name_len > MAX_NAME_LEN {
            return Err(VncError::protocol(format!("absurd desktop name length {name_len}")));
        }
        let mut name = vec![0u8; name_len];
        self.read_exact_counted(&mut name)?;

        self.width = width;
        self.height = height;
        self.server_name = String::from_utf8_lossy(&name).into_owned();
        self.framebuffer_initialized = true;
        log::info!(
            "server '{}' {}x{} ({})",
            self.server_name,
            width,
            height,
            server_pf.bits_per_pixel
        );

        // ── Fixed pixel format + profile encodings ──────────────────
        self.pixel_format = PixelFormat::rgb32();
        self.write_counted(&protocol::build_set_pixel_format(&self.pixel_format))?;
        self.write_counted(&protocol::build_set_encodings(&quality.wire_encodings()))?;

        Ok(())
    }

    fn read_security_result(&mut self) -> Result<(), VncError> {
        let status = self.read_u32()?;
        if status == 0 {
            return Ok(());
        }
        // RFB 3.8 appends a reason string on failure.
        let reason = if self.version == RfbVersion::V3_8 {
            self.read_reason_string().ok()
        } else {
            None
        };
        auth::security_result(status, reason.as_deref().map(str::as_bytes))
    }

    fn read_reason_string(&mut self) -> Result<String, VncError> {
        let len = self.read_u32()? as usize;
        if len > MAX_NAME_LEN {
            return Err(VncError::protocol(format!("absurd reason length {len}")));
        }
        let mut buf = vec![0u8; len];
        self.read_exact_counted(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    // ── Polling and message dispatch ────────────────────────────────

    /// Check whether a server message is ready within `timeout`.
    ///
    /// `Ok(true)` = at least one byte is buffered, `Ok(false)` = nothing
    /// arrived in time, `Err` = the connection is dead. A zero timeout
    /// polls without blocking.
    pub fn wait_for_message(&self, timeout: Duration) -> Result<bool, VncError> {
        let mut probe = [0u8; 1];
        let result = if timeout.is_zero() {
            self.stream.set_nonblocking(true)?;
            let r = self.stream.peek(&mut probe);
            self.stream.set_nonblocking(false)?;
            r
        } else {
            self.stream.set_read_timeout(Some(timeout))?;
            self.stream.peek(&mut probe)
        };
        match result {
            Ok(0) => Err(VncError::new(VncErrorKind::NotConnected, "server closed the connection")),
            Ok(_) => Ok(true),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(false),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Read and parse exactly one server message.
    pub fn handle_server_message(&mut self) -> Result<ServerMessage, VncError> {
        self.stream.set_read_timeout(Some(MESSAGE_READ_TIMEOUT))?;
        let msg_type = self.read_u8()?;
        match ServerMessageType::from_byte(msg_type) {
            Some(ServerMessageType::FramebufferUpdate) => self.read_framebuffer_update(),
            Some(ServerMessageType::SetColourMapEntries) => {
                // 1 pad + first colour (2) + count (2), then 6 bytes each.
                let mut header = [0u8; 5];
                self.read_exact_counted(&mut header)?;
                let entries = u16::from_be_bytes([header[3], header[4]]) as usize;
                let mut data = vec![0u8; entries * 6];
                self.read_exact_counted(&mut data)?;
                Ok(ServerMessage::ColourMap)
            }
            Some(ServerMessageType::Bell) => Ok(ServerMessage::Bell),
            Some(ServerMessageType::ServerCutText) => {
                let mut header = [0u8; 7];
                self.read_exact_counted(&mut header)?;
                let len = u32::from_be_bytes([header[3], header[4], header[5], header[6]]) as usize;
                if len > MAX_CUT_TEXT_LEN {
                    return Err(VncError::protocol(format!("absurd cut-text length {len}")));
                }
                let mut text = vec![0u8; len];
                self.read_exact_counted(&mut text)?;
                Ok(ServerMessage::CutText(String::from_utf8_lossy(&text).into_owned()))
            }
            None => Err(VncError::protocol(format!("unknown server message type {msg_type}"))),
        }
    }

    fn read_framebuffer_update(&mut self) -> Result<ServerMessage, VncError> {
        let mut header = [0u8; 3];
        self.read_exact_counted(&mut header)?;
        let num_rects = u16::from_be_bytes([header[1], header[2]]) as usize;

        let mut rects = Vec::with_capacity(num_rects.min(64));
        for _ in 0..num_rects {
            let mut rect_header = [0u8; 12];
            self.read_exact_counted(&mut rect_header)?;
            let (x, y, w, h, enc) = protocol::parse_rect_header(&rect_header);

            match enc {
                EncodingType::Raw => {
                    let len = encoding::raw_data_size(w, h, &self.pixel_format);
                    let mut data = vec![0u8; len];
                    self.read_exact_counted(&mut data)?;
                    let rect = encoding::decode_raw(x, y, w, h, &data, &self.pixel_format)
                        .map_err(VncError::protocol)?;
                    rects.push(UpdateRect::Pixels(rect));
                }
                EncodingType::CopyRect => {
                    let mut data = [0u8; 4];
                    self.read_exact_counted(&mut data)?;
                    let (src_x, src_y) = encoding::decode_copyrect(&data).map_err(VncError::protocol)?;
                    rects.push(UpdateRect::Copy { src_x, src_y, x, y, width: w, height: h });
                }
                EncodingType::RRE => {
                    let bpp = self.pixel_format.bytes_per_pixel();
                    let mut head = vec![0u8; 4 + bpp];
                    self.read_exact_counted(&mut head)?;
                    let num_sub =
                        u32::from_be_bytes([head[0], head[1], head[2], head[3]]) as usize;
                    if num_sub > MAX_RRE_SUBRECTS {
                        return Err(VncError::protocol(format!("absurd RRE subrect count {num_sub}")));
                    }
                    let mut sub = vec![0u8; num_sub * (bpp + 8)];
                    self.read_exact_counted(&mut sub)?;
                    head.extend_from_slice(&sub);
                    let rect = encoding::decode_rre(x, y, w, h, &head, &self.pixel_format)
                        .map_err(VncError::protocol)?;
                    rects.push(UpdateRect::Pixels(rect));
                }
                EncodingType::Hextile => {
                    let data = self.read_hextile_stream(w, h)?;
                    let rect = encoding::decode_hextile(x, y, w, h, &data, &self.pixel_format)
                        .map_err(VncError::protocol)?;
                    rects.push(UpdateRect::Pixels(rect));
                }
                EncodingType::CursorPseudo => {
                    let bpp = self.pixel_format.bytes_per_pixel();
                    let pixel_len = w as usize * h as usize * bpp;
                    let mask_len = ((w as usize + 7) / 8) * h as usize;
                    let mut pixels = vec![0u8; pixel_len];
                    self.read_exact_counted(&mut pixels)?;
                    let mut mask = vec![0u8; mask_len];
                    self.read_exact_counted(&mut mask)?;
                    rects.push(UpdateRect::Cursor {
                        pixels,
                        mask,
                        width: w,
                        height: h,
                        hot_x: x,
                        hot_y: y,
                    });
                }
                EncodingType::PointerPosPseudo => {
                    rects.push(UpdateRect::CursorPos { x, y });
                }
                EncodingType::DesktopSizePseudo => {
                    self.width = w;
                    self.height = h;
                    rects.push(UpdateRect::Resize { width: w, height: h });
                }
                EncodingType::LastRectPseudo => break,
                other => {
                    // An encoding we offered but cannot decode desyncs
                    // the stream; the session has to be torn down.
                    return Err(VncError::protocol(format!(
                        "server sent undecodable encoding {}",
                        other.to_i32()
                    )));
                }
            }
        }

        Ok(ServerMessage::FramebufferUpdate(rects))
    }

    /// Read one Hextile rectangle's variable-length tile stream.
    ///
    /// Tile sizes depend on per-tile flags, so the stream has to be
    /// walked tile by tile; the raw bytes are accumulated for the
    /// decoder, which re-walks them.
    fn read_hextile_stream(&mut self, width: u16, height: u16) -> Result<Vec<u8>, VncError> {
        use crate::vnc::encoding::{
            HEXTILE_ANY_SUBRECTS, HEXTILE_BG_SPECIFIED, HEXTILE_FG_SPECIFIED, HEXTILE_RAW,
            HEXTILE_SUBRECTS_COLOURED,
        };

        let bpp = self.pixel_format.bytes_per_pixel();
        let w = width as usize;
        let h = height as usize;
        let tiles_x = (w + 15) / 16;
        let tiles_y = (h + 15) / 16;

        let mut data = Vec::new();
        for ty in 0..tiles_y {
            for tx in 0..tiles_x {
                let tile_w = 16.min(w - tx * 16);
                let tile_h = 16.min(h - ty * 16);

                let flags = self.read_u8()?;
                data.push(flags);

                if flags & HEXTILE_RAW != 0 {
                    let start = data.len();
                    data.resize(start + tile_w * tile_h * bpp, 0);
                    self.read_exact_counted(&mut data[start..])?;
                    continue;
                }
                if flags & HEXTILE_BG_SPECIFIED != 0 {
                    let start = data.len();
                    data.resize(start + bpp, 0);
                    self.read_exact_counted(&mut data[start..])?;
                }
                if flags & HEXTILE_FG_SPECIFIED != 0 {
                    let start = data.len();
                    data.resize(start + bpp, 0);
                    self.read_exact_counted(&mut data[start..])?;
                }
                if flags & HEXTILE_ANY_SUBRECTS != 0 {
                    let count = self.read_u8()?;
                    data.push(count);
                    let per_subrect =
                        if flags & HEXTILE_SUBRECTS_COLOURED != 0 { bpp + 2 } else { 2 };
                    let start = data.len();
                    data.resize(start + count as usize * per_subrect, 0);
                    self.read_exact_counted(&mut data[start..])?;
                }
            }
        }
        Ok(data)
    }

    // ── Outbound client messages ────────────────────────────────────

    pub fn send_framebuffer_update_request(
        &mut self,
        x: u16,
        y: u16,
        width: u16,
        height: u16,
        incremental: bool,
    ) -> Result<(), VncError> {
        self.write_counted(&protocol::build_fb_update_request(incremental, x, y, width, height))
    }

    pub fn send_key_event(&mut self, key: u32, down: bool) -> Result<(), VncError> {
        self.write_counted(&protocol::build_key_event(down, key))
    }

    pub fn send_pointer_event(&mut self, x: u16, y: u16, button_mask: u8) -> Result<(), VncError> {
        self.write_counted(&protocol::build_pointer_event(button_mask, x, y))
    }

    pub fn send_cut_text(&mut self, text: &str) -> Result<(), VncError> {
        self.write_counted(&protocol::build_client_cut_text(text))
    }

    // ── Accessors ───────────────────────────────────────────────────

    /// Framebuffer dimensions announced by the server.
    pub fn size(&self) -> (u16, u16) {
        (self.width, self.height)
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn pixel_format(&self) -> &PixelFormat {
        &self.pixel_format
    }

    pub fn security_type(&self) -> SecurityType {
        self.security_type
    }

    // ── Raw I/O helpers ─────────────────────────────────────────────

    fn read_u8(&mut self) -> Result<u8, VncError> {
        let mut buf = [0u8; 1];
        self.read_exact_counted(&mut buf)?;
        Ok(buf[0])
    }

    fn read_u32(&mut self) -> Result<u32, VncError> {
        let mut buf = [0u8; 4];
        self.read_exact_counted(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn read_exact_counted(&mut self, buf: &mut [u8]) -> Result<(), VncError> {
        self.stream.read_exact(buf)?;
        self.bytes_received += buf.len() as u64;
        Ok(())
    }

    fn write_counted(&mut self, buf: &[u8]) -> Result<(), VncError> {
        self.stream.write_all(buf)?;
        self.bytes_sent += buf.len() as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vnc::interfaces::StaticCredentials;
    use crate::vnc::testutil;
    use std::net::TcpListener;
    use std::thread;

    fn establish_against<F>(server: F) -> Result<RfbClient, HandshakeError>
    where
        F: FnOnce(TcpStream) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            server(stream);
        });

        let stream = RfbClient::connect("127.0.0.1", addr.port(), Duration::from_secs(3)).unwrap();
        let creds = StaticCredentials::default();
        let ctx = SecurityContext { credentials: &creds, preferred_auth: VeyonAuthType::Logon };
        let result = RfbClient::establish(stream, ConnectionQuality::Screenshot, &ctx);
        handle.join().unwrap();
        result
    }

    #[test]
    fn establish_none_auth() {
        let client = establish_against(|mut stream| {
            testutil::serve_handshake_none_auth(&mut stream, 320, 240, "lab-07");
        })
        .unwrap();
        assert_eq!(client.size(), (320, 240));
        assert_eq!(client.server_name(), "lab-07");
        assert_eq!(client.security_type(), SecurityType::None);
    }

    #[test]
    fn establish_rejects_unknown_version() {
        let err = establish_against(|mut stream| {
            stream.write_all(b"RFB 004.000\n").unwrap();
            let mut buf = [0u8; 12];
            let _ = stream.read_exact(&mut buf);
        })
        .unwrap_err();
        assert!(err.service_reachable);
        assert!(!err.framebuffer_initialized);
        assert_eq!(err.error.kind, VncErrorKind::UnsupportedVersion);
    }

    #[test]
    fn establish_server_refusal_reason() {
        let err = establish_against(|mut stream| {
            stream.write_all(b"RFB 003.008\n").unwrap();
            let mut buf = [0u8; 12];
            stream.read_exact(&mut buf).unwrap();
            stream.write_all(&[0]).unwrap(); // zero security types
            let reason = b"go away";
            stream.write_all(&(reason.len() as u32).to_be_bytes()).unwrap();
            stream.write_all(reason).unwrap();
        })
        .unwrap_err();
        assert!(err.service_reachable);
        assert_eq!(err.error.kind, VncErrorKind::AuthFailed);
        assert!(err.error.message.contains("go away"));
    }

    #[test]
    fn establish_close_mid_negotiation() {
        // Server drops the connection after reading the chosen type;
        // the framebuffer is never initialized.
        let err = establish_against(|mut stream| {
            stream.write_all(b"RFB 003.008\n").unwrap();
            let mut buf = [0u8; 12];
            stream.read_exact(&mut buf).unwrap();
            stream.write_all(&[1, SecurityType::None.to_byte()]).unwrap();
            let mut choice = [0u8; 1];
            stream.read_exact(&mut choice).unwrap();
            // close without SecurityResult
        })
        .unwrap_err();
        assert!(err.service_reachable);
        assert!(!err.framebuffer_initialized);
    }

    #[test]
    fn establish_failed_security_result() {
        let err = establish_against(|mut stream| {
            stream.write_all(b"RFB 003.008\n").unwrap();
            let mut buf = [0u8; 12];
            stream.read_exact(&mut buf).unwrap();
            stream.write_all(&[1, SecurityType::None.to_byte()]).unwrap();
            let mut choice = [0u8; 1];
            stream.read_exact(&mut choice).unwrap();
            stream.write_all(&1u32.to_be_bytes()).unwrap();
            let reason = b"denied";
            stream.write_all(&(reason.len() as u32).to_be_bytes()).unwrap();
            stream.write_all(reason).unwrap();
        })
        .unwrap_err();
        assert_eq!(err.error.kind, VncErrorKind::AuthFailed);
        assert!(err.error.message.contains("denied"));
    }

    #[test]
    fn wait_and_handle_bell() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            testutil::serve_handshake_none_auth(&mut stream, 100, 100, "x");
            stream.write_all(&[ServerMessageType::Bell as u8]).unwrap();
            // hold the socket open until the client is done
            let mut sink = [0u8; 64];
            while let Ok(n) = stream.read(&mut sink) {
                if n == 0 {
                    break;
                }
            }
        });

        let stream = RfbClient::connect("127.0.0.1", addr.port(), Duration::from_secs(3)).unwrap();
        let creds = StaticCredentials::default();
        let ctx = SecurityContext { credentials: &creds, preferred_auth: VeyonAuthType::Logon };
        let mut client = RfbClient::establish(stream, ConnectionQuality::Default, &ctx).unwrap();

        assert!(client.wait_for_message(Duration::from_secs(2)).unwrap());
        assert!(matches!(client.handle_server_message().unwrap(), ServerMessage::Bell));
        // Nothing further buffered.
        assert!(!client.wait_for_message(Duration::ZERO).unwrap());

        drop(client);
        handle.join().unwrap();
    }

    #[test]
    fn handle_raw_update_and_cut_text() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            testutil::serve_handshake_none_auth(&mut stream, 4, 2, "x");
            stream
                .write_all(&testutil::raw_update_message(4, 2, [1, 2, 3, 0]))
                .unwrap();
            // ServerCutText "hi"
            let mut cut = vec![ServerMessageType::ServerCutText as u8, 0, 0, 0];
            cut.extend_from_slice(&2u32.to_be_bytes());
            cut.extend_from_slice(b"hi");
            stream.write_all(&cut).unwrap();
            let mut sink = [0u8; 64];
            while let Ok(n) = stream.read(&mut sink) {
                if n == 0 {
                    break;
                }
            }
        });

        let stream = RfbClient::connect("127.0.0.1", addr.port(), Duration::from_secs(3)).unwrap();
        let creds = StaticCredentials::default();
        let ctx = SecurityContext { credentials: &creds, preferred_auth: VeyonAuthType::Logon };
        let mut client = RfbClient::establish(stream, ConnectionQuality::Screenshot, &ctx).unwrap();

        match client.handle_server_message().unwrap() {
            ServerMessage::FramebufferUpdate(rects) => {
                assert_eq!(rects.len(), 1);
                match &rects[0] {
                    UpdateRect::Pixels(rect) => {
                        assert_eq!((rect.width, rect.height), (4, 2));
                        assert_eq!(rect.pixels.len(), 4 * 2 * 4);
                        assert_eq!(&rect.pixels[0..4], &[1, 2, 3, 0]);
                    }
                    other => panic!("expected pixels, got {other:?}"),
                }
            }
            other => panic!("expected update, got {other:?}"),
        }

        match client.handle_server_message().unwrap() {
            ServerMessage::CutText(text) => assert_eq!(text, "hi"),
            other => panic!("expected cut text, got {other:?}"),
        }

        drop(client);
        handle.join().unwrap();
    }

    #[test]
    fn undecodable_encoding_is_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            testutil::serve_handshake_none_auth(&mut stream, 8, 8, "x");
            // One ZRLE rect, which the client cannot decode.
            let mut msg = vec![ServerMessageType::FramebufferUpdate as u8, 0];
            msg.extend_from_slice(&1u16.to_be_bytes());
            msg.extend_from_slice(&0u16.to_be_bytes());
            msg.extend_from_slice(&0u16.to_be_bytes());
            msg.extend_from_slice(&8u16.to_be_bytes());
            msg.extend_from_slice(&8u16.to_be_bytes());
            msg.extend_from_slice(&16i32.to_be_bytes());
            stream.write_all(&msg).unwrap();
            let mut sink = [0u8; 64];
            while let Ok(n) = stream.read(&mut sink) {
                if n == 0 {
                    break;
                }
            }
        });

        let stream = RfbClient::connect("127.0.0.1", addr.port(), Duration::from_secs(3)).unwrap();
        let creds = StaticCredentials::default();
        let ctx = SecurityContext { credentials: &creds, preferred_auth: VeyonAuthType::Logon };
        let mut client = RfbClient::establish(stream, ConnectionQuality::Default, &ctx).unwrap();

        let err = client.handle_server_message().unwrap_err();
        assert_eq!(err.kind, VncErrorKind::ProtocolViolation);

        drop(client);
        handle.join().unwrap();
    }
}
