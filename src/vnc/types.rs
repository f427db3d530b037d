//! RFB/VNC types: protocol vocabulary, connection states, quality profiles,
//! session metadata, errors.

use serde::{Deserialize, Serialize};
use std::fmt;

// ── RFB Protocol Version ────────────────────────────────────────────────

/// Supported RFB protocol versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RfbVersion {
    /// RFB 3.3 — original version, single server-chosen security type.
    V3_3,
    /// RFB 3.7 — multiple security type negotiation.
    V3_7,
    /// RFB 3.8 — improved error reporting.
    V3_8,
}

impl RfbVersion {
    /// Parse from the 12-byte server version banner.
    pub fn from_version_string(s: &str) -> Option<Self> {
        let trimmed = s.trim();
        if trimmed.starts_with("RFB 003.008") {
            Some(Self::V3_8)
        } else if trimmed.starts_with("RFB 003.007") {
            Some(Self::V3_7)
        } else if trimmed.starts_with("RFB 003.003") {
            Some(Self::V3_3)
        } else {
            None
        }
    }

    /// The 12-byte banner we send back for this version.
    pub fn banner(&self) -> &'static [u8; 12] {
        match self {
            Self::V3_3 => b"RFB 003.003\n",
            Self::V3_7 => b"RFB 003.007\n",
            Self::V3_8 => b"RFB 003.008\n",
        }
    }
}

impl fmt::Display for RfbVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V3_3 => write!(f, "3.3"),
            Self::V3_7 => write!(f, "3.7"),
            Self::V3_8 => write!(f, "3.8"),
        }
    }
}

// ── Security Types ──────────────────────────────────────────────────────

/// RFB security types (RFC 6143 §7.1.2 plus the vendor subtype).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SecurityType {
    /// No authentication required.
    None = 1,
    /// VNC authentication (DES challenge-response).
    VncAuthentication = 2,
    /// Vendor security subtype carrying the credential sub-handshake.
    Veyon = 21,
}

impl SecurityType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::None),
            2 => Some(Self::VncAuthentication),
            21 => Some(Self::Veyon),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::VncAuthentication => "VNC Authentication",
            Self::Veyon => "Veyon",
        }
    }
}

impl fmt::Display for SecurityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ── Pixel Format ────────────────────────────────────────────────────────

/// RFB pixel format descriptor (§7.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelFormat {
    pub bits_per_pixel: u8,
    pub depth: u8,
    pub big_endian: bool,
    pub true_colour: bool,
    pub red_max: u16,
    pub green_max: u16,
    pub blue_max: u16,
    pub red_shift: u8,
    pub green_shift: u8,
    pub blue_shift: u8,
}

impl PixelFormat {
    /// The engine's fixed wire format: 32-bit little-endian RGB,
    /// red shift 16, green shift 8, blue shift 0, 255 per channel.
    pub fn rgb32() -> Self {
        Self {
            bits_per_pixel: 32,
            depth: 24,
            big_endian: false,
            true_colour: true,
            red_max: 255,
            green_max: 255,
            blue_max: 255,
            red_shift: 16,
            green_shift: 8,
            blue_shift: 0,
        }
    }

    /// Serialize to the 16-byte wire format.
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[0] = self.bits_per_pixel;
        buf[1] = self.depth;
        buf[2] = u8::from(self.big_endian);
        buf[3] = u8::from(self.true_colour);
        buf[4..6].copy_from_slice(&self.red_max.to_be_bytes());
        buf[6..8].copy_from_slice(&self.green_max.to_be_bytes());
        buf[8..10].copy_from_slice(&self.blue_max.to_be_bytes());
        buf[10] = self.red_shift;
        buf[11] = self.green_shift;
        buf[12] = self.blue_shift;
        // 13..16 = padding
        buf
    }

    /// Parse from the 16-byte wire format.
    pub fn from_bytes(buf: &[u8; 16]) -> Self {
        Self {
            bits_per_pixel: buf[0],
            depth: buf[1],
            big_endian: buf[2] != 0,
            true_colour: buf[3] != 0,
            red_max: u16::from_be_bytes([buf[4], buf[5]]),
            green_max: u16::from_be_bytes([buf[6], buf[7]]),
            blue_max: u16::from_be_bytes([buf[8], buf[9]]),
            red_shift: buf[10],
            green_shift: buf[11],
            blue_shift: buf[12],
        }
    }

    /// Bytes per pixel (1, 2, or 4).
    pub fn bytes_per_pixel(&self) -> usize {
        (self.bits_per_pixel as usize + 7) / 8
    }
}

impl Default for PixelFormat {
    fn default() -> Self {
        Self::rgb32()
    }
}

// ── Encoding Types ──────────────────────────────────────────────────────

/// RFB encoding types (§7.7) including the pseudo-encodings carrying
/// compression and JPEG quality hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncodingType {
    Raw,
    CopyRect,
    RRE,
    CoRRE,
    Hextile,
    Zlib,
    Tight,
    Ultra,
    ZRLE,
    /// Cursor pseudo-encoding (local cursor rendering).
    CursorPseudo,
    /// Pointer position pseudo-encoding.
    PointerPosPseudo,
    /// DesktopSize pseudo-encoding.
    DesktopSizePseudo,
    /// LastRect pseudo-encoding.
    LastRectPseudo,
    /// Compression level hint 0–9 (wire range −256…−247).
    CompressLevel(u8),
    /// JPEG quality level hint 0–9 (wire range −32…−23).
    QualityLevel(u8),
    /// Unknown / custom encoding.
    Other(i32),
}

impl EncodingType {
    pub fn to_i32(self) -> i32 {
        match self {
            Self::Raw => 0,
            Self::CopyRect => 1,
            Self::RRE => 2,
            Self::CoRRE => 4,
            Self::Hextile => 5,
            Self::Zlib => 6,
            Self::Tight => 7,
            Self::Ultra => 9,
            Self::ZRLE => 16,
            Self::CursorPseudo => -239,
            Self::PointerPosPseudo => -232,
            Self::DesktopSizePseudo => -223,
            Self::LastRectPseudo => -224,
            Self::CompressLevel(l) => -256 + i32::from(l.min(9)),
            Self::QualityLevel(q) => -32 + i32::from(q.min(9)),
            Self::Other(v) => v,
        }
    }

    pub fn from_i32(v: i32) -> Self {
        match v {
            0 => Self::Raw,
            1 => Self::CopyRect,
            2 => Self::RRE,
            4 => Self::CoRRE,
            5 => Self::Hextile,
            6 => Self::Zlib,
            7 => Self::Tight,
            9 => Self::Ultra,
            16 => Self::ZRLE,
            -239 => Self::CursorPseudo,
            -232 => Self::PointerPosPseudo,
            -223 => Self::DesktopSizePseudo,
            -224 => Self::LastRectPseudo,
            -256..=-247 => Self::CompressLevel((v + 256) as u8),
            -32..=-23 => Self::QualityLevel((v + 32) as u8),
            other => Self::Other(other),
        }
    }
}

// ── Message Type Codes ──────────────────────────────────────────────────

/// Client-to-server message type codes (§7.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientMessageType {
    SetPixelFormat = 0,
    SetEncodings = 2,
    FramebufferUpdateRequest = 3,
    KeyEvent = 4,
    PointerEvent = 5,
    ClientCutText = 6,
}

/// Server-to-client message type codes (§7.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerMessageType {
    FramebufferUpdate = 0,
    SetColourMapEntries = 1,
    Bell = 2,
    ServerCutText = 3,
}

impl ServerMessageType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::FramebufferUpdate),
            1 => Some(Self::SetColourMapEntries),
            2 => Some(Self::Bell),
            3 => Some(Self::ServerCutText),
            _ => None,
        }
    }
}

// ── Connection State ────────────────────────────────────────────────────

/// Observable connection state, driven by the worker thread only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    Disconnected,
    Connecting,
    Connected,
    HostOffline,
    ServiceUnreachable,
    AuthenticationFailed,
    ConnectionFailed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::HostOffline => "host offline",
            Self::ServiceUnreachable => "service unreachable",
            Self::AuthenticationFailed => "authentication failed",
            Self::ConnectionFailed => "connection failed",
        };
        write!(f, "{s}")
    }
}

// ── Framebuffer Phase ───────────────────────────────────────────────────

/// Progress of the framebuffer through a connection session.
///
/// `Initialized` means the buffer is allocated but no complete update has
/// arrived yet; the engine keeps requesting full updates in that phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramebufferPhase {
    Invalid,
    Initialized,
    FirstUpdate,
    Valid,
}

// ── Quality Profiles ────────────────────────────────────────────────────

/// Named quality presets selecting encodings and compression parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionQuality {
    /// Lossless single-shot capture.
    Screenshot,
    /// Interactive remote control.
    RemoteControl,
    /// Low-bandwidth thumbnail stream.
    Thumbnail,
    /// General monitoring.
    Default,
}

impl ConnectionQuality {
    /// Preferred encodings, most desired first.
    pub fn encodings(&self) -> Vec<EncodingType> {
        use EncodingType::*;
        match self {
            Self::Screenshot => vec![Raw],
            Self::RemoteControl => vec![CopyRect, Hextile, Raw],
            Self::Thumbnail | Self::Default => {
                vec![ZRLE, Ultra, CopyRect, Hextile, Zlib, CoRRE, RRE, Raw]
            }
        }
    }

    /// Compression level 0–9.
    pub fn compression_level(&self) -> u8 {
        match self {
            Self::Thumbnail => 9,
            _ => 0,
        }
    }

    /// JPEG quality level 0–9.
    pub fn jpeg_quality(&self) -> u8 {
        match self {
            Self::Thumbnail => 5,
            _ => 9,
        }
    }

    pub fn jpeg_enabled(&self) -> bool {
        matches!(self, Self::Thumbnail)
    }

    /// Full encoding list for the SetEncodings message: the profile's
    /// encodings followed by level hints and the pseudo-encodings the
    /// engine always understands. Remote-cursor rendering is not
    /// requested in any profile.
    pub fn wire_encodings(&self) -> Vec<EncodingType> {
        let mut list = self.encodings();
        list.push(EncodingType::CompressLevel(self.compression_level()));
        if self.jpeg_enabled() {
            list.push(EncodingType::QualityLevel(self.jpeg_quality()));
        }
        list.push(EncodingType::PointerPosPseudo);
        list.push(EncodingType::DesktopSizePseudo);
        list.push(EncodingType::LastRectPseudo);
        list
    }
}

impl Default for ConnectionQuality {
    fn default() -> Self {
        Self::Default
    }
}

// ── Veyon Authentication Types ──────────────────────────────────────────

/// Credential scheme selected inside the vendor security subtype.
/// Transmitted as an i32 over the variant-array channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VeyonAuthType {
    None,
    Token,
    Logon,
    KeyFile,
    HostAllowList,
}

impl Default for VeyonAuthType {
    fn default() -> Self {
        Self::Logon
    }
}

impl VeyonAuthType {
    pub fn to_i32(self) -> i32 {
        match self {
            Self::None => 0,
            Self::Token => 1,
            Self::Logon => 2,
            Self::KeyFile => 3,
            Self::HostAllowList => 4,
        }
    }

    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::Token),
            2 => Some(Self::Logon),
            3 => Some(Self::KeyFile),
            4 => Some(Self::HostAllowList),
            _ => None,
        }
    }
}

// ── Key Event Symbols (X11 keysym subset) ───────────────────────────────

/// Common X11 keysym values used in VNC key events.
pub mod keysym {
    pub const BACKSPACE: u32 = 0xFF08;
    pub const TAB: u32 = 0xFF09;
    pub const RETURN: u32 = 0xFF0D;
    pub const ESCAPE: u32 = 0xFF1B;
    pub const DELETE: u32 = 0xFFFF;
    pub const LEFT: u32 = 0xFF51;
    pub const UP: u32 = 0xFF52;
    pub const RIGHT: u32 = 0xFF53;
    pub const DOWN: u32 = 0xFF54;
    pub const SHIFT_L: u32 = 0xFFE1;
    pub const CONTROL_L: u32 = 0xFFE3;
    pub const ALT_L: u32 = 0xFFE9;
    pub const SUPER_L: u32 = 0xFFEB;
}

/// Mouse button mask bits for VNC pointer events.
pub mod mouse_button {
    pub const LEFT: u8 = 1;
    pub const MIDDLE: u8 = 2;
    pub const RIGHT: u8 = 4;
    pub const SCROLL_UP: u8 = 8;
    pub const SCROLL_DOWN: u8 = 16;
}

// ── Cursor image ────────────────────────────────────────────────────────

/// A remote cursor shape converted to RGBA with mask-derived alpha.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorImage {
    pub width: u16,
    pub height: u16,
    pub hot_x: u16,
    pub hot_y: u16,
    /// RGBA pixels, 4 bytes per pixel.
    pub rgba: Vec<u8>,
}

// ── Session metadata ────────────────────────────────────────────────────

/// Snapshot of a connection's identity and counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub host: String,
    /// Negative = use the configured default service port.
    pub port: i32,
    pub state: State,
    pub framebuffer_width: u16,
    pub framebuffer_height: u16,
    /// ISO-8601 timestamp of the last successful connect.
    pub connected_at: Option<String>,
    pub frame_count: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

// ── Error type ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VncErrorKind {
    ConnectionRefused,
    Timeout,
    Io,
    ProtocolViolation,
    UnsupportedVersion,
    AuthFailed,
    AuthUnsupported,
    NotConnected,
}

#[derive(Debug, Clone)]
pub struct VncError {
    pub kind: VncErrorKind,
    pub message: String,
}

impl fmt::Display for VncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for VncError {}

impl VncError {
    pub fn new(kind: VncErrorKind, msg: impl Into<String>) -> Self {
        Self { kind, message: msg.into() }
    }
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::new(VncErrorKind::ProtocolViolation, msg)
    }
    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::new(VncErrorKind::AuthFailed, msg)
    }
    pub fn io(msg: impl Into<String>) -> Self {
        Self::new(VncErrorKind::Io, msg)
    }
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(VncErrorKind::Timeout, msg)
    }
}

impl From<std::io::Error> for VncError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::ConnectionRefused => {
                Self::new(VncErrorKind::ConnectionRefused, e.to_string())
            }
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                Self::new(VncErrorKind::Timeout, e.to_string())
            }
            _ => Self::new(VncErrorKind::Io, e.to_string()),
        }
    }
}
