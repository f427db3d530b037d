//! External collaborators of the connection engine: credentials,
//! reachability probing, service defaults, and the observer channel.

use std::process::{Command, Stdio};

use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};

use crate::vnc::types::{CursorImage, State, VeyonAuthType};

// ── Credentials ─────────────────────────────────────────────────────────

/// Source of the credentials the security sub-handshake may need.
///
/// Implemented by the embedding application; [`StaticCredentials`] covers
/// the common case of a fixed credential set.
pub trait CredentialProvider: Send + Sync {
    /// Username of the logged-on credentials, if any.
    fn logon_username(&self) -> Option<String>;
    /// Password of the logged-on credentials, if any.
    fn logon_password(&self) -> Option<String>;
    /// Private key for challenge signing, if any.
    fn private_key(&self) -> Option<RsaPrivateKey>;
    /// Name under which the server knows the public half of the key.
    fn key_name(&self) -> Option<String>;
    /// Opaque shared secret for token authentication.
    fn token(&self) -> Option<Vec<u8>>;
    /// The credential scheme this provider is configured for.
    fn authentication_method(&self) -> VeyonAuthType;

    fn has_logon_credentials(&self) -> bool {
        self.logon_username().is_some() && self.logon_password().is_some()
    }
    fn has_private_key(&self) -> bool {
        self.private_key().is_some()
    }
    fn has_token(&self) -> bool {
        self.token().is_some()
    }
}

/// A fixed set of credentials.
#[derive(Clone, Default)]
pub struct StaticCredentials {
    pub username: Option<String>,
    pub password: Option<String>,
    pub private_key: Option<RsaPrivateKey>,
    pub key_name: Option<String>,
    pub token: Option<Vec<u8>>,
    pub authentication_method: VeyonAuthType,
}

impl CredentialProvider for StaticCredentials {
    fn logon_username(&self) -> Option<String> {
        self.username.clone()
    }
    fn logon_password(&self) -> Option<String> {
        self.password.clone()
    }
    fn private_key(&self) -> Option<RsaPrivateKey> {
        self.private_key.clone()
    }
    fn key_name(&self) -> Option<String> {
        self.key_name.clone()
    }
    fn token(&self) -> Option<Vec<u8>> {
        self.token.clone()
    }
    fn authentication_method(&self) -> VeyonAuthType {
        self.authentication_method
    }
}

// ── Reachability ────────────────────────────────────────────────────────

/// Synchronous host reachability check, used to tell an offline host from
/// a host whose screen service is down.
pub trait ReachabilityProbe: Send + Sync {
    fn ping(&self, host: &str) -> bool;
}

/// Probe backed by the system `ping` binary (one packet, ~1 s budget).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPingProbe;

impl ReachabilityProbe for SystemPingProbe {
    fn ping(&self, host: &str) -> bool {
        let mut cmd = Command::new("ping");
        #[cfg(target_os = "windows")]
        cmd.arg("-n").arg("1").arg("-w").arg("1000");
        #[cfg(not(target_os = "windows"))]
        cmd.arg("-c").arg("1").arg("-W").arg("1");
        cmd.arg(host).stdout(Stdio::null()).stderr(Stdio::null());

        match cmd.status() {
            Ok(status) => status.success(),
            Err(e) => {
                log::debug!("ping {host} failed to execute: {e}");
                false
            }
        }
    }
}

// ── Service defaults ────────────────────────────────────────────────────

/// Platform-level defaults the engine falls back to when a connection
/// leaves host-specific values unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDefaults {
    /// Service port used when a connection's port is the `-1` sentinel.
    #[serde(default = "default_service_port")]
    pub service_port: u16,
    /// Credential scheme preferred during the security sub-handshake.
    #[serde(default)]
    pub authentication_method: VeyonAuthType,
}

fn default_service_port() -> u16 {
    11100
}

impl Default for ServiceDefaults {
    fn default() -> Self {
        Self {
            service_port: default_service_port(),
            authentication_method: VeyonAuthType::default(),
        }
    }
}

// ── Observer channel ────────────────────────────────────────────────────

/// Notifications delivered to connection observers.
///
/// Emitted from the worker thread; state changes are emitted only when
/// the state actually changed.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StateChanged(State),
    /// A fresh protocol client is about to connect to `host:port`.
    NewClient { host: String, port: u16 },
    /// A framebuffer region was updated.
    ImageUpdated { x: u16, y: u16, width: u16, height: u16 },
    /// The framebuffer dimensions are known (first complete update) or
    /// changed (server-side resize).
    FramebufferSizeChanged { width: u16, height: u16 },
    /// One complete framebuffer update was processed.
    FramebufferUpdateComplete,
    CursorPosChanged { x: u16, y: u16 },
    CursorShapeUpdated { cursor: CursorImage },
    /// Server-side clipboard contents.
    GotCut(String),
    Bell,
}
