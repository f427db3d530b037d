//! VNC/RFB client engine: sub-modules.

pub mod auth;
pub mod client;
pub mod connection;
pub mod encoding;
pub mod event;
pub mod framebuffer;
pub mod interfaces;
pub mod protocol;
pub mod types;
pub mod veyon;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export the surface most embedders need.
pub use connection::VncConnection;
pub use event::MessageEvent;
pub use framebuffer::{FramebufferImage, FramebufferStore};
pub use interfaces::{
    ConnectionEvent, CredentialProvider, ReachabilityProbe, ServiceDefaults, StaticCredentials,
    SystemPingProbe,
};
pub use types::*;
