//! RFB/VNC client engine for the ClassDeck classroom management
//! platform.
//!
//! The entry point is [`VncConnection`]: point it at a host, start it,
//! and it keeps a live pixel mirror of the remote display on a dedicated
//! worker thread, negotiating the vendor security subtype, reconnecting
//! with a backoff after failures, forwarding queued input events, and
//! notifying observers about frames, cursor movement, clipboard contents
//! and state changes.
//!
//! ```no_run
//! use std::sync::Arc;
//! use classdeck_vnc::{
//!     ConnectionEvent, ServiceDefaults, StaticCredentials, SystemPingProbe, VncConnection,
//! };
//!
//! let connection = VncConnection::new(
//!     Arc::new(StaticCredentials::default()),
//!     Arc::new(SystemPingProbe),
//!     ServiceDefaults::default(),
//! );
//! let events = connection.subscribe();
//! connection.set_host("203.0.113.40");
//! connection.set_framebuffer_update_interval(50);
//! connection.start();
//!
//! for event in events {
//!     if let ConnectionEvent::FramebufferUpdateComplete = event {
//!         let frame = connection.image();
//!         println!("{}x{}", frame.width(), frame.height());
//!     }
//! }
//! ```

pub mod vnc;

pub use vnc::*;
