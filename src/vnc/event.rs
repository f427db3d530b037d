//! Outbound client events.
//!
//! User input is queued as plain data and turned into exactly one RFB
//! client message when fired on the worker thread.

use crate::vnc::client::RfbClient;
use crate::vnc::types::VncError;

/// One queued client event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageEvent {
    /// Pointer move/button state.
    Pointer { x: u16, y: u16, button_mask: u8 },
    /// Key press or release (X11 keysym).
    Key { key: u32, down: bool },
    /// Clipboard text for the server.
    CutText(String),
}

impl MessageEvent {
    /// Emit the corresponding RFB client message.
    pub(crate) fn fire(&self, client: &mut RfbClient) -> Result<(), VncError> {
        match self {
            Self::Pointer { x, y, button_mask } => client.send_pointer_event(*x, *y, *button_mask),
            Self::Key { key, down } => client.send_key_event(*key, *down),
            Self::CutText(text) => client.send_cut_text(text),
        }
    }
}
