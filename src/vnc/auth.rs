//! Standard RFB security handling.
//!
//! Security type selection, VNC DES challenge-response authentication and
//! SecurityResult parsing. The vendor security subtype lives in
//! [`crate::vnc::veyon`].

use crate::vnc::types::{SecurityType, VncError, VncErrorKind};
use cipher::{BlockEncrypt, KeyInit};
use des::Des;

/// Select the security type to answer with from the server's offer.
///
/// The vendor subtype is always preferred when offered, since it is the
/// only scheme that carries the platform's credential flows; classic VNC
/// authentication and None are the fallbacks.
pub fn select_security_type(types: &[SecurityType]) -> Option<SecurityType> {
    let preference = [
        SecurityType::Veyon,
        SecurityType::VncAuthentication,
        SecurityType::None,
    ];
    preference.into_iter().find(|candidate| types.contains(candidate))
}

/// Answer a VNC (DES) authentication challenge (security type 2).
///
/// The server sends a 16-byte challenge; the client encrypts it with DES
/// keyed by the password (truncated/padded to 8 bytes, each key byte
/// bit-reversed) and returns the 16-byte response.
pub fn handle_vnc_auth(challenge: &[u8; 16], password: &str) -> [u8; 16] {
    let key = make_des_key(password);
    let mut response = [0u8; 16];
    response[0..8].copy_from_slice(&des_encrypt_block(&key, &challenge[0..8]));
    response[8..16].copy_from_slice(&des_encrypt_block(&key, &challenge[8..16]));
    response
}

/// Parse a SecurityResult status word, with the optional reason string
/// RFB 3.8 appends on failure.
pub fn security_result(status: u32, reason: Option<&[u8]>) -> Result<(), VncError> {
    match status {
        0 => Ok(()),
        1 => {
            let message = reason
                .map(|r| String::from_utf8_lossy(r).into_owned())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "Authentication failed".into());
            Err(VncError::auth_failed(message))
        }
        2 => Err(VncError::auth_failed("Too many authentication attempts")),
        other => Err(VncError::new(
            VncErrorKind::AuthFailed,
            format!("Unknown security result: {other}"),
        )),
    }
}

// ── DES implementation ──────────────────────────────────────────────────

/// Build the DES key from a VNC password: 8 bytes, bit-reversed.
fn make_des_key(password: &str) -> [u8; 8] {
    let mut key = [0u8; 8];
    for (slot, b) in key.iter_mut().zip(password.bytes()) {
        *slot = b.reverse_bits();
    }
    key
}

/// DES ECB encryption of a single 8-byte block.
fn des_encrypt_block(key: &[u8; 8], block: &[u8]) -> [u8; 8] {
    let cipher = Des::new_from_slice(key).expect("DES key must be 8 bytes");
    let mut output = cipher::generic_array::GenericArray::clone_from_slice(&block[..8]);
    cipher.encrypt_block(&mut output);
    let mut result = [0u8; 8];
    result.copy_from_slice(&output);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── make_des_key ────────────────────────────────────────────────

    #[test]
    fn make_des_key_empty() {
        assert_eq!(make_des_key(""), [0; 8]);
    }

    #[test]
    fn make_des_key_short_is_padded() {
        let key = make_des_key("abc");
        assert_eq!(key[0], b'a'.reverse_bits());
        assert_eq!(key[1], b'b'.reverse_bits());
        assert_eq!(key[2], b'c'.reverse_bits());
        assert_eq!(&key[3..], &[0; 5]);
    }

    #[test]
    fn make_des_key_truncates_long_password() {
        let key = make_des_key("longpassword123");
        assert_eq!(key[7], b's'.reverse_bits());
    }

    // ── des_encrypt_block ───────────────────────────────────────────

    #[test]
    fn des_encrypt_block_known_vector() {
        // NIST test vector:
        // Key 0x0123456789ABCDEF, plaintext "Now is t",
        // ciphertext 0x3FA40E8A984D4815.
        let key = [0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF];
        let plaintext = [0x4E, 0x6F, 0x77, 0x20, 0x69, 0x73, 0x20, 0x74];
        let expected = [0x3F, 0xA4, 0x0E, 0x8A, 0x98, 0x4D, 0x48, 0x15];
        assert_eq!(des_encrypt_block(&key, &plaintext), expected);
    }

    #[test]
    fn des_encrypt_block_zeros() {
        // DES(0,0) = 0x8CA64DE9C1B123A7
        assert_eq!(
            des_encrypt_block(&[0u8; 8], &[0u8; 8]),
            [0x8C, 0xA6, 0x4D, 0xE9, 0xC1, 0xB1, 0x23, 0xA7]
        );
    }

    // ── handle_vnc_auth ─────────────────────────────────────────────

    #[test]
    fn vnc_auth_is_deterministic() {
        let challenge = [42u8; 16];
        assert_eq!(handle_vnc_auth(&challenge, "test"), handle_vnc_auth(&challenge, "test"));
    }

    #[test]
    fn vnc_auth_differs_per_password() {
        let challenge = [42u8; 16];
        assert_ne!(handle_vnc_auth(&challenge, "pass1"), handle_vnc_auth(&challenge, "pass2"));
    }

    #[test]
    fn vnc_auth_empty_password() {
        let response = handle_vnc_auth(&[0u8; 16], "");
        assert_eq!(response.len(), 16);
    }

    // ── select_security_type ────────────────────────────────────────

    #[test]
    fn select_prefers_veyon() {
        let types = vec![
            SecurityType::None,
            SecurityType::VncAuthentication,
            SecurityType::Veyon,
        ];
        assert_eq!(select_security_type(&types), Some(SecurityType::Veyon));
    }

    #[test]
    fn select_falls_back_to_vnc_auth() {
        let types = vec![SecurityType::None, SecurityType::VncAuthentication];
        assert_eq!(select_security_type(&types), Some(SecurityType::VncAuthentication));
    }

    #[test]
    fn select_none_only() {
        assert_eq!(select_security_type(&[SecurityType::None]), Some(SecurityType::None));
    }

    #[test]
    fn select_empty_offer() {
        assert_eq!(select_security_type(&[]), None);
    }

    // ── security_result ─────────────────────────────────────────────

    #[test]
    fn security_result_ok() {
        assert!(security_result(0, None).is_ok());
    }

    #[test]
    fn security_result_failed_with_reason() {
        let err = security_result(1, Some(b"Bad password")).unwrap_err();
        assert_eq!(err.kind, VncErrorKind::AuthFailed);
        assert!(err.message.contains("Bad password"));
    }

    #[test]
    fn security_result_failed_without_reason() {
        let err = security_result(1, None).unwrap_err();
        assert!(err.message.contains("Authentication failed"));
    }

    #[test]
    fn security_result_too_many_attempts() {
        let err = security_result(2, None).unwrap_err();
        assert!(err.message.contains("Too many"));
    }

    #[test]
    fn security_result_unknown_status() {
        assert!(security_result(7, None).is_err());
    }
}
