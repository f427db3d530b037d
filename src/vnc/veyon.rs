//! Vendor security subtype: credential sub-handshake over the RFB socket.
//!
//! When the server selects the Veyon security type the two ends exchange
//! length-prefixed typed-variant arrays on the live connection: the server
//! offers a list of credential schemes, the client picks one and proves
//! itself with a signed challenge, an RSA-encrypted password, an opaque
//! token, or nothing at all (host allow-listing).

use std::io::{Read, Write};

use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::{Pkcs1v15Encrypt, RsaPublicKey};
use sha2::Sha256;

use crate::vnc::interfaces::CredentialProvider;
use crate::vnc::types::{VeyonAuthType, VncError};

/// Fixed length of the KeyFile signature challenge.
pub const CHALLENGE_SIZE: usize = 64;

// ── Variant-array wire codec ────────────────────────────────────────────

const TAG_INT: u32 = 2;
const TAG_STRING: u32 = 10;
const TAG_BYTES: u32 = 12;

/// One typed value inside a variant-array message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Variant {
    Int(i32),
    Str(String),
    Bytes(Vec<u8>),
}

/// A self-describing message: `u32 count`, then per item a `u32` type tag
/// followed by the payload (i32 big-endian, or `u32` length + bytes for
/// strings and byte arrays). All integers are big-endian.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariantArrayMessage {
    items: Vec<Variant>,
}

impl VariantArrayMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_int(&mut self, v: i32) -> &mut Self {
        self.items.push(Variant::Int(v));
        self
    }

    pub fn write_str(&mut self, s: impl Into<String>) -> &mut Self {
        self.items.push(Variant::Str(s.into()));
        self
    }

    pub fn write_bytes(&mut self, b: impl Into<Vec<u8>>) -> &mut Self {
        self.items.push(Variant::Bytes(b.into()));
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn int_at(&self, index: usize) -> Option<i32> {
        match self.items.get(index) {
            Some(Variant::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn str_at(&self, index: usize) -> Option<&str> {
        match self.items.get(index) {
            Some(Variant::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn bytes_at(&self, index: usize) -> Option<&[u8]> {
        match self.items.get(index) {
            Some(Variant::Bytes(b)) => Some(b),
            // A string answers byte-array reads as its UTF-8 form.
            Some(Variant::Str(s)) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Serialize and write the whole message.
    pub fn send<W: Write>(&self, w: &mut W) -> Result<(), VncError> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.items.len() as u32).to_be_bytes());
        for item in &self.items {
            match item {
                Variant::Int(v) => {
                    buf.extend_from_slice(&TAG_INT.to_be_bytes());
                    buf.extend_from_slice(&v.to_be_bytes());
                }
                Variant::Str(s) => {
                    buf.extend_from_slice(&TAG_STRING.to_be_bytes());
                    buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
                    buf.extend_from_slice(s.as_bytes());
                }
                Variant::Bytes(b) => {
                    buf.extend_from_slice(&TAG_BYTES.to_be_bytes());
                    buf.extend_from_slice(&(b.len() as u32).to_be_bytes());
                    buf.extend_from_slice(b);
                }
            }
        }
        w.write_all(&buf)?;
        w.flush()?;
        Ok(())
    }

    /// Read one complete message from the stream.
    pub fn receive<R: Read>(r: &mut R) -> Result<Self, VncError> {
        let count = read_u32(r)?;
        if count > MAX_VARIANTS {
            return Err(VncError::protocol(format!("variant array too large: {count} items")));
        }
        let mut items = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let tag = read_u32(r)?;
            let item = match tag {
                TAG_INT => {
                    let mut buf = [0u8; 4];
                    r.read_exact(&mut buf)?;
                    Variant::Int(i32::from_be_bytes(buf))
                }
                TAG_STRING => {
                    let data = read_length_prefixed(r)?;
                    Variant::Str(String::from_utf8_lossy(&data).into_owned())
                }
                TAG_BYTES => Variant::Bytes(read_length_prefixed(r)?),
                other => {
                    return Err(VncError::protocol(format!("unknown variant tag: {other}")));
                }
            };
            items.push(item);
        }
        Ok(Self { items })
    }
}

const MAX_VARIANTS: u32 = 256;
const MAX_PAYLOAD: u32 = 16 * 1024 * 1024;

fn read_u32<R: Read>(r: &mut R) -> Result<u32, VncError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_length_prefixed<R: Read>(r: &mut R) -> Result<Vec<u8>, VncError> {
    let len = read_u32(r)?;
    if len > MAX_PAYLOAD {
        return Err(VncError::protocol(format!("variant payload too large: {len} bytes")));
    }
    let mut data = vec![0u8; len as usize];
    r.read_exact(&mut data)?;
    Ok(data)
}

// ── Credential sub-handshake ────────────────────────────────────────────

/// Pick the scheme to authenticate with from the server's offer.
///
/// The connection's preferred type wins when offered (a duplicated
/// preferred entry keeps the last match; callers must not depend on
/// which). Otherwise the first offered type is used; an empty offer
/// defaults to `Token`.
pub fn choose_auth_type(offered: &[VeyonAuthType], preferred: VeyonAuthType) -> VeyonAuthType {
    let mut chosen = VeyonAuthType::Token;
    if let Some(first) = offered.first() {
        chosen = *first;
        for auth_type in offered {
            if *auth_type == preferred {
                chosen = *auth_type;
            }
        }
    }
    chosen
}

/// Run the client side of the vendor security sub-handshake.
///
/// Failures are not retried here: an error aborts the sub-handshake and
/// the surrounding RFB negotiation observes the dropped connection.
pub fn negotiate<S: Read + Write>(
    stream: &mut S,
    credentials: &dyn CredentialProvider,
    preferred: VeyonAuthType,
) -> Result<(), VncError> {
    // 1. Server announces the credential schemes it accepts.
    let offer = VariantArrayMessage::receive(stream)?;
    let count = offer
        .int_at(0)
        .ok_or_else(|| VncError::protocol("auth offer missing count"))?;
    let mut offered = Vec::with_capacity(count.max(0) as usize);
    for i in 0..count.max(0) as usize {
        let tag = offer
            .int_at(1 + i)
            .ok_or_else(|| VncError::protocol("auth offer truncated"))?;
        if let Some(auth_type) = VeyonAuthType::from_i32(tag) {
            offered.push(auth_type);
        }
    }
    log::debug!("server offers auth types {offered:?}");

    let chosen = choose_auth_type(&offered, preferred);
    log::debug!("chose auth type {chosen:?}");

    // 2. Announce the choice together with the acting user's name; the
    //    server shows it in access-confirmation dialogs.
    let username = credentials
        .logon_username()
        .unwrap_or_else(current_user);
    let mut reply = VariantArrayMessage::new();
    reply.write_int(chosen.to_i32()).write_str(username);
    reply.send(stream)?;

    // 3. Server acknowledges the choice; the contents are irrelevant.
    let _ack = VariantArrayMessage::receive(stream)?;

    // 4. Per-scheme continuation.
    match chosen {
        VeyonAuthType::KeyFile => key_file_exchange(stream, credentials),
        VeyonAuthType::Logon => logon_exchange(stream, credentials),
        VeyonAuthType::Token => {
            let token = credentials.token().unwrap_or_default();
            let mut msg = VariantArrayMessage::new();
            msg.write_bytes(token);
            msg.send(stream)
        }
        // Accepted on the strength of the client's address alone.
        VeyonAuthType::HostAllowList | VeyonAuthType::None => Ok(()),
    }
}

/// KeyFile: sign the server's challenge with the configured private key.
fn key_file_exchange<S: Read + Write>(
    stream: &mut S,
    credentials: &dyn CredentialProvider,
) -> Result<(), VncError> {
    let challenge_msg = VariantArrayMessage::receive(stream)?;
    let challenge = challenge_msg
        .bytes_at(0)
        .ok_or_else(|| VncError::protocol("challenge message missing payload"))?;

    if challenge.len() != CHALLENGE_SIZE {
        log::error!(
            "challenge size mismatch: expected {CHALLENGE_SIZE}, got {}",
            challenge.len()
        );
        return Err(VncError::auth_failed("challenge size mismatch"));
    }

    let key = match credentials.private_key() {
        Some(key) => key,
        None => {
            log::error!("key file authentication selected but no usable private key");
            return Err(VncError::auth_failed("no usable private key"));
        }
    };

    let signing_key = SigningKey::<Sha256>::new(key);
    let signature = signing_key.sign(challenge).to_vec();

    let mut response = VariantArrayMessage::new();
    response
        .write_str(credentials.key_name().unwrap_or_default())
        .write_bytes(signature);
    response.send(stream)
}

/// Logon: encrypt the logon password with the server's public key.
fn logon_exchange<S: Read + Write>(
    stream: &mut S,
    credentials: &dyn CredentialProvider,
) -> Result<(), VncError> {
    let key_msg = VariantArrayMessage::receive(stream)?;
    let pem = key_msg
        .str_at(0)
        .ok_or_else(|| VncError::protocol("public key message missing payload"))?;

    let public_key = match RsaPublicKey::from_public_key_pem(pem) {
        Ok(key) => key,
        Err(e) => {
            log::error!("can't encrypt with the server's public key: {e}");
            return Err(VncError::auth_failed("unusable server public key"));
        }
    };

    let password = credentials.logon_password().unwrap_or_default();
    let ciphertext = public_key
        .encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, password.as_bytes())
        .map_err(|e| {
            log::error!("password encryption failed: {e}");
            VncError::auth_failed(format!("password encryption failed: {e}"))
        })?;
    if ciphertext.is_empty() {
        log::error!("password encryption produced no output");
        return Err(VncError::auth_failed("password encryption failed"));
    }

    let mut response = VariantArrayMessage::new();
    response.write_bytes(ciphertext);
    response.send(stream)
}

/// Name of the locally logged-on user, used when no logon credentials
/// carry one.
fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default()
}
