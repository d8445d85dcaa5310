//! Handshake codec (§3, §6): the JSON "hello" envelope exchanged as the
//! first package of any conduit, and the `packageId || payload` framing used
//! by every package after it.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub const PACKAGE_ID_LEN: usize = 16;

/// 16-byte tag prefixed to every package on a conduit so a shared
/// connection can demultiplex among several conduits (§3).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PackageId([u8; PACKAGE_ID_LEN]);

/// All-zero package id reserved for hello envelopes on a listener's recv
/// connection (§4.6): no dial ever mints this value.
pub const ZERO_PACKAGE_ID: PackageId = PackageId([0u8; PACKAGE_ID_LEN]);

impl PackageId {
    pub const fn from_bytes(bytes: [u8; PACKAGE_ID_LEN]) -> Self {
        PackageId(bytes)
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; PACKAGE_ID_LEN];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
        PackageId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PACKAGE_ID_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        *self == ZERO_PACKAGE_ID
    }

    pub fn to_base64(self) -> String {
        BASE64.encode(self.0)
    }

    pub fn from_base64(s: &str) -> Result<Self, EnvelopeError> {
        let decoded = BASE64.decode(s.trim()).map_err(|_| EnvelopeError::BadPackageId)?;
        Self::from_slice(&decoded)
    }

    fn from_slice(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if bytes.len() != PACKAGE_ID_LEN {
            return Err(EnvelopeError::BadPackageId);
        }
        let mut arr = [0u8; PACKAGE_ID_LEN];
        arr.copy_from_slice(bytes);
        Ok(PackageId(arr))
    }

    /// Accepts either raw 16 bytes or standard base64 of 16 bytes, trying
    /// base64 first (§8, Resume semantics): a caller may pass either form
    /// and get the same `PackageId` back.
    pub fn parse_flexible(input: &[u8]) -> Result<Self, EnvelopeError> {
        if let Ok(text) = std::str::from_utf8(input) {
            if let Ok(decoded) = BASE64.decode(text.trim()) {
                if let Ok(id) = Self::from_slice(&decoded) {
                    return Ok(id);
                }
            }
        }
        Self::from_slice(input)
    }
}

impl std::fmt::Debug for PackageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PackageId({})", self.to_base64())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope was not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("packageId was not valid base64 or not 16 bytes")]
    BadPackageId,
    #[error("message field was not valid base64")]
    BadMessage,
    #[error("conduit package shorter than the {PACKAGE_ID_LEN}-byte packageId prefix")]
    TruncatedPackage,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WireHello {
    #[serde(rename = "linkAddress")]
    link_address: String,
    #[serde(rename = "replyChannel")]
    reply_channel: String,
    #[serde(rename = "packageId")]
    package_id: String,
    message: String,

    #[serde(rename = "initSendLinkAddress", skip_serializing_if = "Option::is_none", default)]
    init_send_link_address: Option<String>,
    #[serde(rename = "initSendChannel", skip_serializing_if = "Option::is_none", default)]
    init_send_channel: Option<String>,
    #[serde(rename = "initRecvLinkAddress", skip_serializing_if = "Option::is_none", default)]
    init_recv_link_address: Option<String>,
    #[serde(rename = "initRecvChannel", skip_serializing_if = "Option::is_none", default)]
    init_recv_channel: Option<String>,
    #[serde(rename = "finalSendLinkAddress", skip_serializing_if = "Option::is_none", default)]
    final_send_link_address: Option<String>,
    #[serde(rename = "finalSendChannel", skip_serializing_if = "Option::is_none", default)]
    final_send_channel: Option<String>,
    #[serde(rename = "finalRecvLinkAddress", skip_serializing_if = "Option::is_none", default)]
    final_recv_link_address: Option<String>,
    #[serde(rename = "finalRecvChannel", skip_serializing_if = "Option::is_none", default)]
    final_recv_channel: Option<String>,
}

/// Extra address pairs carried only by bootstrap hellos (§7): the initial
/// channel is used just to exchange these, then both sides switch to the
/// final channel for the long-lived conduit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapAddresses {
    pub init_send_link_address: String,
    pub init_send_channel: String,
    pub init_recv_link_address: String,
    pub init_recv_channel: String,
    pub final_send_link_address: String,
    pub final_send_channel: String,
    pub final_recv_link_address: String,
    pub final_recv_channel: String,
}

#[derive(Debug, Clone)]
pub struct Hello {
    pub link_address: String,
    pub reply_channel: String,
    pub package_id: PackageId,
    pub message: Bytes,
    pub bootstrap: Option<BootstrapAddresses>,
}

#[allow(clippy::too_many_arguments)]
pub fn encode_hello(
    link_address: &str,
    reply_channel: &str,
    package_id: PackageId,
    message: &[u8],
    bootstrap: Option<&BootstrapAddresses>,
) -> Vec<u8> {
    let wire = WireHello {
        link_address: link_address.to_string(),
        reply_channel: reply_channel.to_string(),
        package_id: package_id.to_base64(),
        message: BASE64.encode(message),
        init_send_link_address: bootstrap.map(|b| b.init_send_link_address.clone()),
        init_send_channel: bootstrap.map(|b| b.init_send_channel.clone()),
        init_recv_link_address: bootstrap.map(|b| b.init_recv_link_address.clone()),
        init_recv_channel: bootstrap.map(|b| b.init_recv_channel.clone()),
        final_send_link_address: bootstrap.map(|b| b.final_send_link_address.clone()),
        final_send_channel: bootstrap.map(|b| b.final_send_channel.clone()),
        final_recv_link_address: bootstrap.map(|b| b.final_recv_link_address.clone()),
        final_recv_channel: bootstrap.map(|b| b.final_recv_channel.clone()),
    };
    // A JSON encode of a well-formed struct never fails.
    serde_json::to_vec(&wire).expect("WireHello always serializes")
}

/// Parsing a hello is total (§8, invariant 7): malformed input returns an
/// error and must never panic. Callers log and drop on `Err`.
pub fn decode_hello(bytes: &[u8]) -> Result<Hello, EnvelopeError> {
    let wire: WireHello = serde_json::from_slice(bytes)?;
    let package_id = PackageId::from_base64(&wire.package_id)?;
    let message = BASE64
        .decode(&wire.message)
        .map_err(|_| EnvelopeError::BadMessage)?;

    let bootstrap = match (
        &wire.init_send_link_address,
        &wire.init_send_channel,
        &wire.init_recv_link_address,
        &wire.init_recv_channel,
        &wire.final_send_link_address,
        &wire.final_send_channel,
        &wire.final_recv_link_address,
        &wire.final_recv_channel,
    ) {
        (
            Some(isla),
            Some(isc),
            Some(irla),
            Some(irc),
            Some(fsla),
            Some(fsc),
            Some(frla),
            Some(frc),
        ) => Some(BootstrapAddresses {
            init_send_link_address: isla.clone(),
            init_send_channel: isc.clone(),
            init_recv_link_address: irla.clone(),
            init_recv_channel: irc.clone(),
            final_send_link_address: fsla.clone(),
            final_send_channel: fsc.clone(),
            final_recv_link_address: frla.clone(),
            final_recv_channel: frc.clone(),
        }),
        _ => None,
    };

    Ok(Hello {
        link_address: wire.link_address,
        reply_channel: wire.reply_channel,
        package_id,
        message: Bytes::from(message),
        bootstrap,
    })
}

/// Frames a conduit payload as `packageId || payload` (§3).
pub fn encode_conduit_package(package_id: PackageId, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(PACKAGE_ID_LEN + payload.len());
    out.extend_from_slice(package_id.as_bytes());
    out.extend_from_slice(payload);
    out
}

/// Splits a raw conduit package into its packageId prefix and payload.
pub fn decode_conduit_package(bytes: &[u8]) -> Result<(PackageId, Bytes), EnvelopeError> {
    if bytes.len() < PACKAGE_ID_LEN {
        return Err(EnvelopeError::TruncatedPackage);
    }
    let package_id = PackageId::from_slice(&bytes[..PACKAGE_ID_LEN])?;
    let payload = Bytes::copy_from_slice(&bytes[PACKAGE_ID_LEN..]);
    Ok((package_id, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_round_trips() {
        let id = PackageId::random();
        let bytes = encode_hello("addr-a", "chanT", id, b"hello", None);
        let decoded = decode_hello(&bytes).unwrap();
        assert_eq!(decoded.link_address, "addr-a");
        assert_eq!(decoded.reply_channel, "chanT");
        assert_eq!(decoded.package_id, id);
        assert_eq!(decoded.message, Bytes::from_static(b"hello"));
        assert!(decoded.bootstrap.is_none());
    }

    #[test]
    fn bootstrap_hello_round_trips() {
        let id = PackageId::random();
        let boot = BootstrapAddresses {
            init_send_link_address: "isla".into(),
            init_send_channel: "isc".into(),
            init_recv_link_address: "irla".into(),
            init_recv_channel: "irc".into(),
            final_send_link_address: "fsla".into(),
            final_send_channel: "fsc".into(),
            final_recv_link_address: "frla".into(),
            final_recv_channel: "frc".into(),
        };
        let bytes = encode_hello("addr-a", "chanT", id, b"hi", Some(&boot));
        let decoded = decode_hello(&bytes).unwrap();
        assert_eq!(decoded.bootstrap.unwrap(), boot);
    }

    #[test]
    fn malformed_json_is_rejected_without_panicking() {
        let result = decode_hello(b"srctybu");
        assert!(result.is_err());
    }

    #[test]
    fn package_id_too_short_is_rejected() {
        let bad = serde_json::json!({
            "linkAddress": "a",
            "replyChannel": "b",
            "packageId": BASE64.encode([1, 2, 3]),
            "message": BASE64.encode(b"x"),
        });
        let bytes = serde_json::to_vec(&bad).unwrap();
        assert!(matches!(decode_hello(&bytes), Err(EnvelopeError::BadPackageId)));
    }

    #[test]
    fn conduit_package_round_trips() {
        let id = PackageId::random();
        let framed = encode_conduit_package(id, b"payload");
        let (parsed_id, payload) = decode_conduit_package(&framed).unwrap();
        assert_eq!(parsed_id, id);
        assert_eq!(payload, Bytes::from_static(b"payload"));
    }

    #[test]
    fn package_id_parse_flexible_accepts_raw_and_base64() {
        let id = PackageId::from_bytes([7u8; PACKAGE_ID_LEN]);
        let raw = PackageId::parse_flexible(id.as_bytes()).unwrap();
        assert_eq!(raw, id);
        let b64 = PackageId::parse_flexible(id.to_base64().as_bytes()).unwrap();
        assert_eq!(b64, id);
    }
}
