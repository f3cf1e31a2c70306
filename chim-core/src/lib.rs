use std::{
    net::{IpAddr, Ipv4Addr, UdpSocket},
    time::Duration,
};

use bytes::{BufMut, BytesMut};
use thiserror::Error;

pub const DEFAULT_GROUP: Ipv4Addr = Ipv4Addr::new(224, 1, 1, 1);
pub const DEFAULT_PORT: u16 = 5007;
/// Keeps datagrams on the local subnet.
pub const MULTICAST_TTL: u32 = 1;
pub const RECV_TIMEOUT: Duration = Duration::from_secs(1);
/// Receive buffer size used by every participant; anything longer is truncated on arrival.
pub const MAX_DATAGRAM_BYTES: usize = 4096;
pub const MAX_IDENTITY_LEN: usize = 64;
pub const SEPARATOR: char = ':';
const IDENTITY_PROBE_ADDR: (Ipv4Addr, u16) = (Ipv4Addr::new(8, 8, 8, 8), 80);
const UNKNOWN_IDENTITY: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub sender: String,
    pub text: String,
}

impl ChatMessage {
    pub fn new(sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("identity must not be empty")]
    EmptyIdentity,
    #[error("identity is too long ({len} > {max} bytes)")]
    IdentityTooLong { len: usize, max: usize },
    #[error("identity must not contain ':'")]
    IdentityContainsSeparator,
    #[error("datagram is too large ({len} > {max} bytes)")]
    MessageTooLarge { len: usize, max: usize },
    #[error("datagram has no ':' separator")]
    MissingSeparator,
}

/// Checks that `identity` can be used as the sender field of a datagram.
pub fn validate_identity(identity: &str) -> Result<(), CoreError> {
    let trimmed = identity.trim();
    if trimmed.is_empty() {
        return Err(CoreError::EmptyIdentity);
    }
    if trimmed.len() > MAX_IDENTITY_LEN {
        return Err(CoreError::IdentityTooLong {
            len: trimmed.len(),
            max: MAX_IDENTITY_LEN,
        });
    }
    if trimmed.contains(SEPARATOR) {
        return Err(CoreError::IdentityContainsSeparator);
    }
    Ok(())
}

/// Encodes one chat message as `sender:text`.
pub fn encode_datagram(sender: &str, text: &str) -> Result<Vec<u8>, CoreError> {
    validate_identity(sender)?;

    let len = sender.len() + SEPARATOR.len_utf8() + text.len();
    if len > MAX_DATAGRAM_BYTES {
        return Err(CoreError::MessageTooLarge {
            len,
            max: MAX_DATAGRAM_BYTES,
        });
    }

    let mut out = BytesMut::with_capacity(len);
    out.put_slice(sender.as_bytes());
    out.put_u8(SEPARATOR as u8);
    out.put_slice(text.as_bytes());
    Ok(out.to_vec())
}

/// Decodes a received datagram. Invalid UTF-8 is replaced rather than rejected;
/// only the first separator splits sender from text.
pub fn decode_datagram(datagram: &[u8]) -> Result<ChatMessage, CoreError> {
    let decoded = String::from_utf8_lossy(datagram);
    let (sender, text) = decoded
        .split_once(SEPARATOR)
        .ok_or(CoreError::MissingSeparator)?;
    Ok(ChatMessage::new(sender, text))
}

/// Local address of the interface that would route to the public internet.
///
/// No packet is sent: connecting a UDP socket only selects a route.
pub fn detect_local_ip() -> Option<IpAddr> {
    let probe = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    probe.connect(IDENTITY_PROBE_ADDR).ok()?;
    let ip = probe.local_addr().ok()?.ip();
    if ip.is_unspecified() { None } else { Some(ip) }
}

/// Host name as the OS reports it.
pub fn host_name() -> Option<String> {
    let name = gethostname::gethostname();
    let name = name.to_string_lossy().trim().to_owned();
    (!name.is_empty()).then_some(name)
}

/// Identity offered to the user before they pick one: local IP, then host name.
pub fn default_identity() -> String {
    detect_local_ip()
        .map(|ip| ip.to_string())
        .or_else(|| host_name().filter(|name| validate_identity(name).is_ok()))
        .unwrap_or_else(|| UNKNOWN_IDENTITY.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datagram_roundtrip() {
        let encoded = encode_datagram("alice", "hello there").unwrap();
        assert_eq!(encoded, b"alice:hello there");
        let decoded = decode_datagram(&encoded).unwrap();
        assert_eq!(decoded, ChatMessage::new("alice", "hello there"));
    }

    #[test]
    fn only_first_colon_splits() {
        let encoded = encode_datagram("10.0.0.7", "time is 12:30: late").unwrap();
        let decoded = decode_datagram(&encoded).unwrap();
        assert_eq!(decoded.sender, "10.0.0.7");
        assert_eq!(decoded.text, "time is 12:30: late");
    }

    #[test]
    fn empty_text_is_a_valid_message() {
        let decoded = decode_datagram(b"bob:").unwrap();
        assert_eq!(decoded, ChatMessage::new("bob", ""));
    }

    #[test]
    fn datagram_without_separator_is_rejected() {
        assert_eq!(
            decode_datagram(b"malformed").unwrap_err(),
            CoreError::MissingSeparator
        );
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let decoded = decode_datagram(b"carol:caf\xff!").unwrap();
        assert_eq!(decoded.sender, "carol");
        assert_eq!(decoded.text, "caf\u{fffd}!");
    }

    #[test]
    fn identity_rules() {
        assert_eq!(validate_identity("  "), Err(CoreError::EmptyIdentity));
        assert_eq!(
            validate_identity("fe80::1"),
            Err(CoreError::IdentityContainsSeparator)
        );
        let long = "x".repeat(MAX_IDENTITY_LEN + 1);
        assert!(matches!(
            validate_identity(&long),
            Err(CoreError::IdentityTooLong { .. })
        ));
        assert!(validate_identity("192.168.1.20").is_ok());
    }

    #[test]
    fn encode_rejects_bad_sender() {
        assert_eq!(
            encode_datagram("a:b", "hi").unwrap_err(),
            CoreError::IdentityContainsSeparator
        );
    }

    #[test]
    fn encode_rejects_oversized_message() {
        let text = "y".repeat(MAX_DATAGRAM_BYTES);
        let err = encode_datagram("alice", &text).unwrap_err();
        assert!(matches!(err, CoreError::MessageTooLarge { max, .. } if max == MAX_DATAGRAM_BYTES));

        let fits = "y".repeat(MAX_DATAGRAM_BYTES - "alice:".len());
        assert_eq!(
            encode_datagram("alice", &fits).unwrap().len(),
            MAX_DATAGRAM_BYTES
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn host_name_matches_kernel_host_name() {
        let kernel = std::fs::read_to_string("/proc/sys/kernel/hostname").unwrap();
        let kernel = kernel.trim();
        if kernel.is_empty() {
            assert_eq!(host_name(), None);
        } else {
            assert_eq!(host_name().as_deref(), Some(kernel));
        }
    }

    #[test]
    fn default_identity_is_usable() {
        let identity = default_identity();
        assert!(validate_identity(&identity).is_ok(), "{identity}");
    }
}
