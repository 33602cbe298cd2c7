//! Close frame payloads (RFC 6455 Section 5.5.1, 7.4).
//!
//! - [`parse_close_payload`]: Extract status code + reason from a close frame payload
//! - [`validate_close_payload`]: Strict parse for received close frames
//! - [`build_close_payload`]: Build a close frame payload from code + reason

/// Well-known WebSocket close status codes per RFC 6455 Section 7.4.1.
pub struct WsCloseCode;

impl WsCloseCode {
    /// Normal closure (1000).
    pub const NORMAL: u16 = 1000;
    /// Going away (1001) -- server shutdown.
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error (1002) -- bad frames, ping timeout.
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// No status code present (1005). Never sent on the wire.
    pub const NO_STATUS: u16 = 1005;
    /// Abnormal closure (1006): transport closed without a close frame. Never sent.
    pub const ABNORMAL: u16 = 1006;
    /// Invalid frame payload data (1007) -- UTF-8 failure.
    pub const INVALID_DATA: u16 = 1007;
    /// Message too big (1009) -- reassembled message over the size limit.
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    /// Internal error (1011).
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// Status code and reason carried by a `close` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Close info for a transport that went away without a close frame.
    pub fn abnormal() -> Self {
        Self::new(WsCloseCode::ABNORMAL, "")
    }
}

/// Parse a close frame payload.
///
/// The first 2 bytes are the big-endian status code and the rest is the
/// UTF-8 reason (decoded lossily). An empty payload means no status was
/// given and maps to 1005. A 1-byte payload is malformed and also maps to
/// 1005.
pub fn parse_close_payload(payload: &[u8]) -> CloseInfo {
    if payload.len() >= 2 {
        let code = u16::from_be_bytes([payload[0], payload[1]]);
        let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
        CloseInfo { code, reason }
    } else {
        CloseInfo::new(WsCloseCode::NO_STATUS, "")
    }
}

/// Whether `code` may appear in a close frame on the wire.
///
/// 1005 and 1006 are local-only; 1004 and 1015 are reserved. 3000-4999 are
/// registered/private-use codes.
pub fn is_valid_wire_code(code: u16) -> bool {
    match code {
        WsCloseCode::NORMAL..=WsCloseCode::PROTOCOL_ERROR | 1003 => true,
        WsCloseCode::INVALID_DATA..=WsCloseCode::INTERNAL_ERROR => true,
        1012..=1014 => true,
        3000..=4999 => true,
        _ => false,
    }
}

/// Parse a received close frame payload, rejecting what RFC 6455 forbids: a
/// 1-byte payload, a status code that must not be sent, or a reason that is
/// not UTF-8. An empty payload is valid and maps to 1005.
pub fn validate_close_payload(payload: &[u8]) -> Result<CloseInfo, &'static str> {
    match payload.len() {
        0 => Ok(CloseInfo::new(WsCloseCode::NO_STATUS, "")),
        1 => Err("close payload too short"),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !is_valid_wire_code(code) {
                return Err("invalid close status code");
            }
            let reason =
                std::str::from_utf8(&payload[2..]).map_err(|_| "close reason is not UTF-8")?;
            Ok(CloseInfo::new(code, reason))
        }
    }
}

/// Build a close frame payload from a status code and reason string.
///
/// `None` yields an empty payload. The reason is truncated to 123 bytes (on a
/// char boundary) so the payload stays within the 125-byte control frame
/// limit.
pub fn build_close_payload(code: Option<u16>, reason: &str) -> Vec<u8> {
    let Some(code) = code else {
        return Vec::new();
    };
    let max_reason_len = 123; // 125 - 2 bytes for code
    let mut end = reason.len().min(max_reason_len);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }

    let mut payload = Vec::with_capacity(2 + end);
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(&reason.as_bytes()[..end]);
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_close_normal() {
        let info = parse_close_payload(&[0x03, 0xE8, b'o', b'k']);
        assert_eq!(info, CloseInfo::new(1000, "ok"));
    }

    #[test]
    fn test_parse_close_code_is_binary_not_ascii() {
        // 1002 big-endian followed by a reason that starts with digits
        let mut payload = 1002u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"4000 timeout");
        let info = parse_close_payload(&payload);
        assert_eq!(info.code, 1002);
        assert_eq!(info.reason, "4000 timeout");
    }

    #[test]
    fn test_parse_close_empty() {
        assert_eq!(parse_close_payload(&[]), CloseInfo::new(1005, ""));
    }

    #[test]
    fn test_parse_close_code_only() {
        assert_eq!(parse_close_payload(&[0x03, 0xE8]), CloseInfo::new(1000, ""));
    }

    #[test]
    fn test_validate_accepts_wire_codes() {
        for code in [1000, 1001, 1002, 1003, 1007, 1009, 1011, 1014, 3000, 4999] {
            let payload = build_close_payload(Some(code), "r");
            let expected = Ok(CloseInfo::new(code, "r"));
            assert_eq!(validate_close_payload(&payload), expected, "code {}", code);
        }
        assert_eq!(validate_close_payload(&[]), Ok(CloseInfo::new(1005, "")));
    }

    #[test]
    fn test_validate_rejects_local_and_reserved_codes() {
        for code in [0, 999, 1004, 1005, 1006, 1015, 2000, 5000] {
            let payload = build_close_payload(Some(code), "");
            assert!(validate_close_payload(&payload).is_err(), "code {} must be rejected", code);
        }
    }

    #[test]
    fn test_validate_rejects_one_byte_payload() {
        assert_eq!(validate_close_payload(&[0x03]), Err("close payload too short"));
    }

    #[test]
    fn test_validate_rejects_non_utf8_reason() {
        assert!(validate_close_payload(&[0x03, 0xE8, 0xFF]).is_err());
    }

    #[test]
    fn test_build_close_payload() {
        assert_eq!(build_close_payload(Some(1000), "bye"), vec![0x03, 0xE8, b'b', b'y', b'e']);
        assert!(build_close_payload(None, "ignored").is_empty());
    }

    #[test]
    fn test_build_close_truncates_reason() {
        let payload = build_close_payload(Some(1000), &"x".repeat(200));
        assert_eq!(payload.len(), 125, "payload should be capped at 125 bytes (2 + 123)");
        assert_eq!(&payload[..2], &[0x03, 0xE8]);
    }

    #[test]
    fn test_build_close_truncates_on_char_boundary() {
        // 62 two-byte chars = 124 bytes; byte 123 splits a char
        let reason = "é".repeat(62);
        let payload = build_close_payload(Some(1000), &reason);
        assert_eq!(payload.len(), 2 + 122);
        assert!(std::str::from_utf8(&payload[2..]).is_ok());
    }
}
