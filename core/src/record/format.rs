//! Message payload renderings.

use super::MessageRecord;

use serde::{Deserialize, Serialize};

/// Rendering applied to message payloads on query and download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageFormat {
    /// Raw payload bytes.
    Raw,
    /// Lowercase hex.
    Hex,
    /// Base64.
    Base64,
    /// One JSON document per message.
    Json,
    /// Printable characters kept, everything else escaped as `\xNN`.
    #[default]
    Printable,
}

/// Renders one payload under `format`. `Json` callers should use
/// [render_messages]; here it falls back to base64.
pub fn render_payload(data: &[u8], format: MessageFormat) -> Vec<u8> {
    match format {
        MessageFormat::Raw => data.to_vec(),
        MessageFormat::Hex => hex::encode(data).into_bytes(),
        MessageFormat::Base64 | MessageFormat::Json => base64::encode(data).into_bytes(),
        MessageFormat::Printable => escape_printable(data).into_bytes(),
    }
}

/// Renders a full message list into one downloadable byte stream.
///
/// `Json` produces a JSON array of message documents; every other format
/// concatenates the per-message renderings in message order.
pub fn render_messages(messages: &[MessageRecord], format: MessageFormat) -> Vec<u8> {
    if format == MessageFormat::Json {
        return serde_json::to_vec(messages).unwrap_or_default();
    }
    let mut out = Vec::new();
    for message in messages {
        out.extend_from_slice(&render_payload(&message.data, format));
    }
    out
}

/// Keeps printable ASCII plus `\n`, `\r`, `\t`; escapes everything else as
/// `\xNN`.
pub fn escape_printable(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len());
    for &byte in data {
        match byte {
            b'\n' | b'\r' | b'\t' | 0x20..=0x7e => out.push(byte as char),
            _ => out.push_str(&format!("\\x{:02x}", byte)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conntrack::conn_id::ConnectionId;
    use crate::record::Direction;
    use chrono::Utc;

    fn msg(data: &[u8]) -> MessageRecord {
        MessageRecord {
            connection_id: ConnectionId::new(Utc::now(), 0),
            index: 0,
            direction: Direction::ClientToServer,
            ts: Utc::now(),
            data: data.to_vec(),
        }
    }

    #[test]
    fn core_escape_printable_mixes_text_and_bytes() {
        assert_eq!(escape_printable(b"ok\x00\xff\n"), "ok\\x00\\xff\n");
    }

    #[test]
    fn core_render_hex_and_base64() {
        assert_eq!(render_payload(b"\x01\x02", MessageFormat::Hex), b"0102");
        assert_eq!(render_payload(b"hi", MessageFormat::Base64), b"aGk=");
    }

    #[test]
    fn core_render_messages_concatenates_raw() {
        let rendered = render_messages(&[msg(b"ab"), msg(b"cd")], MessageFormat::Raw);
        assert_eq!(rendered, b"abcd");
    }

    #[test]
    fn core_render_messages_json_is_array() {
        let rendered = render_messages(&[msg(b"ab")], MessageFormat::Json);
        let parsed: serde_json::Value = serde_json::from_slice(&rendered).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 1);
    }
}
