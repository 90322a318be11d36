//! Newline-delimited JSON framing.
//!
//! One [`Message`] per line. The reader side is driven by the per-connection
//! actor in [`crate::net`]; these helpers only turn lines into messages and
//! back.

use crate::error::HubError;

use super::message::Message;

/// Upper bound for a single encoded message.
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Encode `msg` as one JSON line, trailing newline included.
pub fn encode(msg: &Message) -> Result<String, HubError> {
    let mut line =
        serde_json::to_string(msg).map_err(|e| HubError::Codec(format!("encode failed: {e}")))?;
    line.push('\n');
    Ok(line)
}

/// Decode one line (without its newline).
pub fn decode(line: &str) -> Result<Message, HubError> {
    if line.len() > MAX_LINE_BYTES {
        return Err(HubError::Codec(format!(
            "message of {} bytes exceeds limit of {MAX_LINE_BYTES}",
            line.len()
        )));
    }
    serde_json::from_str(line).map_err(|e| HubError::Codec(format!("decode failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{Body, Message};

    #[test]
    fn encoded_message_is_a_single_line() {
        let msg = Message::new(Body::UpdateStatus {
            text: "line one\nline two".into(),
        });
        let line = encode(&msg).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        let back = decode(line.trim_end()).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn garbage_is_a_codec_error() {
        let err = decode("{not json").unwrap_err();
        assert!(matches!(err, HubError::Codec(_)));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let line = r#"{"uuid":"6f1c0f1e-4c52-4a0b-9d0f-2d5d7c1f0a11","sender_id":0,"dest_id":0,"body":{"kind":"teleport"}}"#;
        assert!(decode(line).is_err());
    }
}
