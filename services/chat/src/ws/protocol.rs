//! Decoding of what the relay client sends to the backend.

use chatrelay_realtime::frame::FRAME_PREFIX;
use chatrelay_realtime::{ClientEvent, KeepAlive};

/// One inbound socket message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Event(ClientEvent),
    KeepAlive(KeepAlive),
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("message is neither a frame nor a keep-alive")]
    Unframed,
    #[error("invalid client event: {0}")]
    Event(#[from] serde_json::Error),
}

/// Decodes a client frame (`data: <json>`) or a bare keep-alive message.
pub fn decode(text: &str) -> Result<Inbound, ProtocolError> {
    let text = text.trim();
    match text.strip_prefix(FRAME_PREFIX) {
        Some(payload) => Ok(Inbound::Event(serde_json::from_str(payload.trim())?)),
        None => serde_json::from_str(text)
            .map(Inbound::KeepAlive)
            .map_err(|_| ProtocolError::Unframed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatrelay_core::UiMessage;
    use chatrelay_realtime::frame::encode_event;

    #[test]
    fn decodes_framed_client_events() {
        let event = ClientEvent::Message {
            messages: vec![UiMessage::user_text("u1", "hi")],
        };
        let text = encode_event(&event).unwrap();
        assert_eq!(decode(&text).unwrap(), Inbound::Event(event));
    }

    #[test]
    fn decodes_bare_pings() {
        assert_eq!(
            decode(r#"{"type":"ping","timestamp":7}"#).unwrap(),
            Inbound::KeepAlive(KeepAlive::Ping { timestamp: 7 })
        );
    }

    #[test]
    fn rejects_other_text() {
        assert!(matches!(decode("hello"), Err(ProtocolError::Unframed)));
        assert!(matches!(decode("data: {}"), Err(ProtocolError::Event(_))));
    }
}
