//! Subscriber wire protocol spoken over `/ws`.

use serde::{Deserialize, Serialize};

use postcrew_core::ids::RunId;

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { run_id: RunId },
    Unsubscribe { run_id: RunId },
    Ping,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Subscribed { run_id: RunId },
    Unsubscribed { run_id: RunId },
    Pong { timestamp: String },
    Error { message: String },
}

impl ServerMessage {
    pub fn pong() -> Self {
        Self::Pong {
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"error","message":"encode failed"}"#.into())
    }
}

/// Parse one client frame. Anything unusable becomes the error frame to
/// send back.
pub fn parse_client_message(raw: &str) -> Result<ClientMessage, ServerMessage> {
    let message: ClientMessage =
        serde_json::from_str(raw).map_err(|e| ServerMessage::error(format!("invalid message: {e}")))?;
    match &message {
        ClientMessage::Subscribe { run_id } | ClientMessage::Unsubscribe { run_id }
            if run_id.as_str().trim().is_empty() =>
        {
            Err(ServerMessage::error("run_id must not be empty"))
        }
        _ => Ok(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subscribe() {
        let msg = parse_client_message(r#"{"type":"subscribe","run_id":"run_1"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Subscribe {
                run_id: RunId::from_raw("run_1")
            }
        );
    }

    #[test]
    fn parses_ping() {
        assert_eq!(parse_client_message(r#"{"type":"ping"}"#).unwrap(), ClientMessage::Ping);
    }

    #[test]
    fn rejects_garbage_and_unknown_types() {
        for raw in ["not json", r#"{"type":"dance"}"#, r#"{"type":"subscribe"}"#] {
            let err = parse_client_message(raw).unwrap_err();
            assert!(matches!(err, ServerMessage::Error { .. }), "{raw}");
        }
    }

    #[test]
    fn rejects_empty_run_id() {
        let err = parse_client_message(r#"{"type":"unsubscribe","run_id":"  "}"#).unwrap_err();
        assert_eq!(err, ServerMessage::error("run_id must not be empty"));
    }

    #[test]
    fn server_frames_are_tagged() {
        let json: serde_json::Value = serde_json::from_str(
            &ServerMessage::Subscribed {
                run_id: RunId::from_raw("run_9"),
            }
            .to_json(),
        )
        .unwrap();
        assert_eq!(json["type"], "subscribed");
        assert_eq!(json["run_id"], "run_9");

        let pong: serde_json::Value = serde_json::from_str(&ServerMessage::pong().to_json()).unwrap();
        assert_eq!(pong["type"], "pong");
        assert!(pong["timestamp"].as_str().unwrap().contains('T'));
    }
}
