use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CommandError, DestinationError};
use crate::recording::RecordingStatus;

const ACTIONS: &[&str] = &["start", "stop", "add_url", "remove_url", "list_urls", "status"];

/// Request sent by the remote peer over the command channel.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    Start,
    Stop,
    AddUrl {
        #[serde(default)]
        url: Option<String>,
    },
    RemoveUrl {
        #[serde(default)]
        url: Option<String>,
    },
    ListUrls,
    Status,
}

impl Command {
    /// Decodes one `{action, ...args}` message.
    pub fn decode(text: &str) -> Result<Command, CommandError> {
        let value: Value = serde_json::from_str(text).map_err(|_| CommandError::InvalidJson)?;
        let action = match value.get("action") {
            Some(Value::String(action)) => action.clone(),
            Some(other) => return Err(CommandError::UnknownAction(other.to_string())),
            None => return Err(CommandError::MissingAction),
        };
        if !ACTIONS.contains(&action.as_str()) {
            return Err(CommandError::UnknownAction(action));
        }
        serde_json::from_value(value).map_err(|_| CommandError::InvalidArguments(action))
    }
}

/// Action-specific fields of an `ok` response.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Reply {
    Started { urls: Vec<String> },
    Stopped {},
    UrlAdded { url: String },
    UrlRemoved { url: String },
    Urls { urls: Vec<String> },
    Status(RecordingStatus),
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ErrorReply {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// `{"status": "ok" | "error", ...}`
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Response {
    Ok(Reply),
    Error(ErrorReply),
}

impl Response {
    pub fn error(message: impl Into<String>) -> Self {
        Response::Error(ErrorReply {
            message: message.into(),
            url: None,
        })
    }

    /// Notice for one destination that failed while a command ran.
    pub fn destination_failure(error: &DestinationError) -> Self {
        Response::Error(ErrorReply {
            message: error.to_string(),
            url: Some(error.url().to_string()),
        })
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok(_))
    }
}

impl From<CommandError> for Response {
    fn from(error: CommandError) -> Self {
        Response::error(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_every_action() {
        assert_eq!(Command::decode(r#"{"action":"start"}"#), Ok(Command::Start));
        assert_eq!(Command::decode(r#"{"action":"stop"}"#), Ok(Command::Stop));
        assert_eq!(
            Command::decode(r#"{"action":"add_url","url":"rtmp://a/live"}"#),
            Ok(Command::AddUrl {
                url: Some("rtmp://a/live".into())
            })
        );
        assert_eq!(
            Command::decode(r#"{"action":"remove_url"}"#),
            Ok(Command::RemoveUrl { url: None })
        );
        assert_eq!(Command::decode(r#"{"action":"list_urls"}"#), Ok(Command::ListUrls));
        assert_eq!(
            Command::decode(r#"{"action":"status","extra":true}"#),
            Ok(Command::Status)
        );
    }

    #[test]
    fn rejects_bad_messages() {
        assert_eq!(Command::decode("not json"), Err(CommandError::InvalidJson));
        assert_eq!(Command::decode(r#"{"url":"x"}"#), Err(CommandError::MissingAction));
        assert_eq!(
            Command::decode(r#"{"action":"explode"}"#),
            Err(CommandError::UnknownAction("explode".into()))
        );
        assert_eq!(
            Command::decode(r#"{"action":"add_url","url":42}"#),
            Err(CommandError::InvalidArguments("add_url".into()))
        );
    }

    #[test]
    fn error_messages_match_the_wire_protocol() {
        assert_eq!(CommandError::InvalidJson.to_string(), "Invalid JSON");
        assert_eq!(CommandError::UrlRequired.to_string(), "URL required");
        assert_eq!(
            CommandError::UnknownAction("explode".into()).to_string(),
            "Unknown action: explode"
        );
    }

    #[test]
    fn responses_serialize_flat() {
        let ok = Response::Ok(Reply::Started {
            urls: vec!["rtmp://a/live".into()],
        });
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"status": "ok", "urls": ["rtmp://a/live"]})
        );

        let stopped = Response::Ok(Reply::Stopped {});
        assert_eq!(serde_json::to_value(&stopped).unwrap(), json!({"status": "ok"}));

        let status = Response::Ok(Reply::Status(RecordingStatus {
            recording: false,
            urls: vec![],
            tracks: 0,
            active_recorders: 0,
        }));
        assert_eq!(
            serde_json::to_string(&status).unwrap(),
            r#"{"status":"ok","recording":false,"urls":[],"tracks":0,"active_recorders":0}"#
        );

        let err: Response = CommandError::UrlRequired.into();
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({"status": "error", "message": "URL required"})
        );

        let failure = Response::destination_failure(&DestinationError::NoMedia {
            url: "rtmp://a/live".into(),
        });
        assert_eq!(
            serde_json::to_value(&failure).unwrap(),
            json!({"status": "error", "message": "rtmp://a/live: no media available", "url": "rtmp://a/live"})
        );
    }
}
