use std::sync::Arc;

use crate::commands::protocol::{Command, Reply, Response};
use crate::peer::engine::ControlLink;
use crate::peer::types::MediaTrack;
use crate::recording::RecordingOrchestrator;

/// Session-scoped control link between the remote peer and the orchestrator.
pub struct CommandChannel {
    link: Arc<dyn ControlLink>,
}

impl CommandChannel {
    pub fn new(link: Arc<dyn ControlLink>) -> Self {
        Self { link }
    }

    /// Decodes one message, runs it and sends every resulting response.
    pub async fn handle(
        &self,
        text: &str,
        orchestrator: &mut RecordingOrchestrator,
        tracks: &[MediaTrack],
    ) {
        let responses = match Command::decode(text) {
            Ok(command) => {
                log::info!("command on '{}': {command:?}", self.link.label());
                execute(command, orchestrator, tracks).await
            }
            Err(e) => {
                log::warn!("rejecting command {text:?}: {e}");
                vec![e.into()]
            }
        };
        for response in &responses {
            self.respond(response).await;
        }
    }

    /// Sends a response. Dropped silently when the link is not open.
    pub async fn respond(&self, response: &Response) {
        if !self.link.is_open() {
            log::debug!("command link closed, dropping response");
            return;
        }
        let text = match serde_json::to_string(response) {
            Ok(text) => text,
            Err(e) => {
                log::warn!("failed to encode response: {e}");
                return;
            }
        };
        if let Err(e) = self.link.send_text(text).await {
            log::debug!("failed to send response: {e}");
        }
    }
}

/// Runs a command. Per-destination failure notices come first; the final
/// response is always last.
pub async fn execute(
    command: Command,
    orchestrator: &mut RecordingOrchestrator,
    tracks: &[MediaTrack],
) -> Vec<Response> {
    let mut responses = Vec::new();
    let reply = match command {
        Command::Start => {
            let report = orchestrator.start_recording(tracks).await;
            responses.extend(report.failed.iter().map(Response::destination_failure));
            Reply::Started {
                urls: orchestrator.urls(),
            }
        }
        Command::Stop => {
            let failed = orchestrator.stop_recording().await;
            responses.extend(failed.iter().map(Response::destination_failure));
            Reply::Stopped {}
        }
        Command::AddUrl { url } => {
            match orchestrator
                .add_destination(url.as_deref().unwrap_or_default(), tracks)
                .await
            {
                Ok(change) => {
                    responses.extend(change.failure.as_ref().map(Response::destination_failure));
                    Reply::UrlAdded { url: change.url }
                }
                Err(e) => {
                    responses.push(e.into());
                    return responses;
                }
            }
        }
        Command::RemoveUrl { url } => {
            match orchestrator
                .remove_destination(url.as_deref().unwrap_or_default())
                .await
            {
                Ok(change) => Reply::UrlRemoved { url: change.url },
                Err(e) => {
                    responses.push(e.into());
                    return responses;
                }
            }
        }
        Command::ListUrls => Reply::Urls {
            urls: orchestrator.urls(),
        },
        Command::Status => Reply::Status(orchestrator.status(tracks.len())),
    };
    responses.push(Response::Ok(reply));
    responses
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::RecorderOptions;
    use crate::testing::{video_track, MockControlLink, MockRecorderFactory};
    use serde_json::{json, Value};

    fn orchestrator(factory: Arc<MockRecorderFactory>) -> RecordingOrchestrator {
        RecordingOrchestrator::new(factory, RecorderOptions::default())
    }

    fn sent(link: &MockControlLink) -> Vec<Value> {
        link.sent()
            .iter()
            .map(|text| serde_json::from_str(text).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn status_before_media() {
        let link = Arc::new(MockControlLink::open("commands"));
        let channel = CommandChannel::new(link.clone());
        let mut orch = orchestrator(Arc::default());

        channel.handle(r#"{"action":"status"}"#, &mut orch, &[]).await;
        assert_eq!(
            link.sent(),
            vec![r#"{"status":"ok","recording":false,"urls":[],"tracks":0,"active_recorders":0}"#]
        );
    }

    #[tokio::test]
    async fn add_list_remove_round() {
        let link = Arc::new(MockControlLink::open("commands"));
        let channel = CommandChannel::new(link.clone());
        let mut orch = orchestrator(Arc::default());

        channel
            .handle(r#"{"action":"add_url","url":" rtmp://a/live "}"#, &mut orch, &[])
            .await;
        channel.handle(r#"{"action":"list_urls"}"#, &mut orch, &[]).await;
        channel
            .handle(r#"{"action":"remove_url","url":"rtmp://a/live"}"#, &mut orch, &[])
            .await;
        channel.handle(r#"{"action":"add_url"}"#, &mut orch, &[]).await;

        assert_eq!(
            sent(&link),
            vec![
                json!({"status": "ok", "url": "rtmp://a/live"}),
                json!({"status": "ok", "urls": ["rtmp://a/live"]}),
                json!({"status": "ok", "url": "rtmp://a/live"}),
                json!({"status": "error", "message": "URL required"}),
            ]
        );
    }

    #[tokio::test]
    async fn failures_are_reported_before_the_final_response() {
        let factory = Arc::new(MockRecorderFactory::default());
        factory.fail_start("rtmp://bad/live");
        let link = Arc::new(MockControlLink::open("commands"));
        let channel = CommandChannel::new(link.clone());
        let mut orch = orchestrator(factory);
        let tracks = [video_track("v")];
        orch.add_destination("rtmp://good/live", &tracks).await.unwrap();
        orch.add_destination("rtmp://bad/live", &tracks).await.unwrap();

        channel.handle(r#"{"action":"start"}"#, &mut orch, &tracks).await;
        let replies = sent(&link);
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0]["status"], "error");
        assert_eq!(replies[0]["url"], "rtmp://bad/live");
        assert_eq!(
            replies[1],
            json!({"status": "ok", "urls": ["rtmp://bad/live", "rtmp://good/live"]})
        );
    }

    #[tokio::test]
    async fn bad_input_gets_an_error_response() {
        let link = Arc::new(MockControlLink::open("commands"));
        let channel = CommandChannel::new(link.clone());
        let mut orch = orchestrator(Arc::default());

        channel.handle("{{{", &mut orch, &[]).await;
        channel.handle(r#"{"action":"dance"}"#, &mut orch, &[]).await;
        assert_eq!(
            sent(&link),
            vec![
                json!({"status": "error", "message": "Invalid JSON"}),
                json!({"status": "error", "message": "Unknown action: dance"}),
            ]
        );
    }

    #[tokio::test]
    async fn closed_link_drops_responses() {
        let link = Arc::new(MockControlLink::open("commands"));
        link.set_open(false);
        let channel = CommandChannel::new(link.clone());
        let mut orch = orchestrator(Arc::default());

        channel
            .handle(r#"{"action":"add_url","url":"rtmp://a/live"}"#, &mut orch, &[])
            .await;
        assert!(link.sent().is_empty());
        // the command still ran
        assert_eq!(orch.urls(), vec!["rtmp://a/live".to_string()]);
    }
}
