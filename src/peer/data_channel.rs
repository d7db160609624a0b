use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

use crate::error::NegotiationError;
use crate::peer::engine::{ControlLink, EngineEvent};

/// A data channel carrying the command protocol.
pub struct DataChannelLink {
    dc: Arc<RTCDataChannel>,
}

impl DataChannelLink {
    /// Wraps a data channel and forwards its text messages as [`EngineEvent::ControlMessage`].
    pub fn attach(
        dc: Arc<RTCDataChannel>,
        events: Option<mpsc::Sender<EngineEvent>>,
    ) -> Arc<DataChannelLink> {
        let link = Arc::new(DataChannelLink { dc: dc.clone() });
        let label = dc.label().to_string();
        log::debug!("attaching data channel '{label}'");

        dc.on_open(Box::new({
            let label = label.clone();
            move || {
                log::info!("command channel '{label}' open");
                Box::pin(async {})
            }
        }));

        if let Some(events) = events {
            // weak: the channel's own handler must not keep the link alive
            let weak = Arc::downgrade(&link);
            let label = label.clone();
            dc.on_message(Box::new(move |msg: DataChannelMessage| {
                let events = events.clone();
                let link = weak.upgrade();
                let label = label.clone();
                Box::pin(async move {
                    let Some(link) = link else { return };
                    if !msg.is_string {
                        log::debug!(
                            "ignoring {} byte binary message on '{label}'",
                            msg.data.len()
                        );
                        return;
                    }
                    let text = String::from_utf8_lossy(&msg.data).into_owned();
                    let link: Arc<dyn ControlLink> = link;
                    let _ = events.send(EngineEvent::ControlMessage { link, text }).await;
                })
            }));
        }

        dc.on_close(Box::new(move || {
            log::info!("command channel '{label}' closed");
            Box::pin(async {})
        }));

        link
    }
}

#[async_trait]
impl ControlLink for DataChannelLink {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<(), NegotiationError> {
        if !self.is_open() {
            return Err(NegotiationError::LinkClosed);
        }
        self.dc.send_text(text).await?;
        Ok(())
    }
}
