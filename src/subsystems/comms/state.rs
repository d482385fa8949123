//! Shared state for comms channels: their only way into the supervisor.

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::error::AppError;
use crate::supervisor::bus::CommsMessage;

/// Events a channel reports back to the comms manager.
#[derive(Debug)]
pub enum CommsEvent {
    /// Channel has stopped (clean exit or EOF).
    ChannelShutdown { channel_id: String },
}

/// Shared state passed as `Arc<CommsState>` to every channel task.
pub struct CommsState {
    /// Supervisor inbound queue.  Private; channels go through [`send_message`].
    ///
    /// [`send_message`]: CommsState::send_message
    comms_tx: mpsc::Sender<CommsMessage>,
    event_tx: mpsc::Sender<CommsEvent>,
}

impl CommsState {
    pub fn new(comms_tx: mpsc::Sender<CommsMessage>, event_tx: mpsc::Sender<CommsEvent>) -> Self {
        Self { comms_tx, event_tx }
    }

    /// Submit `content` seen on `channel_id` and await the bot's answer.
    /// `Ok(None)` means the bot chose not to reply.
    pub async fn send_message(&self, channel_id: &str, content: String) -> Result<Option<String>, AppError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.comms_tx
            .send(CommsMessage { channel_id: channel_id.to_string(), content, reply_tx })
            .await
            .map_err(|_| AppError::Comms("supervisor is not accepting messages".into()))?;
        reply_rx
            .await
            .map_err(|_| AppError::Comms("message handler dropped the reply".into()))
    }

    /// Report an event to the comms manager.  Never blocks; a full or
    /// closed queue drops the event with a warning.
    pub fn report_event(&self, event: CommsEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            warn!("comms event dropped: {e}");
        }
    }
}
