//! Supervisor event bus: typed channel pair between comms and supervisor.

use tokio::sync::{mpsc, oneshot};

/// A message received on a comms channel, with a slot for the response.
///
/// `None` means the bot stays silent (not running, or the channel is not
/// enabled); channels then print nothing.
pub struct CommsMessage {
    /// Source the message arrived on, e.g. `"pty0"`.
    pub channel_id: String,
    pub content: String,
    pub reply_tx: oneshot::Sender<Option<String>>,
}

/// Owns the supervisor-side channel ends.
pub struct SupervisorBus {
    /// Supervisor receives inbound messages here.
    pub comms_rx: mpsc::Receiver<CommsMessage>,
    /// Cloneable sender given to comms channels to submit messages.
    pub comms_tx: mpsc::Sender<CommsMessage>,
}

impl SupervisorBus {
    pub fn new(buffer: usize) -> Self {
        let (comms_tx, comms_rx) = mpsc::channel(buffer);
        Self { comms_rx, comms_tx }
    }
}
