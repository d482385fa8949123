//! Supervisor dispatch: the seam between the message loop and the bot.
//!
//! The supervisor owns the inbound queue but knows nothing about commands,
//! history or models.  It hands every [`CommsMessage`] to a
//! [`MessageHandler`] and moves on to the next one.
//!
//! [`CommsMessage`]: crate::supervisor::bus::CommsMessage

use tokio::sync::oneshot;

pub trait MessageHandler: Send + Sync {
    /// Handle one inbound message, taking ownership of `reply_tx`.
    ///
    /// Implementations **must not block** the caller: resolve `reply_tx`
    /// synchronously or move it into a `tokio::spawn` task.
    fn handle_message(
        &self,
        channel_id: String,
        content: String,
        reply_tx: oneshot::Sender<Option<String>>,
    );
}
