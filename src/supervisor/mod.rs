//! Supervisor: owns the inbound message queue and dispatches each message.

pub mod bus;
pub mod dispatch;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use bus::SupervisorBus;
use dispatch::MessageHandler;

/// Run the supervisor message loop until `shutdown` is cancelled or every
/// comms sender is gone.
///
/// Each message is handed to `handler` without waiting for its reply, so a
/// slow reply on one channel never holds up another.
pub async fn run(mut bus: SupervisorBus, shutdown: CancellationToken, handler: Box<dyn MessageHandler>) {
    // Drop our own sender so the loop ends once all channels have exited.
    drop(bus.comms_tx);
    info!("supervisor ready");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!("supervisor shutting down");
                break;
            }

            msg = bus.comms_rx.recv() => {
                match msg {
                    Some(msg) => {
                        debug!(channel_id = %msg.channel_id, bytes = msg.content.len(), "dispatching message");
                        handler.handle_message(msg.channel_id, msg.content, msg.reply_tx);
                    }
                    None => {
                        info!("all comms channels closed, supervisor exiting");
                        break;
                    }
                }
            }
        }
    }
}
