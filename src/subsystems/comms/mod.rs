//! Comms subsystem: the chat surfaces the bot listens on.
//!
//! Each channel implements [`Component`] and is spawned by [`start`] via
//! [`spawn_components`].  Channels capture an `Arc<CommsState>` at
//! construction and talk to the supervisor only through it.

#[cfg(feature = "channel-pty")]
pub mod pty;
mod state;

pub use state::{CommsEvent, CommsState};

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::subsystems::runtime::{Component, SubsystemHandle, spawn_components};
use crate::supervisor::bus::CommsMessage;

/// Spawn all configured channels and return immediately.  The handle
/// resolves when every channel has exited.
pub fn start(config: &Config, comms_tx: mpsc::Sender<CommsMessage>, shutdown: CancellationToken) -> SubsystemHandle {
    let (event_tx, mut event_rx) = mpsc::channel::<CommsEvent>(32);
    let state = Arc::new(CommsState::new(comms_tx, event_tx));

    let mut components: Vec<Box<dyn Component>> = Vec::new();

    #[cfg(feature = "channel-pty")]
    {
        if config.comms_pty_should_load() {
            info!("loading pty channel");
            components.push(Box::new(pty::PtyChannel::new("pty0", config.bot_name.clone(), state.clone())));
        }
    }

    if components.is_empty() {
        info!("no comms channels configured, waiting for shutdown");
    }
    drop(state);

    // Monitoring only; ends when the last channel drops its state.
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                CommsEvent::ChannelShutdown { channel_id } => {
                    debug!(%channel_id, "channel reported shutdown");
                }
            }
        }
    });

    spawn_components(components, shutdown)
}
