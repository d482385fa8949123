//! PTY (console) channel: reads lines from stdin, prints the bot's replies.
//!
//! Runs until the `shutdown` token is cancelled (Ctrl-C) or stdin closes.
//! Lines the bot does not answer print nothing.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::state::{CommsEvent, CommsState};
use crate::error::AppError;
use crate::subsystems::runtime::{Component, ComponentFuture};

pub struct PtyChannel {
    channel_id: String,
    bot_name: String,
    state: Arc<CommsState>,
}

impl PtyChannel {
    pub fn new(channel_id: impl Into<String>, bot_name: String, state: Arc<CommsState>) -> Self {
        Self { channel_id: channel_id.into(), bot_name, state }
    }
}

impl Component for PtyChannel {
    fn id(&self) -> &str {
        &self.channel_id
    }

    fn run(self: Box<Self>, shutdown: CancellationToken) -> ComponentFuture {
        Box::pin(run_pty(*self, shutdown))
    }
}

async fn run_pty(channel: PtyChannel, shutdown: CancellationToken) -> Result<(), AppError> {
    let PtyChannel { channel_id, bot_name, state } = channel;
    info!(%channel_id, "pty channel started");
    println!("─────────────────────────────────");
    println!(" {bot_name} console  (Ctrl-C to quit)");
    println!("─────────────────────────────────");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        use std::io::Write as _;
        let _ = std::io::stdout().flush();

        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                println!();
                info!("pty channel shutting down");
                break;
            }

            line = lines.next_line() => {
                match line {
                    Err(e) => {
                        warn!("pty read error: {e}");
                        break;
                    }
                    Ok(None) => {
                        info!("pty stdin closed");
                        break;
                    }
                    Ok(Some(input)) => {
                        let input = input.trim().to_string();
                        if input.is_empty() {
                            continue;
                        }
                        debug!(bytes = input.len(), "pty received line");

                        match state.send_message(&channel_id, input).await {
                            Err(e) => {
                                warn!("send_message error: {e}, pty exiting");
                                break;
                            }
                            Ok(Some(reply)) => println!("{reply}"),
                            Ok(None) => {}
                        }
                    }
                }
            }
        }
    }

    state.report_event(CommsEvent::ChannelShutdown { channel_id });
    Ok(())
}
