//! Local line-oriented chat
//!
//! Reads one message per line and writes one reply per message. Scheduled
//! actions addressed to the local user are printed between messages.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::orchestrator::Orchestrator;
use sdk::types::UserId;

const PROMPT: &str = "you> ";

pub struct LocalChat {
    orchestrator: Arc<Orchestrator>,
    user_id: UserId,
    tick: Duration,
}

impl LocalChat {
    pub fn new(orchestrator: Arc<Orchestrator>, user_id: UserId, tick: Duration) -> Self {
        Self {
            orchestrator,
            user_id,
            tick,
        }
    }

    /// Chat until the input ends or the user types `/quit`
    pub async fn run<R, W>(&self, input: R, mut output: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        info!(user = %self.user_id, "Starting local chat");
        let mut lines = input.lines();
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        output.write_all(PROMPT.as_bytes()).await?;
        output.flush().await?;

        loop {
            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = interval.tick() => {
                    self.print_scheduled(&mut output).await?;
                    continue;
                }
            };

            let Some(line) = line else { break };
            let text = line.trim();
            if matches!(text, "/quit" | "/exit") {
                break;
            }
            if text.is_empty() {
                output.write_all(PROMPT.as_bytes()).await?;
                output.flush().await?;
                continue;
            }

            let reply = self
                .orchestrator
                .on_message(&self.user_id, text, Vec::new())
                .await;
            output
                .write_all(format!("steward> {}\n{}", reply, PROMPT).as_bytes())
                .await?;
            output.flush().await?;
        }

        output.write_all(b"\n").await?;
        output.flush().await?;
        debug!(user = %self.user_id, "Local chat ended");
        Ok(())
    }

    async fn print_scheduled<W: AsyncWrite + Unpin>(&self, output: &mut W) -> Result<()> {
        let actions = self.orchestrator.on_schedule().await;
        for action in &actions {
            if action.user_id != self.user_id {
                warn!(
                    user = %action.user_id,
                    handler = %action.handler_name,
                    "Scheduled action for another user not delivered"
                );
                continue;
            }
            output
                .write_all(format!("\nsteward> {}\n{}", action.text, PROMPT).as_bytes())
                .await?;
        }
        output.flush().await?;
        Ok(())
    }
}
