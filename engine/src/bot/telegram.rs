//! Telegram Bot Integration
//!
//! Long-polls the Bot API and feeds messages from authorized users to the
//! orchestrator. Scheduled actions are delivered by a separate timer loop.
//!
//! Updates are submitted to the orchestrator in the order they arrive, before
//! any await, so each user's messages keep their order while replies for
//! different users are sent concurrently.

use anyhow::Result;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::orchestrator::{render, Orchestrator};
use crate::secrets::scrub;
use sdk::types::{Attachment, InboundMessage, ScheduledAction, UserId};

const API_BASE: &str = "https://api.telegram.org";

/// Telegram rejects messages longer than 4096 characters
const MAX_MESSAGE_CHARS: usize = 4000;

#[derive(Clone)]
pub struct TelegramBot {
    token: String,
    api_base: String,
    allowed_users: Vec<i64>,
    poll_timeout: Duration,
    client: Client,
    orchestrator: Arc<Orchestrator>,
}

impl std::fmt::Debug for TelegramBot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramBot")
            .field("api_base", &self.api_base)
            .field("allowed_users", &self.allowed_users)
            .field("poll_timeout", &self.poll_timeout)
            .finish()
    }
}

#[derive(Deserialize, Debug)]
struct Update {
    update_id: i64,
    message: Option<Message>,
}

#[derive(Deserialize, Debug)]
struct Message {
    chat: Chat,
    text: Option<String>,
    caption: Option<String>,
    from: Option<User>,
    #[serde(default)]
    photo: Vec<FileRef>,
    voice: Option<FileRef>,
    document: Option<FileRef>,
}

#[derive(Deserialize, Debug)]
struct Chat {
    id: i64,
}

#[derive(Deserialize, Debug)]
struct User {
    id: i64,
}

#[derive(Deserialize, Debug)]
struct FileRef {
    file_id: String,
}

#[derive(Deserialize, Debug)]
struct GetUpdatesResponse {
    ok: bool,
    result: Option<Vec<Update>>,
    description: Option<String>,
}

impl Message {
    /// Photos, voice notes and documents as attachments
    ///
    /// The caption is attached to the first attachment so it takes part in
    /// routing exactly once.
    fn attachments(&self) -> Vec<Attachment> {
        let mut attachments = Vec::new();
        // Telegram lists photo sizes smallest first
        if let Some(photo) = self.photo.last() {
            attachments.push(("photo", &photo.file_id));
        }
        if let Some(voice) = &self.voice {
            attachments.push(("voice", &voice.file_id));
        }
        if let Some(document) = &self.document {
            attachments.push(("document", &document.file_id));
        }

        attachments
            .into_iter()
            .enumerate()
            .map(|(i, (kind, file_id))| Attachment {
                kind: kind.to_string(),
                reference: file_id.clone(),
                caption: if i == 0 { self.caption.clone() } else { None },
            })
            .collect()
    }
}

impl TelegramBot {
    pub fn new(token: String, allowed_users: Vec<i64>, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            token,
            api_base: API_BASE.to_string(),
            allowed_users,
            poll_timeout: Duration::from_secs(30),
            client: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
            orchestrator,
        }
    }

    /// Point the bot at a different Bot API server
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        // The HTTP timeout has to outlast the long poll
        self.client = Client::builder()
            .timeout(poll_timeout + Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        self
    }

    /// An empty allow-list admits everyone
    pub fn is_authorized(&self, user_id: i64) -> bool {
        self.allowed_users.is_empty() || self.allowed_users.contains(&user_id)
    }

    fn url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    /// Run the long-polling loop until `shutdown` flips to true
    pub async fn start_polling(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Starting Telegram bot long-polling loop...");
        let mut offset = 0;

        loop {
            let updates = tokio::select! {
                _ = shutdown.changed() => break,
                updates = self.get_updates(offset) => updates,
            };

            match updates {
                Ok(updates) => {
                    for update in updates {
                        offset = update.update_id + 1;
                        if let Some(msg) = update.message {
                            self.handle_message(msg);
                        }
                    }
                }
                Err(e) => {
                    error!("Failed to fetch Telegram updates: {}", scrub(&e.to_string()));
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                    }
                }
            }
        }

        info!("Telegram polling stopped");
        Ok(())
    }

    async fn get_updates(&self, offset: i64) -> Result<Vec<Update>> {
        let response = self
            .client
            .get(self.url("getUpdates"))
            .query(&[
                ("offset", offset.to_string()),
                ("timeout", self.poll_timeout.as_secs().to_string()),
            ])
            .send()
            .await?
            .json::<GetUpdatesResponse>()
            .await?;

        if !response.ok {
            return Err(anyhow::anyhow!(
                "Telegram API returned ok=false: {}",
                response.description.unwrap_or_default()
            ));
        }

        Ok(response.result.unwrap_or_default())
    }

    /// Submit one update and spawn delivery of its reply
    fn handle_message(&self, msg: Message) {
        let chat_id = msg.chat.id;

        let user_id = match msg.from.as_ref() {
            Some(u) => u.id,
            None => {
                warn!("Message with no user info - ignoring");
                return;
            }
        };

        if !self.is_authorized(user_id) {
            warn!("Unauthorized user {} attempted to use the bot", user_id);
            self.spawn_send(chat_id, "Unauthorized. Access denied.".to_string());
            return;
        }

        let attachments = msg.attachments();
        let text = msg.text.unwrap_or_default();
        if text.trim().is_empty() && attachments.is_empty() {
            debug!(user = user_id, "Ignoring empty message");
            return;
        }
        info!(user = user_id, attachments = attachments.len(), "Received message");

        if let Some(reply) = self.orchestrator.builtin_command(&text) {
            self.spawn_send(chat_id, reply);
            return;
        }

        let message = InboundMessage::new(text).with_attachments(attachments);
        let pending = self
            .orchestrator
            .submit(UserId::new(user_id.to_string()), message);

        let bot = self.clone();
        tokio::spawn(async move {
            let reply = render(pending.await);
            if let Err(e) = bot.send_message(chat_id, &reply).await {
                error!("Failed to send reply to {}: {}", chat_id, scrub(&e.to_string()));
            }
        });
    }

    fn spawn_send(&self, chat_id: i64, text: String) {
        let bot = self.clone();
        tokio::spawn(async move {
            if let Err(e) = bot.send_message(chat_id, &text).await {
                error!("Failed to send message to {}: {}", chat_id, scrub(&e.to_string()));
            }
        });
    }

    /// Deliver scheduled actions every `tick` until `shutdown` flips to true
    ///
    /// Users are addressed by their private chat, whose id equals the user id.
    pub async fn run_scheduler(&self, tick: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(tick_secs = tick.as_secs(), "Starting scheduler loop");
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {}
            }

            for action in self.orchestrator.on_schedule().await {
                self.deliver(&action).await;
            }
        }

        info!("Scheduler loop stopped");
    }

    async fn deliver(&self, action: &ScheduledAction) {
        let chat_id = match action.user_id.as_str().parse::<i64>() {
            Ok(id) => id,
            Err(_) => {
                warn!(
                    user = %action.user_id,
                    handler = %action.handler_name,
                    "Scheduled action for a non-Telegram user dropped"
                );
                return;
            }
        };

        if let Err(e) = self.send_message(chat_id, &action.text).await {
            error!(
                handler = %action.handler_name,
                "Failed to deliver scheduled action: {}",
                scrub(&e.to_string())
            );
        }
    }

    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        // Scrub secrets from outgoing messages
        let scrubbed = truncate(&scrub(text));

        #[derive(Serialize)]
        struct SendMsgReq<'a> {
            chat_id: i64,
            text: &'a str,
        }

        let req = SendMsgReq {
            chat_id,
            text: &scrubbed,
        };

        self.client
            .post(self.url("sendMessage"))
            .json(&req)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Cut on a character boundary
fn truncate(text: &str) -> String {
    match text.char_indices().nth(MAX_MESSAGE_CHARS) {
        Some((cut, _)) => format!("{}...\n\n(truncated)", &text[..cut]),
        None => text.to_string(),
    }
}
