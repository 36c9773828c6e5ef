//! Bot account: sign in with the bot token, receive messages and reply.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use grammers_client::client::UpdatesConfiguration;
use grammers_client::media::Media;
use grammers_client::update::{Message, Update};
use grammers_client::message::InputMessage;
use grammers_client::{Client, SenderPool};
use grammers_session::storages::SqliteSession;
use grammers_tl_types as tl;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::client::TelegramError;
use crate::config::TelegramConfig;
use crate::pipeline::ReplyChannel;
use crate::queue::UserId;

/// A text message received by the bot.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub user_id: UserId,
    pub text: String,
}

/// Replies into the chat a message came from.
#[derive(Clone)]
pub struct BotReply {
    client: Client,
    message: Message,
}

impl ReplyChannel for BotReply {
    async fn send_text(&self, text: &str) -> anyhow::Result<()> {
        self.message
            .respond(text)
            .await
            .context("failed to send message")?;
        Ok(())
    }

    async fn send_file(&self, path: &Path, caption: &str, thumbnail: Option<&Path>) -> anyhow::Result<()> {
        let uploaded = self
            .client
            .upload_file(path)
            .await
            .with_context(|| format!("failed to upload {}", path.display()))?;

        let mut message = InputMessage::from(caption).document(uploaded);
        if let Some(thumbnail) = thumbnail {
            match self.client.upload_file(thumbnail).await {
                Ok(thumb) => message = message.thumbnail(thumb),
                Err(e) => warn!("Failed to upload thumbnail {}: {}", thumbnail.display(), e),
            }
        }

        self.message
            .respond(message)
            .await
            .context("failed to send document")?;
        Ok(())
    }

    async fn send_photo(&self, path: &Path, caption: &str) -> anyhow::Result<()> {
        let uploaded = self
            .client
            .upload_file(path)
            .await
            .with_context(|| format!("failed to upload {}", path.display()))?;

        self.message
            .respond(InputMessage::from(caption).photo(uploaded))
            .await
            .context("failed to send photo")?;
        Ok(())
    }

    async fn save_replied_photo(&self, path: &Path) -> anyhow::Result<bool> {
        let Some(replied) = self
            .message
            .get_reply()
            .await
            .context("failed to read the replied message")?
        else {
            return Ok(false);
        };

        let Some(photo @ Media::Photo(_)) = replied.media() else {
            return Ok(false);
        };

        self.client
            .download_media(&photo, path)
            .await
            .with_context(|| format!("failed to download photo to {}", path.display()))?;
        Ok(true)
    }
}

impl std::fmt::Debug for BotReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotReply").finish_non_exhaustive()
    }
}

/// Runs the bot until `shutdown` fires.
///
/// Every incoming private text message is handed to `on_message` together
/// with a reply handle for its chat.
pub async fn run_bot<H>(
    config: &TelegramConfig,
    shutdown: CancellationToken,
    on_message: H,
) -> Result<(), TelegramError>
where
    H: Fn(IncomingMessage, BotReply) + Send + Sync,
{
    if let Some(parent) = config.session_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| TelegramError::Session(e.to_string()))?;
    }

    let session = Arc::new(
        SqliteSession::open(&config.session_path)
            .await
            .map_err(|e| TelegramError::Session(e.to_string()))?,
    );

    let SenderPool {
        runner,
        updates,
        handle,
    } = SenderPool::new(Arc::clone(&session), config.api_id);
    let client = Client::new(handle.clone());
    let pool_task = tokio::spawn(async move {
        runner.run().await;
    });

    let authorized = client
        .is_authorized()
        .await
        .map_err(|e| TelegramError::Connection(e.to_string()))?;
    if !authorized {
        info!("Signing in with bot token");
        client
            .bot_sign_in(&config.bot_token, &config.api_hash)
            .await
            .map_err(|e| TelegramError::SignInFailed(e.to_string()))?;
    }
    info!("Bot is online");

    let mut stream = client.stream_updates(
        updates,
        UpdatesConfiguration {
            catch_up: false,
            ..Default::default()
        },
    );

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                info!("Bot update loop stopping");
                break;
            }
            update = stream.next() => {
                match update {
                    Ok(Update::NewMessage(message)) if !message.outgoing() => {
                        let Some(user_id) = sender_id(&message.raw) else {
                            debug!("Ignoring message without a user sender");
                            continue;
                        };
                        let text = message.text().to_owned();
                        if text.is_empty() {
                            continue;
                        }
                        let reply = BotReply {
                            client: client.clone(),
                            message,
                        };
                        on_message(IncomingMessage { user_id, text }, reply);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let err = TelegramError::from(e);
                        if let TelegramError::FloodWait(seconds) = err {
                            warn!("Flood wait of {} s on the update stream", seconds);
                            tokio::time::sleep(std::time::Duration::from_secs(u64::from(seconds))).await;
                        } else {
                            error!("Update stream error: {}", err);
                        }
                    }
                }
            }
        }
    }

    handle.thin.quit();
    let _ = pool_task.await;
    Ok(())
}

/// Private chats carry the user as the peer; groups carry `from_id`.
fn sender_id(raw: &tl::enums::Message) -> Option<UserId> {
    let tl::enums::Message::Message(message) = raw else {
        return None;
    };
    match message.from_id.as_ref().unwrap_or(&message.peer_id) {
        tl::enums::Peer::User(user) => Some(user.user_id),
        _ => None,
    }
}
