//! Per-user Telegram client.
//!
//! Each logged-in user gets their own `MTProto` connection backed by an
//! SQLite session file. The bot never sees restricted posts itself; it reads
//! them through the user's client and downloads the media in chunks.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use grammers_client::client::{LoginToken, PasswordToken};
use grammers_client::{Client, InvocationError, SenderPool, SignInError, sender};
use grammers_session::storages::SqliteSession;
use grammers_tl_types as tl;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::link::{ChatRef, PostLink};
use super::rate_limiter::{BACKOFF_BASE, BACKOFF_MAX, backoff_delay};
use crate::config::TelegramConfig;
use crate::pipeline::{FetchedPost, PostFetcher, PostMedia};
use crate::queue::UserId;
use crate::session::{SessionClient, SessionConnector};
use crate::transfer::{CHUNK_SIZE, MediaSource, TransferError};

/// Attempts for a request that keeps hitting flood waits.
const FLOOD_RETRIES: u32 = 3;

/// Dialog pages scanned when resolving a private channel.
const DIALOG_PAGES: usize = 5;

/// Errors that can occur during Telegram operations.
#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("Not authorized. Please sign in first.")]
    NotAuthorized,

    #[error("Sign in failed: {0}")]
    SignInFailed(String),

    #[error("Password required for 2FA")]
    PasswordRequired(PasswordToken),

    #[error("Invalid password")]
    InvalidPassword(PasswordToken),

    #[error("Invalid login code")]
    InvalidCode,

    #[error("Flood wait required: {0} seconds")]
    FloodWait(u32),

    #[error("Chat {0} not found or not accessible with this account")]
    ChatNotFound(String),

    #[error("Message {0} not found")]
    MessageNotFound(i32),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("API invocation error: {0}")]
    Invocation(String),
}

impl From<InvocationError> for TelegramError {
    fn from(err: InvocationError) -> Self {
        let err_str = err.to_string();

        if (err_str.contains("FLOOD_WAIT") || err_str.contains("flood"))
            && let Some(seconds) = extract_flood_wait_seconds(&err_str)
        {
            return Self::FloodWait(seconds);
        }

        Self::Invocation(err_str)
    }
}

/// Extracts flood wait seconds from an error message.
pub(crate) fn extract_flood_wait_seconds(err_msg: &str) -> Option<u32> {
    let lowered = err_msg.to_lowercase();

    for pattern in ["flood_wait_", "flood wait "] {
        if let Some(idx) = lowered.find(pattern) {
            let num_str: String = lowered[idx + pattern.len()..]
                .chars()
                .take_while(char::is_ascii_digit)
                .collect();
            if let Ok(seconds) = num_str.parse() {
                return Some(seconds);
            }
        }
    }
    None
}

/// A user's `MTProto` client.
pub struct UserClient {
    client: Client,

    /// Handle to the sender pool for disconnection.
    handle: sender::SenderPoolHandle,

    /// Access hashes of channels seen so far, by channel id.
    channels: Mutex<HashMap<i64, i64>>,

    /// Background task running the sender pool.
    _pool_task: JoinHandle<()>,
}

impl UserClient {
    /// Connects using the session file at `session_path`.
    pub async fn connect(config: &TelegramConfig, session_path: &Path) -> Result<Self, TelegramError> {
        debug!("Opening session {}", session_path.display());

        if let Some(parent) = session_path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TelegramError::Session(e.to_string()))?;
        }

        let session = Arc::new(
            SqliteSession::open(session_path)
                .await
                .map_err(|e| TelegramError::Session(e.to_string()))?,
        );

        let SenderPool {
            runner,
            updates: _updates,
            handle,
        } = SenderPool::new(Arc::clone(&session), config.api_id);

        let client = Client::new(handle.clone());

        let pool_task = tokio::spawn(async move {
            runner.run().await;
        });

        Ok(Self {
            client,
            handle: handle.thin,
            channels: Mutex::new(HashMap::new()),
            _pool_task: pool_task,
        })
    }

    pub async fn check_authorized(&self) -> Result<bool, TelegramError> {
        self.client
            .is_authorized()
            .await
            .map_err(|e| TelegramError::Connection(e.to_string()))
    }

    /// Requests a login code to be sent to the phone number.
    pub async fn request_login_code(
        &self,
        phone: &str,
        api_hash: &str,
    ) -> Result<LoginToken, TelegramError> {
        info!("Requesting login code for phone: {}", mask_phone(phone));

        self.client
            .request_login_code(phone, api_hash)
            .await
            .map_err(|e| TelegramError::SignInFailed(e.to_string()))
    }

    /// Signs in with the login code.
    pub async fn sign_in(&self, token: &LoginToken, code: &str) -> Result<(), TelegramError> {
        match self.client.sign_in(token, code).await {
            Ok(_user) => {
                info!("User signed in");
                Ok(())
            }
            Err(SignInError::PasswordRequired(password_token)) => {
                debug!("2FA password required, hint: {:?}", password_token.hint());
                Err(TelegramError::PasswordRequired(password_token))
            }
            Err(SignInError::InvalidCode) => Err(TelegramError::InvalidCode),
            Err(e) => Err(TelegramError::SignInFailed(e.to_string())),
        }
    }

    /// Checks the 2FA password.
    pub async fn check_password(
        &self,
        password_token: PasswordToken,
        password: &str,
    ) -> Result<(), TelegramError> {
        match self.client.check_password(password_token, password).await {
            Ok(_user) => {
                info!("User signed in with 2FA");
                Ok(())
            }
            Err(SignInError::InvalidPassword(token)) => Err(TelegramError::InvalidPassword(token)),
            Err(e) => Err(TelegramError::SignInFailed(e.to_string())),
        }
    }

    /// Checks if the account has Telegram Premium.
    pub async fn is_premium(&self) -> Result<bool, TelegramError> {
        let request = tl::functions::users::GetUsers {
            id: vec![tl::enums::InputUser::UserSelf],
        };

        let users = self.client.invoke(&request).await?;
        if let Some(tl::enums::User::User(user)) = users.first() {
            Ok(user.premium)
        } else {
            warn!("Could not get user info, assuming non-premium");
            Ok(false)
        }
    }

    /// Terminates the session on Telegram's side.
    pub async fn log_out(&self) -> Result<(), TelegramError> {
        self.client
            .invoke(&tl::functions::auth::LogOut {})
            .await
            .map(|_| ())
            .map_err(Into::into)
    }

    pub fn quit(&self) {
        self.handle.quit();
    }

    /// Invokes `request`, sleeping out flood waits between attempts.
    async fn invoke_with_retry<R>(&self, request: &R) -> Result<R::Return, TelegramError>
    where
        R: tl::RemoteCall,
    {
        let mut attempt = 0;
        loop {
            match self.client.invoke(request).await.map_err(TelegramError::from) {
                Err(TelegramError::FloodWait(seconds)) if attempt + 1 < FLOOD_RETRIES => {
                    let delay = backoff_delay(attempt, BACKOFF_BASE, BACKOFF_MAX)
                        .max(std::time::Duration::from_secs(u64::from(seconds)));
                    warn!("Flood wait of {} s, retrying in {:?}", seconds, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn remember_channels(&self, chats: &[tl::enums::Chat]) {
        let mut channels = self.channels.lock().await;
        for chat in chats {
            if let tl::enums::Chat::Channel(channel) = chat
                && let Some(hash) = channel.access_hash
            {
                channels.insert(channel.id, hash);
            }
        }
    }

    async fn cached_channel(&self, id: i64) -> Option<tl::enums::InputChannel> {
        self.channels.lock().await.get(&id).map(|&access_hash| {
            tl::enums::InputChannel::Channel(tl::types::InputChannel {
                channel_id: id,
                access_hash,
            })
        })
    }

    async fn resolve_channel(&self, chat: &ChatRef) -> Result<tl::enums::InputChannel, TelegramError> {
        match chat {
            ChatRef::Username(username) => {
                let resolved = self
                    .invoke_with_retry(&tl::functions::contacts::ResolveUsername {
                        username: username.clone(),
                        referer: None,
                    })
                    .await?;
                let tl::enums::contacts::ResolvedPeer::Peer(resolved) = resolved;
                self.remember_channels(&resolved.chats).await;

                match resolved.peer {
                    tl::enums::Peer::Channel(peer) => self
                        .cached_channel(peer.channel_id)
                        .await
                        .ok_or_else(|| TelegramError::ChatNotFound(chat.to_string())),
                    _ => Err(TelegramError::ChatNotFound(chat.to_string())),
                }
            }
            ChatRef::Channel(id) => {
                if let Some(channel) = self.cached_channel(*id).await {
                    return Ok(channel);
                }
                self.scan_dialogs(*id).await?;
                self.cached_channel(*id)
                    .await
                    .ok_or_else(|| TelegramError::ChatNotFound(chat.to_string()))
            }
        }
    }

    /// Walks the dialog list until channel `wanted` shows up.
    async fn scan_dialogs(&self, wanted: i64) -> Result<(), TelegramError> {
        let mut offset_date = 0;

        for _ in 0..DIALOG_PAGES {
            let request = tl::functions::messages::GetDialogs {
                exclude_pinned: false,
                folder_id: None,
                offset_date,
                offset_id: 0,
                offset_peer: tl::enums::InputPeer::Empty,
                limit: 100,
                hash: 0,
            };

            let (chats, messages, complete) = match self.invoke_with_retry(&request).await? {
                tl::enums::messages::Dialogs::Dialogs(d) => (d.chats, d.messages, true),
                tl::enums::messages::Dialogs::Slice(d) => (d.chats, d.messages, false),
                tl::enums::messages::Dialogs::NotModified(_) => return Ok(()),
            };

            self.remember_channels(&chats).await;
            if complete || self.channels.lock().await.contains_key(&wanted) {
                return Ok(());
            }

            let oldest = messages
                .iter()
                .filter_map(|m| match m {
                    tl::enums::Message::Message(m) => Some(m.date),
                    tl::enums::Message::Service(m) => Some(m.date),
                    tl::enums::Message::Empty(_) => None,
                })
                .min();
            match oldest {
                Some(date) if date != offset_date => offset_date = date,
                _ => return Ok(()),
            }
        }

        Ok(())
    }

    async fn get_message(
        &self,
        channel: tl::enums::InputChannel,
        message_id: i32,
    ) -> Result<tl::types::Message, TelegramError> {
        self.get_messages(channel, &[message_id])
            .await?
            .into_iter()
            .find(|m| m.id == message_id)
            .ok_or(TelegramError::MessageNotFound(message_id))
    }

    /// Reads several messages of a channel. Deleted or missing ids are left out.
    async fn get_messages(
        &self,
        channel: tl::enums::InputChannel,
        ids: &[i32],
    ) -> Result<Vec<tl::types::Message>, TelegramError> {
        let request = tl::functions::channels::GetMessages {
            channel,
            id: ids
                .iter()
                .map(|&id| tl::enums::InputMessage::Id(tl::types::InputMessageId { id }))
                .collect(),
        };

        let messages = match self.invoke_with_retry(&request).await? {
            tl::enums::messages::Messages::Messages(m) => m.messages,
            tl::enums::messages::Messages::Slice(m) => m.messages,
            tl::enums::messages::Messages::ChannelMessages(m) => m.messages,
            tl::enums::messages::Messages::NotModified(_) => Vec::new(),
        };

        Ok(messages
            .into_iter()
            .filter_map(|m| match m {
                tl::enums::Message::Message(m) => Some(m),
                _ => None,
            })
            .collect())
    }

    fn to_post(&self, message: tl::types::Message) -> FetchedPost<RemoteFile> {
        let media = message
            .media
            .as_ref()
            .and_then(|media| media_of(&self.client, media, message.id));

        FetchedPost {
            message_id: message.id,
            text: message.message,
            media,
            grouped_id: message.grouped_id,
        }
    }
}

impl PostFetcher for UserClient {
    type Media = RemoteFile;

    async fn fetch_post(&self, link: &PostLink) -> Result<FetchedPost<RemoteFile>, TelegramError> {
        let channel = self.resolve_channel(&link.chat).await?;
        let message = self.get_message(channel, link.message_id).await?;
        Ok(self.to_post(message))
    }

    async fn fetch_posts(&self, link: &PostLink, ids: &[i32]) -> Result<Vec<FetchedPost<RemoteFile>>, TelegramError> {
        let channel = self.resolve_channel(&link.chat).await?;
        let messages = self.get_messages(channel, ids).await?;
        Ok(messages.into_iter().map(|m| self.to_post(m)).collect())
    }
}

impl SessionClient for UserClient {
    async fn is_authorized(&self) -> bool {
        match self.check_authorized().await {
            Ok(authorized) => authorized,
            Err(e) => {
                warn!("Authorization check failed: {}", e);
                false
            }
        }
    }

    async fn disconnect(&self) {
        self.quit();
    }
}

impl std::fmt::Debug for UserClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserClient").finish_non_exhaustive()
    }
}

/// Opens user clients from session files.
#[derive(Debug, Clone)]
pub struct GrammersConnector {
    config: TelegramConfig,
}

impl GrammersConnector {
    #[must_use]
    pub fn new(config: TelegramConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &TelegramConfig {
        &self.config
    }

    #[must_use]
    pub fn session_path(&self, user_id: UserId) -> PathBuf {
        self.config.user_session_path(user_id)
    }

    /// Opens a client for a login in progress.
    pub async fn connect_for_login(&self, user_id: UserId) -> Result<UserClient, TelegramError> {
        UserClient::connect(&self.config, &self.session_path(user_id)).await
    }
}

impl SessionConnector for GrammersConnector {
    type Client = UserClient;
    type Error = TelegramError;

    fn has_saved_session(&self, user_id: UserId) -> bool {
        self.session_path(user_id).exists()
    }

    async fn connect(&self, user_id: UserId) -> Result<UserClient, TelegramError> {
        UserClient::connect(&self.config, &self.session_path(user_id)).await
    }
}

/// A downloadable file on Telegram's servers.
#[derive(Clone)]
pub struct RemoteFile {
    client: Client,
    location: tl::enums::InputFileLocation,
    dc_id: i32,
    size: u64,
}

impl RemoteFile {
    async fn get_file(&self, offset: u64, limit: usize) -> Result<Vec<u8>, TransferError> {
        let request = tl::functions::upload::GetFile {
            precise: true,
            cdn_supported: false,
            location: self.location.clone(),
            offset: offset as i64,
            limit: limit as i32,
        };

        match self.client.invoke_in_dc(self.dc_id, &request).await {
            Ok(tl::enums::upload::File::File(file)) => Ok(file.bytes),
            Ok(tl::enums::upload::File::CdnRedirect(_)) => {
                Err(TransferError::Request("CDN redirect is not supported".to_owned()))
            }
            Err(e) => Err(TransferError::Request(e.to_string())),
        }
    }
}

impl MediaSource for RemoteFile {
    fn size(&self) -> u64 {
        self.size
    }

    async fn fetch_chunk(&self, index: u64, chunk_size: usize) -> Result<Vec<u8>, TransferError> {
        self.get_file(index * chunk_size as u64, chunk_size).await
    }

    async fn download_to(&self, path: &Path) -> Result<u64, TransferError> {
        let mut file = tokio::fs::File::create(path).await?;
        let mut offset = 0_u64;

        loop {
            let bytes = self.get_file(offset, CHUNK_SIZE).await?;
            file.write_all(&bytes).await?;
            offset += bytes.len() as u64;

            let done = if self.size > 0 {
                offset >= self.size
            } else {
                bytes.len() < CHUNK_SIZE
            };
            if done || bytes.is_empty() {
                break;
            }
        }

        file.flush().await?;
        Ok(offset)
    }
}

impl std::fmt::Debug for RemoteFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteFile")
            .field("dc_id", &self.dc_id)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Extracts the downloadable part of a message's media.
fn media_of(client: &Client, media: &tl::enums::MessageMedia, message_id: i32) -> Option<PostMedia<RemoteFile>> {
    match media {
        tl::enums::MessageMedia::Document(doc) => {
            let Some(tl::enums::Document::Document(doc)) = &doc.document else {
                return None;
            };
            let file_name = doc
                .attributes
                .iter()
                .find_map(|attr| match attr {
                    tl::enums::DocumentAttribute::Filename(f) => Some(f.file_name.clone()),
                    _ => None,
                })
                .unwrap_or_else(|| default_name(message_id, &doc.mime_type));

            Some(PostMedia::Available {
                file_name,
                size: doc.size.max(0) as u64,
                source: RemoteFile {
                    client: client.clone(),
                    location: tl::enums::InputFileLocation::InputDocumentFileLocation(
                        tl::types::InputDocumentFileLocation {
                            id: doc.id,
                            access_hash: doc.access_hash,
                            file_reference: doc.file_reference.clone(),
                            thumb_size: String::new(),
                        },
                    ),
                    dc_id: doc.dc_id,
                    size: doc.size.max(0) as u64,
                },
            })
        }
        tl::enums::MessageMedia::Photo(photo) => {
            let Some(tl::enums::Photo::Photo(photo)) = &photo.photo else {
                return None;
            };
            let (thumb, size) = largest_photo_size(&photo.sizes)?;

            Some(PostMedia::Available {
                file_name: format!("photo_{message_id}.jpg"),
                size,
                source: RemoteFile {
                    client: client.clone(),
                    location: tl::enums::InputFileLocation::InputPhotoFileLocation(
                        tl::types::InputPhotoFileLocation {
                            id: photo.id,
                            access_hash: photo.access_hash,
                            file_reference: photo.file_reference.clone(),
                            thumb_size: thumb,
                        },
                    ),
                    dc_id: photo.dc_id,
                    size,
                },
            })
        }
        tl::enums::MessageMedia::PaidMedia(_) => Some(PostMedia::Paid),
        _ => None,
    }
}

fn largest_photo_size(sizes: &[tl::enums::PhotoSize]) -> Option<(String, u64)> {
    sizes
        .iter()
        .filter_map(|size| match size {
            tl::enums::PhotoSize::Size(s) => Some((s.r#type.clone(), s.size.max(0) as u64)),
            tl::enums::PhotoSize::Progressive(s) => s
                .sizes
                .iter()
                .max()
                .map(|&largest| (s.r#type.clone(), largest.max(0) as u64)),
            _ => None,
        })
        .max_by_key(|(_, size)| *size)
}

fn default_name(message_id: i32, mime_type: &str) -> String {
    let ext = match mime_type {
        "video/mp4" => "mp4",
        "video/quicktime" => "mov",
        "video/x-matroska" => "mkv",
        "audio/mpeg" => "mp3",
        "audio/ogg" => "ogg",
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "application/pdf" => "pdf",
        "application/zip" => "zip",
        _ => "bin",
    };
    format!("file_{message_id}.{ext}")
}

/// Masks a phone number for logging (shows last 4 digits).
pub(crate) fn mask_phone(phone: &str) -> String {
    let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
    if digits.len() > 4 {
        format!("***{}", &digits[digits.len() - 4..])
    } else {
        "****".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_phone() {
        assert_eq!(mask_phone("+1234567890"), "***7890");
        assert_eq!(mask_phone("123"), "****");
        assert_eq!(mask_phone("+7 (999) 123-45-67"), "***4567");
    }

    #[test]
    fn test_extract_flood_wait() {
        assert_eq!(extract_flood_wait_seconds("FLOOD_WAIT_120"), Some(120));
        assert_eq!(extract_flood_wait_seconds("flood wait 60 seconds"), Some(60));
        assert_eq!(extract_flood_wait_seconds("some other error"), None);
    }

    #[test]
    fn test_default_name() {
        assert_eq!(default_name(7, "video/mp4"), "file_7.mp4");
        assert_eq!(default_name(7, "application/x-unknown"), "file_7.bin");
    }

    #[test]
    fn test_largest_photo_size() {
        let sizes = vec![
            tl::enums::PhotoSize::Size(tl::types::PhotoSize {
                r#type: "m".to_owned(),
                w: 320,
                h: 320,
                size: 2_000,
            }),
            tl::enums::PhotoSize::Progressive(tl::types::PhotoSizeProgressive {
                r#type: "y".to_owned(),
                w: 1280,
                h: 1280,
                sizes: vec![10_000, 40_000, 90_000],
            }),
        ];
        assert_eq!(largest_photo_size(&sizes), Some(("y".to_owned(), 90_000)));
        assert_eq!(largest_photo_size(&[]), None);
    }
}
