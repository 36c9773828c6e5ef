//! Job bodies for single-post and batch downloads.
//!
//! A job fetches the post through the user's own session, downloads its
//! media into the user's folder, uploads it back through the bot and always
//! removes the local copy afterwards, including when the job is dropped
//! mid-transfer. Albums are delivered file by file and charged per file.

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::config::UserStore;
use crate::queue::UserId;
use crate::telegram::{PostLink, RateLimiter, TelegramError};
use crate::transfer::files::{cleanup_download, download_path, is_video_file, readable_size, size_limit};
use crate::transfer::{MediaSource, TransferEngine, TransferError};

/// Most posts a single batch may cover.
pub const MAX_BATCH_POSTS: i32 = 20;

/// Pause between posts of a batch.
pub const BATCH_PACING: Duration = Duration::from_secs(3);

/// Album members are looked up this many ids around the requested post.
pub const ALBUM_SCAN_RADIUS: i32 = 10;

/// Telegram caption limit.
const CAPTION_LIMIT: usize = 1024;

/// Downloadable part of a post.
#[derive(Debug)]
pub enum PostMedia<M> {
    Available { source: M, file_name: String, size: u64 },
    /// Paid media that cannot be fetched.
    Paid,
}

/// A post read through the user's session.
#[derive(Debug)]
pub struct FetchedPost<M> {
    pub message_id: i32,
    pub text: String,
    pub media: Option<PostMedia<M>>,
    /// Shared by every post of one album.
    pub grouped_id: Option<i64>,
}

impl<M> FetchedPost<M> {
    fn has_available_media(&self) -> bool {
        matches!(self.media, Some(PostMedia::Available { .. }))
    }
}

/// Reads posts with a user's account.
pub trait PostFetcher: Send + Sync + 'static {
    type Media: MediaSource + 'static;

    fn fetch_post(
        &self,
        link: &PostLink,
    ) -> impl Future<Output = Result<FetchedPost<Self::Media>, TelegramError>> + Send;

    /// Reads several posts of the link's chat. Missing ids are skipped.
    fn fetch_posts(
        &self,
        link: &PostLink,
        ids: &[i32],
    ) -> impl Future<Output = Result<Vec<FetchedPost<Self::Media>>, TelegramError>> + Send;
}

/// Sends results back to the chat that requested them.
pub trait ReplyChannel: Clone + Send + Sync + 'static {
    fn send_text(&self, text: &str) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Uploads a file, with a custom thumbnail when one is given.
    fn send_file(
        &self,
        path: &Path,
        caption: &str,
        thumbnail: Option<&Path>,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn send_photo(&self, path: &Path, caption: &str) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Saves the photo the request replied to into `path`.
    ///
    /// Returns `false` when the request is not a reply to a photo.
    fn save_replied_photo(&self, path: &Path) -> impl Future<Output = anyhow::Result<bool>> + Send;
}

/// What happened to one post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOutcome {
    /// Media was downloaded and uploaded. Albums report every file sent.
    Delivered { files: u32 },
    /// The post had only text, which was echoed back.
    TextOnly,
    /// Nothing to send.
    Empty,
    /// Part of an album already handled by this job.
    AlbumPart,
    Paid,
    TooLarge,
    /// The album has more files than the user may still download today.
    OverQuota,
}

impl PostOutcome {
    /// Downloads charged against the daily quota.
    #[must_use]
    pub const fn charged(self) -> u32 {
        match self {
            Self::Delivered { files } => files,
            Self::TextOnly => 1,
            _ => 0,
        }
    }
}

/// Tally of a batch job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl BatchSummary {
    #[must_use]
    pub fn message(&self) -> String {
        format!(
            "📦 Batch finished\n\n✅ Downloaded: {}\n⏭ Skipped: {}\n❌ Failed: {}",
            self.downloaded, self.skipped, self.failed
        )
    }
}

/// Removes a download and its partial siblings when dropped.
struct DownloadGuard(PathBuf);

impl Drop for DownloadGuard {
    fn drop(&mut self) {
        cleanup_download(&self.0);
    }
}

/// Everything a job needs, owned so the job can run as a `'static` task.
pub struct PostJob<F, R> {
    fetcher: Arc<F>,
    reply: R,
    engine: TransferEngine,
    users: Arc<UserStore>,
    downloads_dir: PathBuf,
    user_id: UserId,
    premium: bool,
    pacing: Duration,
    thumbnail: Option<PathBuf>,
}

impl<F: PostFetcher, R: ReplyChannel> PostJob<F, R> {
    #[must_use]
    pub fn new(
        fetcher: Arc<F>,
        reply: R,
        engine: TransferEngine,
        users: Arc<UserStore>,
        downloads_dir: PathBuf,
        user_id: UserId,
        premium: bool,
    ) -> Self {
        Self {
            fetcher,
            reply,
            engine,
            users,
            downloads_dir,
            user_id,
            premium,
            pacing: BATCH_PACING,
            thumbnail: None,
        }
    }

    #[must_use]
    pub const fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    /// Custom thumbnail attached to uploaded videos.
    #[must_use]
    pub fn with_thumbnail(mut self, thumbnail: Option<PathBuf>) -> Self {
        self.thumbnail = thumbnail;
        self
    }

    /// Downloads a single post, or the whole album it belongs to.
    pub async fn run_single(self, link: PostLink) -> anyhow::Result<()> {
        match self.deliver(&link, &mut HashSet::new()).await {
            Ok(outcome) => {
                self.users.record_usage(self.user_id, outcome.charged()).await;
                Ok(())
            }
            Err(e) => {
                warn!("Download of {} for user {} failed: {:#}", link, self.user_id, e);
                self.notify(&format!("❌ Download failed: {e:#}")).await;
                Err(e)
            }
        }
    }

    /// Downloads posts `start.message_id..=end_id` of one chat.
    pub async fn run_batch(self, start: PostLink, end_id: i32) -> anyhow::Result<BatchSummary> {
        let limiter = RateLimiter::new(self.pacing);
        let mut summary = BatchSummary::default();
        let mut albums = HashSet::new();

        for message_id in start.message_id..=end_id {
            if self.users.remaining(self.user_id).await == Some(0) {
                self.notify("⚠️ Daily limit reached, stopping the batch.").await;
                break;
            }

            limiter.wait_and_acquire().await;
            let link = start.with_message(message_id);

            let mut result = self.deliver(&link, &mut albums).await;
            if let Some(seconds) = flood_wait_of(&result) {
                limiter.handle_flood_wait(seconds).await;
                result = self.deliver(&link, &mut albums).await;
            }

            match result {
                Ok(PostOutcome::AlbumPart) => {}
                Ok(outcome) if outcome.charged() > 0 => {
                    self.users.record_usage(self.user_id, outcome.charged()).await;
                    summary.downloaded += outcome.charged() as usize;
                }
                Ok(_) => summary.skipped += 1,
                Err(e) => {
                    debug!("Batch item {} failed: {:#}", link, e);
                    summary.failed += 1;
                }
            }
        }

        info!(
            "Batch for user {} done: {} downloaded, {} skipped, {} failed",
            self.user_id, summary.downloaded, summary.skipped, summary.failed
        );
        self.notify(&summary.message()).await;
        Ok(summary)
    }

    /// Fetches one post and sends whatever it carries.
    ///
    /// `albums` holds the groups already handled, so a batch sends each
    /// album once.
    async fn deliver(&self, link: &PostLink, albums: &mut HashSet<i64>) -> anyhow::Result<PostOutcome> {
        let post = self
            .fetcher
            .fetch_post(link)
            .await
            .with_context(|| format!("could not read {link}"))?;

        let album = post.grouped_id.filter(|_| post.has_available_media());
        if let Some(group) = album {
            if !albums.insert(group) {
                return Ok(PostOutcome::AlbumPart);
            }
            return self.deliver_album(link, group).await;
        }

        let Some(media) = post.media else {
            if post.text.trim().is_empty() {
                debug!("Post {} has nothing to send", link);
                return Ok(PostOutcome::Empty);
            }
            self.reply.send_text(&post.text).await?;
            return Ok(PostOutcome::TextOnly);
        };

        self.deliver_media(link, media, &post.text).await
    }

    async fn deliver_album(&self, link: &PostLink, group: i64) -> anyhow::Result<PostOutcome> {
        let center = link.message_id;
        let ids: Vec<i32> = (center - ALBUM_SCAN_RADIUS..=center + ALBUM_SCAN_RADIUS)
            .filter(|id| *id > 0)
            .collect();

        let mut members: Vec<_> = self
            .fetcher
            .fetch_posts(link, &ids)
            .await
            .with_context(|| format!("could not read the album of {link}"))?
            .into_iter()
            .filter(|post| post.grouped_id == Some(group) && post.has_available_media())
            .collect();
        members.sort_by_key(|post| post.message_id);

        let count = u32::try_from(members.len()).unwrap_or(u32::MAX);
        info!("Album {} of {} has {} files for user {}", group, link, count, self.user_id);

        match self.users.remaining(self.user_id).await {
            Some(remaining) if remaining < count => {
                self.notify(&format!(
                    "⚠️ This album has {count} files but you can only download {remaining} more today."
                ))
                .await;
                return Ok(PostOutcome::OverQuota);
            }
            _ => {}
        }

        let caption = members
            .iter()
            .map(|post| post.text.as_str())
            .find(|text| !text.trim().is_empty())
            .unwrap_or_default()
            .to_owned();

        let mut sent = 0;
        for member in members {
            let member_link = link.with_message(member.message_id);
            let Some(media) = member.media else {
                continue;
            };
            // The caption goes on the first file that makes it through.
            let text = if sent == 0 { caption.as_str() } else { "" };
            match self.deliver_media(&member_link, media, text).await {
                Ok(PostOutcome::Delivered { files }) => sent += files,
                Ok(_) => {}
                Err(e) => warn!("Album item {} failed: {:#}", member_link, e),
            }
        }

        if sent == 0 {
            self.notify("❌ Could not extract any valid media from the album.").await;
            return Ok(PostOutcome::Empty);
        }
        Ok(PostOutcome::Delivered { files: sent })
    }

    async fn deliver_media(
        &self,
        link: &PostLink,
        media: PostMedia<F::Media>,
        text: &str,
    ) -> anyhow::Result<PostOutcome> {
        let (source, file_name, size) = match media {
            PostMedia::Available {
                source,
                file_name,
                size,
            } => (source, file_name, size),
            PostMedia::Paid => {
                self.notify(&format!("💰 {link} contains paid media and cannot be downloaded."))
                    .await;
                return Ok(PostOutcome::Paid);
            }
        };

        let limit = size_limit(self.premium);
        if size > limit {
            self.notify(&format!(
                "📏 {link} is {} which exceeds the {} limit.",
                readable_size(size),
                readable_size(limit)
            ))
            .await;
            return Ok(PostOutcome::TooLarge);
        }

        let path = download_path(&self.downloads_dir, self.user_id, &file_name)
            .context("could not prepare the download folder")?;
        let guard = DownloadGuard(path);

        self.transfer(&source, &guard.0, size, text).await?;
        Ok(PostOutcome::Delivered { files: 1 })
    }

    async fn transfer(&self, source: &F::Media, path: &Path, size: u64, text: &str) -> anyhow::Result<()> {
        match self.engine.download(source, path).await {
            Ok(written) => debug!("Downloaded {} to {}", readable_size(written), path.display()),
            Err(TransferError::PaidMedia) => anyhow::bail!("paid media cannot be downloaded"),
            Err(e) => return Err(e).context("download failed"),
        }

        let caption = caption_of(text);
        let thumbnail = self.thumbnail.as_deref().filter(|_| is_video_file(path));
        self.engine
            .upload(size, self.reply.send_file(path, &caption, thumbnail))
            .await
            .context("upload failed")
    }

    async fn notify(&self, text: &str) {
        if let Err(e) = self.reply.send_text(text).await {
            warn!("Failed to message user {}: {:#}", self.user_id, e);
        }
    }
}

fn flood_wait_of(result: &anyhow::Result<PostOutcome>) -> Option<u32> {
    match result {
        Err(e) => e.chain().find_map(|cause| match cause.downcast_ref::<TelegramError>() {
            Some(TelegramError::FloodWait(seconds)) => Some(*seconds),
            _ => None,
        }),
        Ok(_) => None,
    }
}

/// Truncates post text to the caption limit on a char boundary.
fn caption_of(text: &str) -> String {
    if text.chars().count() <= CAPTION_LIMIT {
        return text.to_owned();
    }
    let mut caption: String = text.chars().take(CAPTION_LIMIT - 3).collect();
    caption.push_str("...");
    caption
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::config::UserDirectory;
    use crate::telegram::ChatRef;
    use crate::transfer::parallel::tests::FakeMedia;
    use crate::transfer::{BudgetLimits, ConnectionBudget};

    #[derive(Debug, Clone)]
    pub enum FakePost {
        Text(&'static str),
        Media { len: usize, claimed_size: u64 },
        Video { len: usize },
        Album { group: i64, len: usize, text: &'static str },
        Paid,
        Missing,
        Flood,
    }

    pub struct FakeFetcher {
        pub posts: HashMap<i32, FakePost>,
        pub floods_left: AtomicUsize,
    }

    impl FakeFetcher {
        pub fn new(posts: impl IntoIterator<Item = (i32, FakePost)>) -> Self {
            Self {
                posts: posts.into_iter().collect(),
                floods_left: AtomicUsize::new(1),
            }
        }
    }

    impl FakeFetcher {
        fn post(&self, id: i32) -> Result<FetchedPost<FakeMedia>, TelegramError> {
            let text_post = |text: &str| FetchedPost {
                message_id: id,
                text: text.to_owned(),
                media: None,
                grouped_id: None,
            };
            let available = |len: usize, file_name: String, size: u64| {
                Some(PostMedia::Available {
                    source: FakeMedia::new(len),
                    file_name,
                    size,
                })
            };

            let (media, text, grouped_id) = match self.posts.get(&id).cloned().unwrap_or(FakePost::Missing) {
                FakePost::Text(text) => return Ok(text_post(text)),
                FakePost::Media { len, claimed_size } => {
                    (available(len, format!("file_{id}.bin"), claimed_size), "", None)
                }
                FakePost::Video { len } => (available(len, format!("clip_{id}.mp4"), len as u64), "", None),
                FakePost::Album { group, len, text } => {
                    (available(len, format!("file_{id}.bin"), len as u64), text, Some(group))
                }
                FakePost::Paid => (Some(PostMedia::Paid), "", None),
                FakePost::Missing => return Err(TelegramError::MessageNotFound(id)),
                FakePost::Flood => {
                    if self.floods_left.fetch_sub(1, Ordering::SeqCst) > 0 {
                        return Err(TelegramError::FloodWait(5));
                    }
                    return Ok(text_post("after flood"));
                }
            };
            Ok(FetchedPost {
                message_id: id,
                text: text.to_owned(),
                media,
                grouped_id,
            })
        }
    }

    impl PostFetcher for FakeFetcher {
        type Media = FakeMedia;

        async fn fetch_post(&self, link: &PostLink) -> Result<FetchedPost<FakeMedia>, TelegramError> {
            self.post(link.message_id)
        }

        async fn fetch_posts(&self, _link: &PostLink, ids: &[i32]) -> Result<Vec<FetchedPost<FakeMedia>>, TelegramError> {
            Ok(ids.iter().filter_map(|&id| self.post(id).ok()).collect())
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Sent {
        Text(String),
        File { name: String, bytes: usize },
        Photo { caption: String },
    }

    #[derive(Clone, Default)]
    pub struct FakeReply {
        pub sent: Arc<Mutex<Vec<Sent>>>,
        /// File name and thumbnail of every upload that carried one.
        pub thumbnails: Arc<Mutex<Vec<(String, PathBuf)>>>,
        pub captions: Arc<Mutex<Vec<String>>>,
        /// Photo the request replies to, if any.
        pub replied_photo: Arc<Mutex<Option<Vec<u8>>>>,
    }

    impl FakeReply {
        pub fn sent(&self) -> Vec<Sent> {
            self.sent.lock().unwrap().clone()
        }

        pub fn replying_to_photo(bytes: &[u8]) -> Self {
            let reply = Self::default();
            *reply.replied_photo.lock().unwrap() = Some(bytes.to_vec());
            reply
        }
    }

    impl ReplyChannel for FakeReply {
        async fn send_text(&self, text: &str) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push(Sent::Text(text.to_owned()));
            Ok(())
        }

        async fn send_file(&self, path: &Path, caption: &str, thumbnail: Option<&Path>) -> anyhow::Result<()> {
            let bytes = tokio::fs::read(path).await?.len();
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            if let Some(thumbnail) = thumbnail {
                self.thumbnails
                    .lock()
                    .unwrap()
                    .push((name.clone(), thumbnail.to_path_buf()));
            }
            self.captions.lock().unwrap().push(caption.to_owned());
            self.sent.lock().unwrap().push(Sent::File { name, bytes });
            Ok(())
        }

        async fn send_photo(&self, path: &Path, caption: &str) -> anyhow::Result<()> {
            tokio::fs::metadata(path).await?;
            self.sent.lock().unwrap().push(Sent::Photo {
                caption: caption.to_owned(),
            });
            Ok(())
        }

        async fn save_replied_photo(&self, path: &Path) -> anyhow::Result<bool> {
            let photo = self.replied_photo.lock().unwrap().clone();
            match photo {
                Some(bytes) => {
                    tokio::fs::write(path, bytes).await?;
                    Ok(true)
                }
                None => Ok(false),
            }
        }
    }

    fn engine() -> TransferEngine {
        TransferEngine::new(Arc::new(ConnectionBudget::new(BudgetLimits::default())))
    }

    fn job(
        dir: &Path,
        fetcher: FakeFetcher,
        reply: &FakeReply,
        daily_limit: u32,
    ) -> (PostJob<FakeFetcher, FakeReply>, Arc<UserStore>) {
        let users = Arc::new(UserStore::new(
            dir.join("users.json"),
            daily_limit,
            UserDirectory::default(),
        ));
        let job = PostJob::new(
            Arc::new(fetcher),
            reply.clone(),
            engine(),
            Arc::clone(&users),
            dir.join("downloads"),
            7,
            false,
        )
        .with_pacing(Duration::from_millis(10));
        (job, users)
    }

    fn link(id: i32) -> PostLink {
        PostLink {
            chat: ChatRef::Username("chan".to_owned()),
            message_id: id,
            thread_id: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_delivers_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let reply = FakeReply::default();
        let fetcher = FakeFetcher::new([(
            1,
            FakePost::Media {
                len: 3000,
                claimed_size: 3000,
            },
        )]);
        let (job, users) = job(dir.path(), fetcher, &reply, 5);

        job.run_single(link(1)).await.unwrap();

        assert_eq!(
            reply.sent(),
            vec![Sent::File {
                name: "file_1.bin".to_owned(),
                bytes: 3000
            }]
        );
        assert!(!dir.path().join("downloads/7/file_1.bin").exists());
        assert_eq!(users.remaining(7).await, Some(4));
    }

    #[tokio::test]
    async fn test_text_only_post_is_echoed() {
        let dir = tempfile::tempdir().unwrap();
        let reply = FakeReply::default();
        let (job, _) = job(dir.path(), FakeFetcher::new([(2, FakePost::Text("hello"))]), &reply, 5);

        job.run_single(link(2)).await.unwrap();
        assert_eq!(reply.sent(), vec![Sent::Text("hello".to_owned())]);
    }

    #[tokio::test]
    async fn test_oversized_media_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let reply = FakeReply::default();
        let fetcher = FakeFetcher::new([(
            3,
            FakePost::Media {
                len: 10,
                claimed_size: 3 * 1024 * 1024 * 1024,
            },
        )]);
        let (job, users) = job(dir.path(), fetcher, &reply, 5);

        job.run_single(link(3)).await.unwrap();

        let sent = reply.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], Sent::Text(t) if t.contains("exceeds")));
        assert_eq!(users.remaining(7).await, Some(5));
    }

    #[tokio::test]
    async fn test_missing_post_fails_and_tells_user() {
        let dir = tempfile::tempdir().unwrap();
        let reply = FakeReply::default();
        let (job, users) = job(dir.path(), FakeFetcher::new([]), &reply, 5);

        assert!(job.run_single(link(9)).await.is_err());
        assert!(matches!(&reply.sent()[0], Sent::Text(t) if t.starts_with("❌")));
        assert_eq!(users.remaining(7).await, Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_counts_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let reply = FakeReply::default();
        let fetcher = FakeFetcher::new([
            (10, FakePost::Media { len: 100, claimed_size: 100 }),
            (11, FakePost::Paid),
            (12, FakePost::Text("caption only")),
            (14, FakePost::Flood),
        ]);
        let (job, _) = job(dir.path(), fetcher, &reply, 50);

        let summary = job.run_batch(link(10), 14).await.unwrap();

        assert_eq!(
            summary,
            BatchSummary {
                downloaded: 3,
                skipped: 1,
                failed: 1,
            }
        );
        let sent = reply.sent();
        assert!(matches!(sent.last(), Some(Sent::Text(t)) if t.contains("Batch finished")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_stops_at_quota() {
        let dir = tempfile::tempdir().unwrap();
        let reply = FakeReply::default();
        let fetcher = FakeFetcher::new((20..25).map(|id| (id, FakePost::Text("t"))));
        let (job, users) = job(dir.path(), fetcher, &reply, 2);

        let summary = job.run_batch(link(20), 24).await.unwrap();

        assert_eq!(summary.downloaded, 2);
        assert_eq!(users.remaining(7).await, Some(0));
        assert!(reply.sent().iter().any(|s| matches!(s, Sent::Text(t) if t.contains("Daily limit"))));
    }

    fn file(name: &str, bytes: usize) -> Sent {
        Sent::File {
            name: name.to_owned(),
            bytes,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_album_sends_every_file_and_charges_each() {
        let dir = tempfile::tempdir().unwrap();
        let reply = FakeReply::default();
        let fetcher = FakeFetcher::new([
            (29, FakePost::Text("before")),
            (30, FakePost::Album { group: 77, len: 10, text: "" }),
            (31, FakePost::Album { group: 77, len: 20, text: "album caption" }),
            (32, FakePost::Album { group: 77, len: 30, text: "" }),
            (33, FakePost::Album { group: 88, len: 40, text: "" }),
        ]);
        let (job, users) = job(dir.path(), fetcher, &reply, 5);

        job.run_single(link(31)).await.unwrap();

        assert_eq!(
            reply.sent(),
            vec![file("file_30.bin", 10), file("file_31.bin", 20), file("file_32.bin", 30)]
        );
        assert_eq!(*reply.captions.lock().unwrap(), vec!["album caption", "", ""]);
        assert_eq!(users.remaining(7).await, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_album_larger_than_quota_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let reply = FakeReply::default();
        let fetcher = FakeFetcher::new((40..43).map(|id| (id, FakePost::Album { group: 5, len: 10, text: "" })));
        let (job, users) = job(dir.path(), fetcher, &reply, 2);

        job.run_single(link(40)).await.unwrap();

        let sent = reply.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], Sent::Text(t) if t.contains("3 files") && t.contains("2 more")));
        assert_eq!(users.remaining(7).await, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_sends_album_once() {
        let dir = tempfile::tempdir().unwrap();
        let reply = FakeReply::default();
        let fetcher = FakeFetcher::new([
            (50, FakePost::Album { group: 9, len: 10, text: "" }),
            (51, FakePost::Album { group: 9, len: 10, text: "" }),
            (52, FakePost::Album { group: 9, len: 10, text: "" }),
            (53, FakePost::Text("after")),
        ]);
        let (job, users) = job(dir.path(), fetcher, &reply, 50);

        let summary = job.run_batch(link(50), 53).await.unwrap();

        assert_eq!(
            summary,
            BatchSummary {
                downloaded: 4,
                skipped: 0,
                failed: 0,
            }
        );
        let files = reply.sent().iter().filter(|s| matches!(s, Sent::File { .. })).count();
        assert_eq!(files, 3);
        assert_eq!(users.remaining(7).await, Some(46));
    }

    #[tokio::test(start_paused = true)]
    async fn test_thumbnail_only_on_videos() {
        let dir = tempfile::tempdir().unwrap();
        let reply = FakeReply::default();
        let thumb = dir.path().join("thumb.jpg");
        let fetcher = FakeFetcher::new([
            (60, FakePost::Video { len: 100 }),
            (61, FakePost::Media { len: 100, claimed_size: 100 }),
        ]);
        let (job, _) = job(dir.path(), fetcher, &reply, 50);

        job.with_thumbnail(Some(thumb.clone()))
            .run_batch(link(60), 61)
            .await
            .unwrap();

        assert_eq!(
            *reply.thumbnails.lock().unwrap(),
            vec![("clip_60.mp4".to_owned(), thumb)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_job_removes_partial_download() {
        let dir = tempfile::tempdir().unwrap();
        let reply = FakeReply::default();
        let len = crate::transfer::parallel::CHUNK_SIZE * 4;
        let fetcher = FakeFetcher::new([(
            70,
            FakePost::Media {
                len,
                claimed_size: len as u64,
            },
        )]);
        let (job, users) = job(dir.path(), fetcher, &reply, 5);
        let partial = dir.path().join("downloads/7/file_70.bin");

        let mut run = Box::pin(job.run_single(link(70)));
        // Every chunk takes longer than this to arrive.
        let timed_out = tokio::time::timeout(Duration::from_millis(20), &mut run).await;
        assert!(timed_out.is_err());
        assert!(partial.exists());

        drop(run);
        assert!(!partial.exists());
        assert!(!dir.path().join("downloads/7").exists());
        assert!(reply.sent().is_empty());
        assert_eq!(users.remaining(7).await, Some(5));
    }

    #[test]
    fn test_caption_truncation() {
        assert_eq!(caption_of("short"), "short");
        let long = "é".repeat(2000);
        let caption = caption_of(&long);
        assert_eq!(caption.chars().count(), CAPTION_LIMIT);
        assert!(caption.ends_with("..."));
    }
}
