//! Command handler implementation.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::types::{BotCommand, CommandResult};
use crate::config::UserStore;
use crate::memory::{MemoryMonitor, system_memory};
use crate::pipeline::{MAX_BATCH_POSTS, PostFetcher, PostJob, ReplyChannel};
use crate::queue::{
    Admission, AdmissionError, Cancellation, DownloadQueue, JobOutcome, JobReport, JobRequest,
    Priority, UserId, UserQueueStatus,
};
use crate::session::{SessionConnector, SessionError, SessionManager};
use crate::telegram::{LoginBackend, LoginError, LoginStep, PostLink};
use crate::transfer::TransferEngine;
use crate::transfer::files::{readable_size, readable_time, size_limit};

/// Everything the handler needs from the rest of the bot.
pub struct HandlerDeps<K: SessionConnector, L> {
    pub queue: Arc<DownloadQueue>,
    pub sessions: Arc<SessionManager<K>>,
    pub login: Arc<L>,
    pub engine: TransferEngine,
    pub users: Arc<UserStore>,
    pub memory: Arc<Mutex<MemoryMonitor>>,
    pub downloads_dir: PathBuf,
    pub thumbnails_dir: PathBuf,
}

/// Handles bot commands and turns them into queue jobs and replies.
pub struct CommandHandler<K: SessionConnector, L, R> {
    queue: Arc<DownloadQueue>,
    sessions: Arc<SessionManager<K>>,
    login: Arc<L>,
    engine: TransferEngine,
    users: Arc<UserStore>,
    memory: Arc<Mutex<MemoryMonitor>>,
    downloads_dir: PathBuf,
    thumbnails_dir: PathBuf,

    /// Chats to notify when a job ends on its own (timeout).
    replies: Mutex<HashMap<UserId, R>>,

    started_at: Instant,
}

impl<K, L, R> CommandHandler<K, L, R>
where
    K: SessionConnector + 'static,
    K::Client: PostFetcher,
    L: LoginBackend,
    R: ReplyChannel,
{
    /// Creates a new command handler.
    #[must_use]
    pub fn new(deps: HandlerDeps<K, L>) -> Self {
        Self {
            queue: deps.queue,
            sessions: deps.sessions,
            login: deps.login,
            engine: deps.engine,
            users: deps.users,
            memory: deps.memory,
            downloads_dir: deps.downloads_dir,
            thumbnails_dir: deps.thumbnails_dir,
            replies: Mutex::new(HashMap::new()),
            started_at: Instant::now(),
        }
    }

    /// Tries to parse and execute a command from a message.
    ///
    /// Returns `None` if the message is not a command.
    pub async fn try_handle(&self, user_id: UserId, message_text: &str, reply: &R) -> Option<CommandResult> {
        let command = BotCommand::parse(message_text)?;

        debug!("Handling command from {}: {}", user_id, command);
        let result = self.execute(user_id, command, reply).await;
        info!(
            "Command result for {}: success={}, trigger_promotion={}",
            user_id, result.success, result.trigger_promotion
        );

        Some(result)
    }

    /// Executes a parsed command.
    async fn execute(&self, user_id: UserId, command: BotCommand, reply: &R) -> CommandResult {
        match command {
            BotCommand::Start | BotCommand::Help => handle_help(),
            BotCommand::Login(phone) => self.handle_login(user_id, &phone).await,
            BotCommand::Verify(code) => self.handle_verify(user_id, &code).await,
            BotCommand::Password(password) => self.handle_password(user_id, &password).await,
            BotCommand::Cancel => self.handle_cancel(user_id).await,
            BotCommand::Logout => self.handle_logout(user_id).await,
            BotCommand::Download(link) => self.handle_download(user_id, link, reply).await,
            BotCommand::Batch { start, end } => self.handle_batch(user_id, start, &end, reply).await,
            BotCommand::CancelDownload => self.handle_cancel_download(user_id).await,
            BotCommand::Queue => self.handle_queue(user_id).await,
            BotCommand::QueueStatus => self.handle_queue_status().await,
            BotCommand::Stats => self.handle_stats().await,
            BotCommand::MyInfo => self.handle_myinfo(user_id).await,
            BotCommand::SetThumb => self.handle_set_thumb(user_id, reply).await,
            BotCommand::DelThumb => self.handle_del_thumb(user_id).await,
            BotCommand::ViewThumb => self.handle_view_thumb(user_id, reply).await,
            BotCommand::Usage(usage) => CommandResult::error(format!("Usage: {usage}")),
        }
    }

    async fn handle_login(&self, user_id: UserId, phone: &str) -> CommandResult {
        let digits = phone.chars().filter(char::is_ascii_digit).count();
        if digits < 7 {
            return CommandResult::error("Send your phone number in international format, e.g. /login +15550100");
        }
        if self.queue.is_active(user_id).await {
            return CommandResult::error("Wait for your download to finish before logging in again.");
        }

        match self.login.request_code(user_id, phone).await {
            Ok(_) => CommandResult::success(
                "📨 Code sent to your Telegram app.\n\
                 Send it with spaces between the digits, e.g. /verify 1 2 3 4 5",
            ),
            Err(e) => login_error(&e),
        }
    }

    async fn handle_verify(&self, user_id: UserId, code: &str) -> CommandResult {
        match self.login.submit_code(user_id, code).await {
            Ok(step) => login_step(step),
            Err(e) => login_error(&e),
        }
    }

    async fn handle_password(&self, user_id: UserId, password: &str) -> CommandResult {
        match self.login.submit_password(user_id, password).await {
            Ok(step) => login_step(step),
            Err(e) => login_error(&e),
        }
    }

    async fn handle_cancel(&self, user_id: UserId) -> CommandResult {
        if self.login.cancel(user_id).await {
            CommandResult::success("✓ Login cancelled.")
        } else {
            CommandResult::error("No login in progress.")
        }
    }

    async fn handle_logout(&self, user_id: UserId) -> CommandResult {
        if self.queue.is_active(user_id).await {
            return CommandResult::error("Cancel your download with /canceldownload before logging out.");
        }
        let _ = self.queue.cancel_user(user_id).await;
        self.sessions.remove(user_id).await;

        match self.login.logout(user_id).await {
            Ok(true) => CommandResult::success("✓ Logged out and session deleted."),
            Ok(false) => CommandResult::error("You are not logged in."),
            Err(e) => login_error(&e),
        }
    }

    async fn handle_download(&self, user_id: UserId, link: PostLink, reply: &R) -> CommandResult {
        let premium = match self.prepare(user_id).await {
            Ok(premium) => premium,
            Err(result) => return result,
        };

        let source_ref = link.to_string();
        let work = self.job(user_id, premium, reply, move |job| job.run_single(link));
        let request = JobRequest::new(user_id, Priority::from_premium(premium), source_ref, work);
        self.submit(request, reply).await
    }

    async fn handle_batch(&self, user_id: UserId, start: PostLink, end: &PostLink, reply: &R) -> CommandResult {
        if let Err(reason) = validate_batch(&start, end) {
            return CommandResult::error(reason);
        }

        let premium = match self.prepare(user_id).await {
            Ok(premium) => premium,
            Err(result) => return result,
        };

        let end_id = end.message_id;
        let source_ref = format!("{start} … {end_id}");
        let work = self.job(user_id, premium, reply, move |job| async move {
            job.run_batch(start, end_id).await.map(|_| ())
        });
        let request = JobRequest::new(user_id, Priority::from_premium(premium), source_ref, work);
        self.submit(request, reply).await
    }

    /// Checks the quota and that the user's session can be opened.
    ///
    /// Returns whether the user is premium.
    async fn prepare(&self, user_id: UserId) -> Result<bool, CommandResult> {
        if self.users.remaining(user_id).await == Some(0) {
            return Err(CommandResult::error(format!(
                "⚠️ You have used all {} downloads for today. Come back tomorrow.",
                self.users.free_daily_limit()
            )));
        }

        self.sessions
            .get_or_create(user_id, self.queue.as_ref())
            .await
            .map_err(|e| session_error(&e))?;

        Ok(self.users.tier(user_id).await.is_premium())
    }

    /// Wraps a job body so it takes the user's session when it starts.
    ///
    /// The client and the custom thumbnail are looked up once the job owns
    /// a slot, never at enqueue time.
    fn job<B, Fut>(&self, user_id: UserId, premium: bool, reply: &R, body: B) -> BoxFuture<'static, anyhow::Result<()>>
    where
        B: FnOnce(PostJob<K::Client, R>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let sessions = Arc::clone(&self.sessions);
        let queue = Arc::clone(&self.queue);
        let reply = reply.clone();
        let engine = self.engine.clone();
        let users = Arc::clone(&self.users);
        let downloads_dir = self.downloads_dir.clone();

        Box::pin(async move {
            let client = match sessions.get_or_create(user_id, queue.as_ref()).await {
                Ok(client) => client,
                Err(e) => {
                    if let Err(send_err) = reply.send_text(&session_error(&e).message).await {
                        warn!("Failed to notify user {}: {:#}", user_id, send_err);
                    }
                    return Err(e.into());
                }
            };

            let thumbnail = users.thumbnail(user_id).await.filter(|path| path.is_file());
            let job = PostJob::new(client, reply, engine, users, downloads_dir, user_id, premium)
                .with_thumbnail(thumbnail);
            body(job).await
        })
    }

    async fn submit(&self, request: JobRequest, reply: &R) -> CommandResult {
        let user_id = request.user_id;
        match self.queue.enqueue(request).await {
            Ok(admission) => {
                self.replies.lock().await.insert(user_id, reply.clone());
                match admission {
                    Admission::Started => CommandResult::success("⬇️ Download started."),
                    Admission::Queued { position, waiting } => CommandResult::success(format!(
                        "📋 Added to the queue at position {position} of {waiting}."
                    )),
                }
            }
            Err(e) => admission_error(&e),
        }
    }

    async fn handle_cancel_download(&self, user_id: UserId) -> CommandResult {
        let cancellation = self.queue.cancel_user(user_id).await;
        if cancellation != Cancellation::NotFound {
            self.replies.lock().await.remove(&user_id);
        }

        match cancellation {
            Cancellation::Active => CommandResult::success_with_promotion("🛑 Download cancelled."),
            Cancellation::Queued => CommandResult::success("🛑 Removed from the queue."),
            Cancellation::NotFound => CommandResult::error("You have no download running or queued."),
        }
    }

    async fn handle_queue(&self, user_id: UserId) -> CommandResult {
        match self.queue.user_status(user_id).await {
            UserQueueStatus::Active => {
                let detail = self.queue.active_job(user_id).await.map_or_else(String::new, |(source, elapsed)| {
                    format!("\n{} ({})", truncate(&source, 60), readable_time(elapsed.as_secs()))
                });
                CommandResult::success(format!("⬇️ Your download is running.{detail}"))
            }
            UserQueueStatus::Waiting {
                position,
                waiting,
                priority,
            } => CommandResult::success(format!(
                "📋 Position {position} of {waiting} ({} priority).",
                priority.label()
            )),
            UserQueueStatus::Idle => CommandResult::success("You have nothing in the queue."),
        }
    }

    async fn handle_queue_status(&self) -> CommandResult {
        let snapshot = self.queue.snapshot().await;
        CommandResult::success(format!(
            "📊 Queue status\n\
             Active: {}/{}\n\
             Waiting: {}/{}\n\
             Premium waiting: {}\n\
             Free waiting: {}",
            snapshot.active,
            snapshot.max_concurrent,
            snapshot.waiting,
            snapshot.max_queue,
            snapshot.premium_waiting,
            snapshot.free_waiting,
        ))
    }

    async fn handle_stats(&self) -> CommandResult {
        let queue = self.queue.snapshot().await;
        let budget = self.engine.budget().snapshot();
        let sessions = self.sessions.active_count().await;
        let rss_mb = {
            let mut memory = self.memory.lock().await;
            memory.snapshot("stats");
            memory.last_rss_mb().unwrap_or_default()
        };
        let system = system_memory();

        CommandResult::success(format!(
            "📊 Bot statistics\n\
             Queue: {}/{} active, {} waiting\n\
             Sessions: {}/{}\n\
             Connections: {}/{} in use by {} transfers\n\
             Memory: {:.1} MB (system {:.0}/{:.0} MB free)\n\
             Uptime: {}",
            queue.active,
            queue.max_concurrent,
            queue.waiting,
            sessions,
            self.sessions.limits().max_sessions,
            budget.in_use,
            budget.total,
            budget.active_transfers,
            rss_mb,
            system.available_mb,
            system.total_mb,
            readable_time(self.started_at.elapsed().as_secs()),
        ))
    }

    async fn handle_myinfo(&self, user_id: UserId) -> CommandResult {
        let tier = self.users.tier(user_id).await;
        let quota = self
            .users
            .remaining(user_id)
            .await
            .map_or_else(|| "unlimited".to_owned(), |left| format!("{left}/{}", self.users.free_daily_limit()));
        let logged_in = if self.sessions.connector().has_saved_session(user_id) {
            "yes"
        } else {
            "no"
        };

        CommandResult::success(format!(
            "👤 Your account\n\
             ID: {user_id}\n\
             Plan: {}\n\
             Downloads left today: {quota}\n\
             Max file size: {}\n\
             Logged in: {logged_in}",
            tier.label(),
            readable_size(size_limit(tier.is_premium())),
        ))
    }

    async fn handle_set_thumb(&self, user_id: UserId, reply: &R) -> CommandResult {
        if let Err(e) = tokio::fs::create_dir_all(&self.thumbnails_dir).await {
            warn!("Failed to create {}: {}", self.thumbnails_dir.display(), e);
            return CommandResult::error("❌ Failed to save thumbnail. Please try again.");
        }

        let path = self.thumbnails_dir.join(format!("{user_id}.jpg"));
        match reply.save_replied_photo(&path).await {
            Ok(true) => {
                self.users.set_thumbnail(user_id, path).await;
                CommandResult::success(
                    "✅ Custom thumbnail saved. It will be used for all your video downloads.
                     Use /delthumb to remove it.",
                )
            }
            Ok(false) => CommandResult::error(
                "📸 Send a photo to the bot, then reply to it with /setthumb.",
            ),
            Err(e) => {
                warn!("Failed to save thumbnail for user {}: {:#}", user_id, e);
                CommandResult::error("❌ Failed to save thumbnail. Please try again.")
            }
        }
    }

    async fn handle_del_thumb(&self, user_id: UserId) -> CommandResult {
        let Some(path) = self.users.clear_thumbnail(user_id).await else {
            return CommandResult::error("ℹ️ You don't have a custom thumbnail set.");
        };

        if let Err(e) = tokio::fs::remove_file(&path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!("Failed to remove thumbnail {}: {}", path.display(), e);
        }
        CommandResult::success("✅ Custom thumbnail removed. Videos will use their own thumbnails again.")
    }

    async fn handle_view_thumb(&self, user_id: UserId, reply: &R) -> CommandResult {
        let Some(path) = self.users.thumbnail(user_id).await else {
            return CommandResult::error("ℹ️ You don't have a custom thumbnail set. Use /setthumb to set one.");
        };

        match reply.send_photo(&path, "🖼 Your current custom thumbnail").await {
            Ok(()) => CommandResult::success("Use /delthumb to remove it."),
            Err(e) => {
                debug!("Could not show thumbnail of user {}: {:#}", user_id, e);
                CommandResult::error(
                    "⚠️ Your thumbnail exists but couldn't be displayed. Set a new one with /setthumb.",
                )
            }
        }
    }

    /// Tells the user about jobs that ended without their doing.
    pub async fn handle_report(&self, report: JobReport) {
        let reply = self.replies.lock().await.remove(&report.user_id);

        let text = match &report.outcome {
            JobOutcome::TimedOut(limit) => Some(format!(
                "⏱ Download of {} timed out after {}.",
                report.source_ref,
                readable_time(limit.as_secs())
            )),
            JobOutcome::Completed | JobOutcome::Failed(_) | JobOutcome::Cancelled => None,
        };

        if let (Some(reply), Some(text)) = (reply, text)
            && let Err(e) = reply.send_text(&text).await
        {
            warn!("Failed to notify user {}: {:#}", report.user_id, e);
        }

        self.prune_replies().await;
    }

    /// Drops reply handles of users that are no longer queued or running.
    async fn prune_replies(&self) {
        let users: Vec<UserId> = self.replies.lock().await.keys().copied().collect();
        for user_id in users {
            if self.queue.user_status(user_id).await == UserQueueStatus::Idle {
                self.replies.lock().await.remove(&user_id);
            }
        }
    }
}

fn handle_help() -> CommandResult {
    let mut lines = vec![
        "Restricted Content Downloader".to_owned(),
        String::new(),
        "Log in with your own account, then send a post link.".to_owned(),
        String::new(),
    ];

    for (cmd, desc) in BotCommand::all_commands() {
        lines.push(format!("{cmd} - {desc}"));
    }

    CommandResult::success(lines.join("\n"))
}

/// Checks that a batch covers one chat in order and is not too long.
fn validate_batch(start: &PostLink, end: &PostLink) -> Result<(), String> {
    if !start.same_chat(end) {
        return Err("Both links must point to the same chat.".to_owned());
    }
    if start.message_id > end.message_id {
        return Err("The start link must come before the end link.".to_owned());
    }
    let count = end.message_id - start.message_id + 1;
    if count > MAX_BATCH_POSTS {
        return Err(format!(
            "A batch can cover at most {MAX_BATCH_POSTS} posts, this one covers {count}."
        ));
    }
    Ok(())
}

fn session_error(err: &SessionError) -> CommandResult {
    CommandResult::error(match err {
        SessionError::NotLoggedIn => "🔐 Log in first with /login <phone>.".to_owned(),
        SessionError::InvalidSession => {
            "🔐 Your session has expired. Log in again with /login <phone>.".to_owned()
        }
        SessionError::SlotsFull(_) => {
            "⏳ All session slots are busy with downloads. Try again in a few minutes.".to_owned()
        }
        SessionError::CreationFailed(reason) => format!("❌ Could not connect your account: {reason}"),
    })
}

fn admission_error(err: &AdmissionError) -> CommandResult {
    CommandResult::error(match err {
        AdmissionError::AlreadyActive => {
            "⏳ You already have a download running. Use /canceldownload to stop it.".to_owned()
        }
        AdmissionError::AlreadyQueued { position, waiting } => {
            format!("📋 You are already in the queue at position {position} of {waiting}.")
        }
        AdmissionError::QueueFull { .. } => {
            "🚦 The queue is full right now. Try again in a few minutes.".to_owned()
        }
    })
}

fn login_step(step: LoginStep) -> CommandResult {
    match step {
        LoginStep::CodeSent => CommandResult::success("📨 Code sent."),
        LoginStep::PasswordNeeded { hint } => {
            let hint = hint.map_or_else(String::new, |h| format!(" (hint: {h})"));
            CommandResult::success(format!(
                "🔑 Two-step verification is on. Send your password with /password <password>{hint}"
            ))
        }
        LoginStep::LoggedIn => CommandResult::success("✅ Logged in. Send a post link to download it."),
    }
}

fn login_error(err: &LoginError) -> CommandResult {
    warn!("Login step failed: {}", err);
    CommandResult::error(format!("❌ {err}"))
}

/// Truncates a string to a maximum length, adding "..." if truncated.
fn truncate(s: &str, max_len: usize) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= max_len {
        s.to_owned()
    } else {
        format!("{}...", chars[..max_len].iter().collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use crate::config::UserDirectory;
    use crate::memory::{HIGH_MEMORY_MB, SPIKE_MB};
    use crate::pipeline::{FetchedPost, PostMedia};
    use crate::pipeline::tests::{FakeReply, Sent};
    use crate::queue::QueueLimits;
    use crate::session::SessionLimits;
    use crate::session::tests::{FakeClient, FakeConnector};
    use crate::telegram::{ChatRef, TelegramError};
    use crate::transfer::parallel::tests::FakeMedia;
    use crate::transfer::{BudgetLimits, ConnectionBudget};

    /// Posts from 100 on carry a small video, earlier ones only text.
    fn fake_post(message_id: i32) -> FetchedPost<FakeMedia> {
        let media = (message_id >= 100).then(|| PostMedia::Available {
            source: FakeMedia::new(64),
            file_name: format!("clip_{message_id}.mp4"),
            size: 64,
        });
        FetchedPost {
            message_id,
            text: format!("post {message_id}"),
            media,
            grouped_id: None,
        }
    }

    impl PostFetcher for FakeClient {
        type Media = FakeMedia;

        async fn fetch_post(&self, link: &PostLink) -> Result<FetchedPost<FakeMedia>, TelegramError> {
            Ok(fake_post(link.message_id))
        }

        async fn fetch_posts(&self, _link: &PostLink, ids: &[i32]) -> Result<Vec<FetchedPost<FakeMedia>>, TelegramError> {
            Ok(ids.iter().map(|&id| fake_post(id)).collect())
        }
    }

    #[derive(Default)]
    struct FakeLogin {
        calls: StdMutex<Vec<String>>,
    }

    impl LoginBackend for FakeLogin {
        async fn request_code(&self, _user_id: UserId, phone: &str) -> Result<LoginStep, LoginError> {
            self.calls.lock().unwrap().push(format!("code {phone}"));
            Ok(LoginStep::CodeSent)
        }

        async fn submit_code(&self, _user_id: UserId, code: &str) -> Result<LoginStep, LoginError> {
            if code == "00000" {
                return Err(LoginError::InvalidCode);
            }
            Ok(LoginStep::PasswordNeeded {
                hint: Some("pet".to_owned()),
            })
        }

        async fn submit_password(&self, _user_id: UserId, _password: &str) -> Result<LoginStep, LoginError> {
            Ok(LoginStep::LoggedIn)
        }

        async fn cancel(&self, _user_id: UserId) -> bool {
            false
        }

        async fn logout(&self, _user_id: UserId) -> Result<bool, LoginError> {
            self.calls.lock().unwrap().push("logout".to_owned());
            Ok(true)
        }
    }

    type TestHandler = CommandHandler<FakeConnector, FakeLogin, FakeReply>;

    struct Fixture {
        handler: TestHandler,
        queue: Arc<DownloadQueue>,
        sessions: Arc<SessionManager<FakeConnector>>,
        users: Arc<UserStore>,
        thumbnails_dir: PathBuf,
        _dir: tempfile::TempDir,
    }

    fn fixture(connector: FakeConnector, daily_limit: u32) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(DownloadQueue::new(QueueLimits {
            max_concurrent: 2,
            max_queue: 5,
            job_timeout: Duration::from_secs(60),
        }));
        let users = Arc::new(UserStore::new(
            dir.path().join("users.json"),
            daily_limit,
            UserDirectory::default(),
        ));
        let sessions = Arc::new(SessionManager::new(connector, SessionLimits::default()));
        let handler = CommandHandler::new(HandlerDeps {
            queue: Arc::clone(&queue),
            sessions: Arc::clone(&sessions),
            login: Arc::new(FakeLogin::default()),
            engine: TransferEngine::new(Arc::new(ConnectionBudget::new(BudgetLimits::default()))),
            users: Arc::clone(&users),
            memory: Arc::new(Mutex::new(MemoryMonitor::new(HIGH_MEMORY_MB, SPIKE_MB))),
            downloads_dir: dir.path().join("downloads"),
            thumbnails_dir: dir.path().join("thumbnails"),
        });
        Fixture {
            handler,
            queue,
            sessions,
            users,
            thumbnails_dir: dir.path().join("thumbnails"),
            _dir: dir,
        }
    }

    async fn wait_idle(queue: &DownloadQueue, user_id: UserId) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while queue.user_status(user_id).await != UserQueueStatus::Idle {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_download_requires_login() {
        let connector = FakeConnector {
            logged_out: [7].into(),
            ..FakeConnector::default()
        };
        let f = fixture(connector, 5);
        let reply = FakeReply::default();

        let result = f.handler.try_handle(7, "https://t.me/news/1", &reply).await.unwrap();
        assert!(!result.success);
        assert!(result.message.contains("/login"));
    }

    #[tokio::test]
    async fn test_download_runs_job_and_counts_usage() {
        let f = fixture(FakeConnector::default(), 5);
        let reply = FakeReply::default();

        let result = f.handler.try_handle(7, "/dl https://t.me/news/3", &reply).await.unwrap();
        assert!(result.success, "{}", result.message);

        wait_idle(&f.queue, 7).await;
        assert_eq!(reply.sent(), vec![Sent::Text("post 3".to_owned())]);
        assert_eq!(f.users.remaining(7).await, Some(4));
    }

    #[tokio::test]
    async fn test_queued_job_opens_session_when_started() {
        let f = fixture(FakeConnector::default(), 5);
        let reply = FakeReply::default();
        for blocker in [1, 2] {
            let work: crate::queue::Work = Box::pin(futures::future::pending());
            f.queue
                .enqueue(JobRequest::new(blocker, Priority::Free, "blocker", work))
                .await
                .unwrap();
        }

        let result = f.handler.try_handle(7, "https://t.me/news/3", &reply).await.unwrap();
        assert!(result.message.contains("position 1"), "{}", result.message);

        // The session goes away while the job waits.
        assert!(f.sessions.remove(7).await);
        f.queue.cancel_user(1).await;
        f.queue.promote().await;

        wait_idle(&f.queue, 7).await;
        assert_eq!(reply.sent(), vec![Sent::Text("post 3".to_owned())]);
        let connects = f.sessions.connector().connects.lock().unwrap().clone();
        assert_eq!(connects, vec![7, 7]);
    }

    #[tokio::test]
    async fn test_thumbnail_commands() {
        let f = fixture(FakeConnector::default(), 5);
        let reply = FakeReply::replying_to_photo(b"jpeg bytes");
        let stored = f.thumbnails_dir.join("7.jpg");

        let result = f.handler.try_handle(7, "/viewthumb", &reply).await.unwrap();
        assert!(!result.success);

        let result = f.handler.try_handle(7, "/setthumb", &reply).await.unwrap();
        assert!(result.success, "{}", result.message);
        assert_eq!(std::fs::read(&stored).unwrap(), b"jpeg bytes");
        assert_eq!(f.users.thumbnail(7).await, Some(stored.clone()));

        let result = f.handler.try_handle(7, "/viewthumb", &reply).await.unwrap();
        assert!(result.success);
        assert!(matches!(reply.sent().last(), Some(Sent::Photo { .. })));

        let result = f.handler.try_handle(7, "/delthumb", &reply).await.unwrap();
        assert!(result.success);
        assert!(!stored.exists());
        assert_eq!(f.users.thumbnail(7).await, None);

        let result = f.handler.try_handle(7, "/delthumb", &reply).await.unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_set_thumb_needs_replied_photo() {
        let f = fixture(FakeConnector::default(), 5);
        let reply = FakeReply::default();

        let result = f.handler.try_handle(7, "/setthumb", &reply).await.unwrap();
        assert!(!result.success);
        assert!(result.message.contains("reply to it"));
        assert_eq!(f.users.thumbnail(7).await, None);
    }

    #[tokio::test]
    async fn test_video_upload_uses_custom_thumbnail() {
        let f = fixture(FakeConnector::default(), 5);
        let reply = FakeReply::replying_to_photo(b"jpeg bytes");
        f.handler.try_handle(7, "/setthumb", &reply).await.unwrap();

        let result = f.handler.try_handle(7, "https://t.me/news/100", &reply).await.unwrap();
        assert!(result.success, "{}", result.message);
        wait_idle(&f.queue, 7).await;

        assert_eq!(
            *reply.thumbnails.lock().unwrap(),
            vec![("clip_100.mp4".to_owned(), f.thumbnails_dir.join("7.jpg"))]
        );
        assert_eq!(f.users.remaining(7).await, Some(4));
    }

    #[tokio::test]
    async fn test_quota_blocks_download() {
        let f = fixture(FakeConnector::default(), 1);
        f.users.record_usage(7, 1).await;
        let reply = FakeReply::default();

        let result = f.handler.try_handle(7, "https://t.me/news/1", &reply).await.unwrap();
        assert!(!result.success);
        assert!(result.message.contains("downloads for today"));
    }

    #[test]
    fn test_batch_validation() {
        let link = |chat: &str, id| PostLink {
            chat: ChatRef::Username(chat.to_owned()),
            message_id: id,
            thread_id: None,
        };
        assert!(validate_batch(&link("a", 1), &link("a", 20)).is_ok());
        assert!(validate_batch(&link("a", 1), &link("a", 21)).is_err());
        assert!(validate_batch(&link("a", 5), &link("a", 4)).is_err());
        assert!(validate_batch(&link("a", 1), &link("b", 2)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_runs_range() {
        let f = fixture(FakeConnector::default(), 10);
        let reply = FakeReply::default();

        let result = f
            .handler
            .try_handle(7, "/bdl https://t.me/news/1 https://t.me/news/2", &reply)
            .await
            .unwrap();
        assert!(result.success, "{}", result.message);

        wait_idle(&f.queue, 7).await;
        let sent = reply.sent();
        assert_eq!(sent[0], Sent::Text("post 1".to_owned()));
        assert!(matches!(sent.last(), Some(Sent::Text(t)) if t.contains("Downloaded: 2")));
    }

    #[tokio::test]
    async fn test_queue_and_cancel_when_idle() {
        let f = fixture(FakeConnector::default(), 5);
        let reply = FakeReply::default();

        let result = f.handler.try_handle(7, "/queue", &reply).await.unwrap();
        assert!(result.message.contains("nothing in the queue"));

        let result = f.handler.try_handle(7, "/canceldownload", &reply).await.unwrap();
        assert!(!result.success);
        assert!(!result.trigger_promotion);
    }

    #[tokio::test]
    async fn test_login_flow_messages() {
        let f = fixture(FakeConnector::default(), 5);
        let reply = FakeReply::default();

        let result = f.handler.try_handle(7, "/login 12", &reply).await.unwrap();
        assert!(!result.success);

        let result = f.handler.try_handle(7, "/login +1 555 010 0000", &reply).await.unwrap();
        assert!(result.success);

        let result = f.handler.try_handle(7, "/verify 1 2 3 4 5", &reply).await.unwrap();
        assert!(result.message.contains("/password"));
        assert!(result.message.contains("pet"));

        let result = f.handler.try_handle(7, "/verify 00000", &reply).await.unwrap();
        assert!(!result.success);

        let result = f.handler.try_handle(7, "/password secret", &reply).await.unwrap();
        assert!(result.message.contains("Logged in"));
    }

    #[tokio::test]
    async fn test_timeout_report_notifies_user() {
        let f = fixture(FakeConnector::default(), 5);
        let reply = FakeReply::default();
        f.handler.replies.lock().await.insert(7, reply.clone());

        f.handler
            .handle_report(JobReport {
                user_id: 7,
                source_ref: "https://t.me/news/1".to_owned(),
                outcome: JobOutcome::TimedOut(Duration::from_secs(1800)),
                elapsed: Duration::from_secs(1800),
            })
            .await;

        assert!(matches!(&reply.sent()[0], Sent::Text(t) if t.contains("timed out after 30m0s")));
        assert!(f.handler.replies.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_stats_and_myinfo() {
        let f = fixture(FakeConnector::default(), 5);
        let reply = FakeReply::default();

        let stats = f.handler.try_handle(7, "/stats", &reply).await.unwrap();
        assert!(stats.message.contains("Connections: 0/20"));

        let info = f.handler.try_handle(7, "/myinfo", &reply).await.unwrap();
        assert!(info.message.contains("Plan: Free"));
        assert!(info.message.contains("5/5"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("Hello", 10), "Hello");
        assert_eq!(truncate("Hello, World!", 5), "Hello...");
        assert_eq!(truncate("Hi", 2), "Hi");
    }

    #[test]
    fn test_non_commands_are_ignored() {
        assert_eq!(BotCommand::parse("just chatting"), None);
    }
}
