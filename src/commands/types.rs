//! Command types and definitions.

use std::fmt;

use crate::telegram::{PostLink, looks_like_link};

/// Available bot commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotCommand {
    /// Greeting with usage.
    Start,

    /// Show help information.
    Help,

    /// Start a phone login.
    Login(String),

    /// Submit the login code.
    Verify(String),

    /// Submit the 2FA password.
    Password(String),

    /// Abort a pending login.
    Cancel,

    /// Sign out and delete the saved session.
    Logout,

    /// Download one post.
    Download(PostLink),

    /// Download a range of posts.
    Batch { start: PostLink, end: PostLink },

    /// Cancel the caller's active or queued download.
    CancelDownload,

    /// Show the caller's place in the queue.
    Queue,

    /// Show global queue counters.
    QueueStatus,

    /// Show queue, session, connection and memory statistics.
    Stats,

    /// Show account tier and quota.
    MyInfo,

    /// Store the replied-to photo as the video thumbnail.
    SetThumb,

    DelThumb,

    ViewThumb,

    /// A known command with missing or malformed arguments.
    Usage(&'static str),
}

impl BotCommand {
    /// Parses a command from a message text.
    ///
    /// Accepts `/cmd`, `/cmd@botname` and bare post links.
    /// Returns `None` if the message is not a command.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();

        let Some(after_slash) = text.strip_prefix('/') else {
            return looks_like_link(text).then(|| Self::parse_download(Some(text)));
        };

        let (cmd, args) = match after_slash.split_once(char::is_whitespace) {
            Some((cmd, args)) => (cmd, Some(args.trim()).filter(|a| !a.is_empty())),
            None => (after_slash, None),
        };
        let cmd = cmd.split_once('@').map_or(cmd, |(cmd, _bot)| cmd).to_lowercase();

        match cmd.as_str() {
            "start" => Some(Self::Start),
            "help" | "h" => Some(Self::Help),
            "login" => Some(args.map_or(Self::Usage("/login <phone number>"), |a| {
                Self::Login(a.to_owned())
            })),
            "verify" | "code" => Some(args.map_or(Self::Usage("/verify <code>"), |a| {
                Self::Verify(a.to_owned())
            })),
            "password" | "2fa" => Some(args.map_or(Self::Usage("/password <password>"), |a| {
                Self::Password(a.to_owned())
            })),
            "cancel" => Some(Self::Cancel),
            "logout" => Some(Self::Logout),
            "dl" | "download" => Some(Self::parse_download(args)),
            "bdl" | "batch" => Some(Self::parse_batch(args)),
            "canceldownload" | "stop" => Some(Self::CancelDownload),
            "queue" | "q" => Some(Self::Queue),
            "qstatus" => Some(Self::QueueStatus),
            "stats" => Some(Self::Stats),
            "myinfo" | "me" => Some(Self::MyInfo),
            "setthumb" => Some(Self::SetThumb),
            "delthumb" => Some(Self::DelThumb),
            "viewthumb" => Some(Self::ViewThumb),
            _ => None,
        }
    }

    fn parse_download(args: Option<&str>) -> Self {
        args.and_then(|a| PostLink::parse(a).ok())
            .map_or(Self::Usage("/dl <post link>"), Self::Download)
    }

    /// Parses batch arguments: `<start link> <end link>`
    fn parse_batch(args: Option<&str>) -> Self {
        const USAGE: &str = "/bdl <start link> <end link>";

        let mut links = args.unwrap_or_default().split_whitespace();
        let (Some(start), Some(end)) = (links.next(), links.next()) else {
            return Self::Usage(USAGE);
        };
        match (PostLink::parse(start), PostLink::parse(end)) {
            (Ok(start), Ok(end)) => Self::Batch { start, end },
            _ => Self::Usage(USAGE),
        }
    }

    /// Returns the command name as it appears in help.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Help => "help",
            Self::Login(_) => "login",
            Self::Verify(_) => "verify",
            Self::Password(_) => "password",
            Self::Cancel => "cancel",
            Self::Logout => "logout",
            Self::Download(_) => "dl",
            Self::Batch { .. } => "bdl",
            Self::CancelDownload => "canceldownload",
            Self::Queue => "queue",
            Self::QueueStatus => "qstatus",
            Self::Stats => "stats",
            Self::MyInfo => "myinfo",
            Self::SetThumb => "setthumb",
            Self::DelThumb => "delthumb",
            Self::ViewThumb => "viewthumb",
            Self::Usage(_) => "usage",
        }
    }

    /// Returns all available commands with their descriptions.
    #[must_use]
    pub fn all_commands() -> Vec<(&'static str, &'static str)> {
        vec![
            ("/login <phone>", "Log in with your Telegram account"),
            ("/verify <code>", "Send the login code"),
            ("/password <password>", "Send your 2FA password"),
            ("/cancel", "Abort a pending login"),
            ("/logout", "Log out and delete the saved session"),
            ("/dl <link>", "Download a post (or just send the link)"),
            ("/bdl <start> <end>", "Download up to 20 posts of one chat"),
            ("/canceldownload", "Cancel your download"),
            ("/queue", "Your place in the queue"),
            ("/qstatus", "Queue status"),
            ("/stats", "Bot statistics"),
            ("/myinfo", "Your plan and remaining downloads"),
            ("/setthumb", "Reply to a photo to use it as your video thumbnail"),
            ("/delthumb", "Remove your custom thumbnail"),
            ("/viewthumb", "Show your custom thumbnail"),
            ("/help", "Show this help message"),
        ]
    }
}

impl fmt::Display for BotCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Secrets stay out of logs.
            Self::Login(_) => write!(f, "login <phone>"),
            Self::Verify(_) => write!(f, "verify <code>"),
            Self::Password(_) => write!(f, "password <hidden>"),
            Self::Download(link) => write!(f, "dl {link}"),
            Self::Batch { start, end } => write!(f, "bdl {start} {end}"),
            Self::Usage(usage) => write!(f, "usage {usage}"),
            _ => write!(f, "{}", self.name()),
        }
    }
}

/// Result of command execution.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Whether the command was successful.
    pub success: bool,

    /// Response message to show the user.
    pub message: String,

    /// Whether a queue slot was freed and promotion should run now.
    pub trigger_promotion: bool,
}

impl CommandResult {
    /// Creates a successful result.
    #[must_use]
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            trigger_promotion: false,
        }
    }

    /// Creates a successful result that frees a queue slot.
    #[must_use]
    pub fn success_with_promotion(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            trigger_promotion: true,
        }
    }

    /// Creates an error result.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            trigger_promotion: false,
        }
    }
}
