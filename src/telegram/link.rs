//! Post link parsing.
//!
//! Accepted forms:
//! - `https://t.me/<username>/<id>`
//! - `https://t.me/<username>/<thread>/<id>`
//! - `https://t.me/c/<internal id>/<id>`
//! - `https://t.me/c/<internal id>/<thread>/<id>`
//!
//! with optional `?single` or `?comment=<id>` queries. When a comment id is
//! present it becomes the message id and the post id becomes the thread.

use std::fmt;

use thiserror::Error;

const HOSTS: [&str; 3] = ["t.me", "telegram.me", "telegram.dog"];

/// Offset that turns an internal channel id into a Bot API chat id.
const CHANNEL_ID_OFFSET: i64 = 1_000_000_000_000;

/// Link parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("Not a Telegram post link")]
    NotTelegram,

    #[error("Link does not point to a post")]
    MissingPost,

    #[error("Invalid id in link: {0}")]
    InvalidId(String),
}

/// The chat part of a post link.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChatRef {
    /// Public chat by username.
    Username(String),
    /// Private channel by internal id (as shown in `/c/` links).
    Channel(i64),
}

impl ChatRef {
    /// Bot API style id (`-100<internal id>`) for private channels.
    #[must_use]
    pub const fn bot_api_id(&self) -> Option<i64> {
        match self {
            Self::Channel(id) => Some(-(CHANNEL_ID_OFFSET + *id)),
            Self::Username(_) => None,
        }
    }
}

impl fmt::Display for ChatRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Username(name) => write!(f, "@{name}"),
            Self::Channel(id) => write!(f, "-100{id}"),
        }
    }
}

/// A parsed link to a single post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostLink {
    pub chat: ChatRef,
    pub message_id: i32,
    /// Discussion thread or original post when linking to a comment.
    pub thread_id: Option<i32>,
}

impl PostLink {
    /// Parses a `t.me` post link.
    pub fn parse(link: &str) -> Result<Self, LinkError> {
        let link = link.trim();
        let without_scheme = link
            .strip_prefix("https://")
            .or_else(|| link.strip_prefix("http://"))
            .unwrap_or(link);

        let (path, query) = without_scheme
            .split_once('?')
            .map_or((without_scheme, None), |(p, q)| (p, Some(q)));

        let mut segments = path.trim_end_matches('/').split('/');
        let host = segments.next().unwrap_or_default().to_lowercase();
        let host = host.strip_prefix("www.").unwrap_or(&host);
        if !HOSTS.contains(&host) {
            return Err(LinkError::NotTelegram);
        }

        let segments: Vec<&str> = segments.filter(|s| !s.is_empty()).collect();

        let (chat, rest) = match segments.as_slice() {
            ["c", id, rest @ ..] => (ChatRef::Channel(parse_id(id)?), rest),
            [username, rest @ ..] => (ChatRef::Username((*username).to_owned()), rest),
            [] => return Err(LinkError::MissingPost),
        };

        let (thread_id, post_id) = match rest {
            [id] => (None, parse_id::<i32>(id)?),
            [thread, id] => (Some(parse_id::<i32>(thread)?), parse_id::<i32>(id)?),
            _ => return Err(LinkError::MissingPost),
        };

        let comment_id = query
            .into_iter()
            .flat_map(|q| q.split('&'))
            .find_map(|pair| pair.strip_prefix("comment="))
            .map(parse_id::<i32>)
            .transpose()?;

        Ok(match comment_id {
            Some(comment) => Self {
                chat,
                message_id: comment,
                thread_id: Some(post_id),
            },
            None => Self {
                chat,
                message_id: post_id,
                thread_id,
            },
        })
    }

    /// The same chat and thread, a different message.
    #[must_use]
    pub fn with_message(&self, message_id: i32) -> Self {
        Self {
            chat: self.chat.clone(),
            message_id,
            thread_id: self.thread_id,
        }
    }

    /// Whether both links point into the same chat.
    #[must_use]
    pub fn same_chat(&self, other: &Self) -> bool {
        self.chat == other.chat
    }
}

impl fmt::Display for PostLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.chat {
            ChatRef::Username(name) => write!(f, "https://t.me/{name}/{}", self.message_id),
            ChatRef::Channel(id) => write!(f, "https://t.me/c/{id}/{}", self.message_id),
        }
    }
}

/// Returns true when `text` looks like a post link worth parsing.
#[must_use]
pub fn looks_like_link(text: &str) -> bool {
    let text = text.trim();
    HOSTS.iter().any(|host| text.contains(&format!("{host}/")))
}

fn parse_id<T: std::str::FromStr>(s: &str) -> Result<T, LinkError> {
    s.parse().map_err(|_| LinkError::InvalidId(s.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_link() {
        let link = PostLink::parse("https://t.me/somechannel/123").unwrap();
        assert_eq!(link.chat, ChatRef::Username("somechannel".to_owned()));
        assert_eq!(link.message_id, 123);
        assert_eq!(link.thread_id, None);
    }

    #[test]
    fn test_private_link() {
        let link = PostLink::parse("https://t.me/c/1234567890/55?single").unwrap();
        assert_eq!(link.chat, ChatRef::Channel(1_234_567_890));
        assert_eq!(link.chat.bot_api_id(), Some(-1_001_234_567_890));
        assert_eq!(link.message_id, 55);
    }

    #[test]
    fn test_thread_segment() {
        let link = PostLink::parse("https://t.me/c/42/7/99").unwrap();
        assert_eq!(link.chat, ChatRef::Channel(42));
        assert_eq!(link.thread_id, Some(7));
        assert_eq!(link.message_id, 99);

        let link = PostLink::parse("t.me/group/3/4/").unwrap();
        assert_eq!(link.chat, ChatRef::Username("group".to_owned()));
        assert_eq!(link.message_id, 4);
    }

    #[test]
    fn test_comment_wins() {
        let link = PostLink::parse("https://t.me/news/100?comment=250").unwrap();
        assert_eq!(link.message_id, 250);
        assert_eq!(link.thread_id, Some(100));
    }

    #[test]
    fn test_rejects_bad_links() {
        assert_eq!(
            PostLink::parse("https://example.com/a/1"),
            Err(LinkError::NotTelegram)
        );
        assert_eq!(
            PostLink::parse("https://t.me/somechannel"),
            Err(LinkError::MissingPost)
        );
        assert_eq!(
            PostLink::parse("https://t.me/c/abc/1"),
            Err(LinkError::InvalidId("abc".to_owned()))
        );
    }

    #[test]
    fn test_display_roundtrip() {
        let link = PostLink::parse("https://t.me/c/42/99").unwrap();
        assert_eq!(PostLink::parse(&link.to_string()).unwrap(), link);
        assert!(looks_like_link("see https://t.me/x/1"));
        assert!(!looks_like_link("hello"));
    }
}
