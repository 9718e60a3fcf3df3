use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{Attachment, ChannelId, GuildId, MessageId, RoleId, TriggerEvent, UserId};

pub mod console;

/// Which mentions a posted message may ping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedMentions {
    pub users: bool,
    pub everyone: bool,
    pub roles: bool,
    pub replied_user: bool,
}

/// A message the engine asks the platform to post
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub channel_id: ChannelId,
    pub content: Option<String>,
    /// Image reference understood by the platform (path or URL)
    pub image: Option<String>,
    pub reply_to: Option<MessageId>,
    pub tts: bool,
    pub allowed_mentions: AllowedMentions,
}

/// Permission the bot needs over a member before a moderation action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Authority {
    Ban,
    Kick,
    ManageRoles,
    ManageNicknames,
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Authority::Ban => write!(f, "ban members"),
            Authority::Kick => write!(f, "kick members"),
            Authority::ManageRoles => write!(f, "manage roles"),
            Authority::ManageNicknames => write!(f, "manage nicknames"),
        }
    }
}

/// Side effects the dispatcher can perform on the chat platform
#[async_trait]
pub trait ActionSurface: Send + Sync {
    /// Post a message, returning its id so it can be deleted later
    async fn send_message(&self, guild_id: GuildId, message: OutgoingMessage) -> Result<MessageId>;

    async fn send_dm(&self, user_id: UserId, content: &str) -> Result<()>;

    async fn delete_message(&self, channel_id: ChannelId, message_id: MessageId) -> Result<()>;

    async fn add_reaction(&self, channel_id: ChannelId, message_id: MessageId, emoji: &str) -> Result<()>;

    /// Crosspost an announcement-channel message
    async fn publish_message(&self, channel_id: ChannelId, message_id: MessageId) -> Result<()>;

    async fn change_nickname(&self, guild_id: GuildId, user_id: UserId, nickname: &str) -> Result<()>;

    async fn add_roles(&self, guild_id: GuildId, user_id: UserId, roles: &[RoleId]) -> Result<()>;

    async fn remove_roles(&self, guild_id: GuildId, user_id: UserId, roles: &[RoleId]) -> Result<()>;

    async fn ban(&self, guild_id: GuildId, user_id: UserId, reason: &str) -> Result<()>;

    async fn kick(&self, guild_id: GuildId, user_id: UserId, reason: &str) -> Result<()>;

    /// Run a bot command as if `invoker` had typed it in the event's channel
    async fn invoke_command(&self, event: &TriggerEvent, command: &str, invoker: UserId) -> Result<()>;

    /// Whether the bot may currently exercise `authority` over `target`
    async fn check_authority(&self, guild_id: GuildId, target: UserId, authority: Authority) -> Result<bool>;

    /// Get the platform identifier
    fn platform_name(&self) -> &str;
}

/// Image manipulation used by image actions and OCR search
#[async_trait]
pub trait ImageProcessor: Send + Sync {
    /// Produce a resized copy of `image` scaled by the match length
    async fn resize(&self, image: &str, match_len: usize) -> Result<String>;

    /// Extract text from an image attachment
    async fn ocr(&self, attachment: &Attachment) -> Result<String>;
}
