// src/types/mod.rs - Core event and action types shared by the trigger engine

use serde::{Deserialize, Serialize};
use std::fmt;

pub type GuildId = u64;
pub type ChannelId = u64;
pub type UserId = u64;
pub type RoleId = u64;
pub type MessageId = u64;

/// Author of an inbound message
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Author {
    pub id: UserId,
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub roles: Vec<RoleId>,
    #[serde(default)]
    pub bot: bool,
}

impl Author {
    pub fn display(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    #[serde(default)]
    pub url: String,
    /// Whether the attachment is an image the OCR capability can read
    #[serde(default)]
    pub image: bool,
}

/// A message (or message edit) delivered by the platform connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub guild_id: GuildId,
    pub message_id: MessageId,
    pub channel_id: ChannelId,
    #[serde(default)]
    pub channel_nsfw: bool,
    pub author: Author,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub is_edit: bool,
    #[serde(default)]
    pub is_command: bool,
    #[serde(default = "chrono::Utc::now")]
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl TriggerEvent {
    /// Every scope identifier this event belongs to: channel, author, then author roles
    pub fn scope_ids(&self) -> impl Iterator<Item = u64> + '_ {
        [self.channel_id, self.author.id]
            .into_iter()
            .chain(self.author.roles.iter().copied())
    }
}

/// Result of a successful pattern match
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchResult {
    pub start: usize,
    pub end: usize,
    pub matched: String,
    /// Capture groups 1..n; `None` for groups that did not participate
    #[serde(default)]
    pub groups: Vec<Option<String>>,
}

impl MatchResult {
    /// Length of the matched span in characters
    pub fn char_len(&self) -> usize {
        self.matched.chars().count()
    }
}

/// Cooldown bucket granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownStyle {
    Guild,
    Channel,
    Author,
}

impl CooldownStyle {
    /// Accepts the moderator-facing aliases: server, member and user
    pub fn parse(style: &str) -> Option<Self> {
        match style.to_lowercase().as_str() {
            "guild" | "server" => Some(CooldownStyle::Guild),
            "channel" => Some(CooldownStyle::Channel),
            "author" | "user" | "member" => Some(CooldownStyle::Author),
            _ => None,
        }
    }
}

impl fmt::Display for CooldownStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CooldownStyle::Guild => write!(f, "guild"),
            CooldownStyle::Channel => write!(f, "channel"),
            CooldownStyle::Author => write!(f, "author"),
        }
    }
}

/// Reply style for text responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyMode {
    Reply,
    ReplyWithPing,
}

/// One automated action bound to a trigger, with its payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    Text { text: String },
    RandomText { choices: Vec<String> },
    Dm { text: String },
    DmMe { text: String },
    Rename { nickname: String },
    Image { image: String },
    RandomImage { images: Vec<String> },
    ImageText { image: String, text: String },
    Resize { image: String },
    Ban,
    Kick,
    React { emojis: Vec<String> },
    Publish,
    Command { command: String },
    Mock { command: String },
    Delete,
    AddRole { roles: Vec<RoleId> },
    RemoveRole { roles: Vec<RoleId> },
}

/// Payload-free discriminant of [`Action`], plus the composite `Multi`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Text,
    RandomText,
    Dm,
    DmMe,
    Rename,
    Image,
    RandomImage,
    ImageText,
    Resize,
    Ban,
    Kick,
    React,
    Publish,
    Command,
    Mock,
    Delete,
    AddRole,
    RemoveRole,
    Multi,
}

impl ActionKind {
    /// Kinds allowed inside a multi trigger
    pub fn allowed_in_multi(self) -> bool {
        matches!(
            self,
            ActionKind::Text
                | ActionKind::Dm
                | ActionKind::DmMe
                | ActionKind::Rename
                | ActionKind::Ban
                | ActionKind::Kick
                | ActionKind::React
                | ActionKind::Command
                | ActionKind::Delete
                | ActionKind::AddRole
                | ActionKind::RemoveRole
        )
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionKind::Text => "text",
            ActionKind::RandomText => "random_text",
            ActionKind::Dm => "dm",
            ActionKind::DmMe => "dm_me",
            ActionKind::Rename => "rename",
            ActionKind::Image => "image",
            ActionKind::RandomImage => "random_image",
            ActionKind::ImageText => "image_text",
            ActionKind::Resize => "resize",
            ActionKind::Ban => "ban",
            ActionKind::Kick => "kick",
            ActionKind::React => "react",
            ActionKind::Publish => "publish",
            ActionKind::Command => "command",
            ActionKind::Mock => "mock",
            ActionKind::Delete => "delete",
            ActionKind::AddRole => "add_role",
            ActionKind::RemoveRole => "remove_role",
            ActionKind::Multi => "multi",
        };
        f.write_str(name)
    }
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Text { .. } => ActionKind::Text,
            Action::RandomText { .. } => ActionKind::RandomText,
            Action::Dm { .. } => ActionKind::Dm,
            Action::DmMe { .. } => ActionKind::DmMe,
            Action::Rename { .. } => ActionKind::Rename,
            Action::Image { .. } => ActionKind::Image,
            Action::RandomImage { .. } => ActionKind::RandomImage,
            Action::ImageText { .. } => ActionKind::ImageText,
            Action::Resize { .. } => ActionKind::Resize,
            Action::Ban => ActionKind::Ban,
            Action::Kick => ActionKind::Kick,
            Action::React { .. } => ActionKind::React,
            Action::Publish => ActionKind::Publish,
            Action::Command { .. } => ActionKind::Command,
            Action::Mock { .. } => ActionKind::Mock,
            Action::Delete => ActionKind::Delete,
            Action::AddRole { .. } => ActionKind::AddRole,
            Action::RemoveRole { .. } => ActionKind::RemoveRole,
        }
    }

    /// Whether the action posts a message that `delete_after` can remove
    pub fn posts_response(&self) -> bool {
        matches!(
            self,
            Action::Text { .. }
                | Action::RandomText { .. }
                | Action::Image { .. }
                | Action::RandomImage { .. }
                | Action::ImageText { .. }
                | Action::Resize { .. }
        )
    }

    /// Check the payload is usable; called at construction and on every edit
    pub fn validate(&self) -> Result<(), String> {
        fn non_empty(field: &str, value: &str) -> Result<(), String> {
            if value.trim().is_empty() {
                Err(format!("{} must not be empty", field))
            } else {
                Ok(())
            }
        }
        fn non_empty_list<T>(field: &str, values: &[T]) -> Result<(), String> {
            if values.is_empty() {
                Err(format!("{} must contain at least one entry", field))
            } else {
                Ok(())
            }
        }

        match self {
            Action::Text { text } | Action::Dm { text } | Action::DmMe { text } => non_empty("text", text),
            Action::RandomText { choices } => {
                non_empty_list("choices", choices)?;
                choices.iter().try_for_each(|c| non_empty("choice", c))
            }
            Action::Rename { nickname } => {
                non_empty("nickname", nickname)?;
                if nickname.chars().count() > 32 {
                    return Err("nickname must be 32 characters or fewer".to_string());
                }
                Ok(())
            }
            Action::Image { image } | Action::Resize { image } => non_empty("image", image),
            Action::RandomImage { images } => {
                non_empty_list("images", images)?;
                images.iter().try_for_each(|i| non_empty("image", i))
            }
            Action::ImageText { image, text } => {
                non_empty("image", image)?;
                non_empty("text", text)
            }
            Action::React { emojis } => {
                non_empty_list("emojis", emojis)?;
                emojis.iter().try_for_each(|e| non_empty("emoji", e))
            }
            Action::Command { command } | Action::Mock { command } => non_empty("command", command),
            Action::AddRole { roles } | Action::RemoveRole { roles } => non_empty_list("roles", roles),
            Action::Ban | Action::Kick | Action::Publish | Action::Delete => Ok(()),
        }
    }
}
