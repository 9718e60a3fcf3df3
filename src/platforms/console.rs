use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;

use crate::platforms::{ActionSurface, Authority, ImageProcessor, OutgoingMessage};
use crate::types::{Attachment, ChannelId, GuildId, MessageId, RoleId, TriggerEvent, UserId};

/// Forward newline-delimited JSON events from `reader` until it closes.
/// Returns the number of events delivered.
pub async fn read_events<R>(reader: R, sender: mpsc::Sender<TriggerEvent>) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut delivered = 0;

    while let Some(line) = lines.next_line().await.context("Failed to read event stream")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<TriggerEvent>(line) {
            Ok(event) => {
                if sender.send(event).await.is_err() {
                    debug!("Event receiver closed, stopping reader");
                    break;
                }
                delivered += 1;
            }
            Err(e) => warn!("Skipping malformed event: {}", e),
        }
    }

    Ok(delivered)
}

/// One side effect requested from the surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceCall {
    Send { guild_id: GuildId, message: OutgoingMessage },
    Dm { user_id: UserId, content: String },
    Delete { channel_id: ChannelId, message_id: MessageId },
    React { message_id: MessageId, emoji: String },
    Publish { message_id: MessageId },
    Nickname { user_id: UserId, nickname: String },
    AddRoles { user_id: UserId, roles: Vec<RoleId> },
    RemoveRoles { user_id: UserId, roles: Vec<RoleId> },
    Ban { user_id: UserId, reason: String },
    Kick { user_id: UserId, reason: String },
    Command { command: String, invoker: UserId },
}

impl SurfaceCall {
    fn label(&self) -> &'static str {
        match self {
            SurfaceCall::Send { .. } => "send",
            SurfaceCall::Dm { .. } => "dm",
            SurfaceCall::Delete { .. } => "delete",
            SurfaceCall::React { .. } => "react",
            SurfaceCall::Publish { .. } => "publish",
            SurfaceCall::Nickname { .. } => "nickname",
            SurfaceCall::AddRoles { .. } => "add_roles",
            SurfaceCall::RemoveRoles { .. } => "remove_roles",
            SurfaceCall::Ban { .. } => "ban",
            SurfaceCall::Kick { .. } => "kick",
            SurfaceCall::Command { .. } => "command",
        }
    }
}

/// Surface that performs nothing and logs every request.
///
/// With recording enabled it also keeps the calls, and individual operations
/// or authorities can be made to fail.
#[derive(Default)]
pub struct DryRunSurface {
    record: bool,
    calls: Mutex<Vec<SurfaceCall>>,
    failing: Mutex<HashSet<&'static str>>,
    denied: Mutex<HashSet<Authority>>,
    next_message_id: AtomicU64,
}

impl DryRunSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recording() -> Self {
        Self {
            record: true,
            ..Self::default()
        }
    }

    /// Make every call with this label (`"ban"`, `"send"`, ...) fail
    pub fn fail_on(&self, label: &'static str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(label);
        }
    }

    pub fn deny(&self, authority: Authority) {
        if let Ok(mut denied) = self.denied.lock() {
            denied.insert(authority);
        }
    }

    pub fn calls(&self) -> Vec<SurfaceCall> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    fn perform(&self, call: SurfaceCall) -> Result<()> {
        let label = call.label();
        let fails = self.failing.lock().map(|f| f.contains(label)).unwrap_or(false);
        if fails {
            anyhow::bail!("{} rejected by platform", label);
        }

        info!("[dry-run] {:?}", call);
        if self.record {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(call);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ActionSurface for DryRunSurface {
    async fn send_message(&self, guild_id: GuildId, message: OutgoingMessage) -> Result<MessageId> {
        self.perform(SurfaceCall::Send { guild_id, message })?;
        Ok(self.next_message_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    async fn send_dm(&self, user_id: UserId, content: &str) -> Result<()> {
        self.perform(SurfaceCall::Dm {
            user_id,
            content: content.to_string(),
        })
    }

    async fn delete_message(&self, channel_id: ChannelId, message_id: MessageId) -> Result<()> {
        self.perform(SurfaceCall::Delete { channel_id, message_id })
    }

    async fn add_reaction(&self, _channel_id: ChannelId, message_id: MessageId, emoji: &str) -> Result<()> {
        self.perform(SurfaceCall::React {
            message_id,
            emoji: emoji.to_string(),
        })
    }

    async fn publish_message(&self, _channel_id: ChannelId, message_id: MessageId) -> Result<()> {
        self.perform(SurfaceCall::Publish { message_id })
    }

    async fn change_nickname(&self, _guild_id: GuildId, user_id: UserId, nickname: &str) -> Result<()> {
        self.perform(SurfaceCall::Nickname {
            user_id,
            nickname: nickname.to_string(),
        })
    }

    async fn add_roles(&self, _guild_id: GuildId, user_id: UserId, roles: &[RoleId]) -> Result<()> {
        self.perform(SurfaceCall::AddRoles {
            user_id,
            roles: roles.to_vec(),
        })
    }

    async fn remove_roles(&self, _guild_id: GuildId, user_id: UserId, roles: &[RoleId]) -> Result<()> {
        self.perform(SurfaceCall::RemoveRoles {
            user_id,
            roles: roles.to_vec(),
        })
    }

    async fn ban(&self, _guild_id: GuildId, user_id: UserId, reason: &str) -> Result<()> {
        self.perform(SurfaceCall::Ban {
            user_id,
            reason: reason.to_string(),
        })
    }

    async fn kick(&self, _guild_id: GuildId, user_id: UserId, reason: &str) -> Result<()> {
        self.perform(SurfaceCall::Kick {
            user_id,
            reason: reason.to_string(),
        })
    }

    async fn invoke_command(&self, _event: &TriggerEvent, command: &str, invoker: UserId) -> Result<()> {
        self.perform(SurfaceCall::Command {
            command: command.to_string(),
            invoker,
        })
    }

    async fn check_authority(&self, _guild_id: GuildId, _target: UserId, authority: Authority) -> Result<bool> {
        Ok(!self.denied.lock().map(|d| d.contains(&authority)).unwrap_or(false))
    }

    fn platform_name(&self) -> &str {
        "console"
    }
}

/// Image processor for the console platform: images pass through unchanged
/// and OCR uses the attachment filename as a stand-in for recognised text
#[derive(Debug, Default)]
pub struct PassthroughImages;

#[async_trait]
impl ImageProcessor for PassthroughImages {
    async fn resize(&self, image: &str, match_len: usize) -> Result<String> {
        debug!("[dry-run] resize {} to scale {}", image, match_len);
        Ok(image.to_string())
    }

    async fn ocr(&self, attachment: &Attachment) -> Result<String> {
        Ok(attachment
            .filename
            .rsplit_once('.')
            .map_or(attachment.filename.as_str(), |(stem, _)| stem)
            .replace(['_', '-'], " "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_read_events_skips_malformed_lines() {
        let input = concat!(
            r#"{"guild_id":1,"message_id":2,"channel_id":3,"author":{"id":4,"name":"a"},"content":"hi"}"#,
            "\nnot json\n\n",
            r#"{"guild_id":1,"message_id":5,"channel_id":3,"author":{"id":4,"name":"a"},"content":"yo","is_edit":true}"#,
            "\n"
        );
        let (tx, mut rx) = mpsc::channel(8);
        let delivered = read_events(BufReader::new(Cursor::new(input)), tx).await.unwrap();
        assert_eq!(delivered, 2);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.content, "hi");
        assert!(!first.is_edit);
        assert!(rx.recv().await.unwrap().is_edit);
    }

    #[tokio::test]
    async fn test_dry_run_surface_records_and_fails() {
        let surface = DryRunSurface::recording();
        surface.fail_on("ban");
        surface.deny(Authority::Kick);

        assert!(surface.ban(1, 2, "x").await.is_err());
        assert!(surface.delete_message(3, 4).await.is_ok());
        assert!(!surface.check_authority(1, 2, Authority::Kick).await.unwrap());
        assert!(surface.check_authority(1, 2, Authority::Ban).await.unwrap());
        assert_eq!(surface.calls(), vec![SurfaceCall::Delete { channel_id: 3, message_id: 4 }]);
    }

    #[tokio::test]
    async fn test_passthrough_ocr_uses_filename() {
        let attachment = Attachment {
            filename: "big_foo-sign.png".to_string(),
            url: String::new(),
            image: true,
        };
        assert_eq!(PassthroughImages.ocr(&attachment).await.unwrap(), "big foo sign");
    }
}
