// src/bot/dispatcher.rs - Executes the actions of a matched trigger

use log::{debug, info, warn};
use rand::seq::IndexedRandom;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;

use crate::bot::trigger::Trigger;
use crate::error::TriggerError;
use crate::platforms::{ActionSurface, AllowedMentions, Authority, ImageProcessor, OutgoingMessage};
use crate::types::{Action, ActionKind, ChannelId, GuildId, MatchResult, MessageId, ReplyMode, TriggerEvent};

const MAX_NICKNAME_CHARS: usize = 32;

#[derive(Debug)]
pub struct ActionOutcome {
    pub kind: ActionKind,
    pub result: Result<(), TriggerError>,
}

/// Per-action results of one trigger firing
#[derive(Debug)]
pub struct DispatchReport {
    pub guild_id: GuildId,
    pub trigger: String,
    pub outcomes: Vec<ActionOutcome>,
}

impl DispatchReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ActionOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }
}

/// Substitute `$(...)` variables in a moderator-written payload
pub fn render_template(template: &str, event: &TriggerEvent, found: &MatchResult) -> String {
    if !template.contains("$(") {
        return template.to_string();
    }

    let mut rendered = template
        .replace("$(user)", &event.author.name)
        .replace("$(displayname)", event.author.display())
        .replace("$(mention)", &format!("<@{}>", event.author.id))
        .replace("$(channel)", &format!("<#{}>", event.channel_id))
        .replace("$(match)", &found.matched);

    for n in 1..=9 {
        let value = found.groups.get(n - 1).and_then(|g| g.as_deref()).unwrap_or("");
        rendered = rendered.replace(&format!("$({})", n), value);
    }
    rendered
}

/// Pending removals of posted responses, cancellable until they run
#[derive(Default)]
pub struct DeletionScheduler {
    pending: Arc<Mutex<HashMap<(ChannelId, MessageId), AbortHandle>>>,
}

impl DeletionScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn schedule(&self, surface: Arc<dyn ActionSurface>, channel_id: ChannelId, message_id: MessageId, after: Duration) {
        let key = (channel_id, message_id);
        let pending = Arc::clone(&self.pending);
        let mut guard = self.pending.lock().await;

        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            // Removing first means a late cancel finds nothing to abort mid-delete
            pending.lock().await.remove(&key);
            match surface.delete_message(channel_id, message_id).await {
                Ok(()) => debug!("Deleted response {} in channel {}", message_id, channel_id),
                Err(e) => warn!("Failed to delete response {} in channel {}: {}", message_id, channel_id, e),
            }
        });

        if let Some(previous) = guard.insert(key, task.abort_handle()) {
            previous.abort();
        }
    }

    /// Returns whether a pending deletion was cancelled
    pub async fn cancel(&self, channel_id: ChannelId, message_id: MessageId) -> bool {
        match self.pending.lock().await.remove(&(channel_id, message_id)) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub async fn cancel_all(&self) -> usize {
        let mut pending = self.pending.lock().await;
        let count = pending.len();
        for (_, handle) in pending.drain() {
            handle.abort();
        }
        if count > 0 {
            info!("Cancelled {} pending response deletions", count);
        }
        count
    }

    pub async fn pending(&self) -> usize {
        self.pending.lock().await.len()
    }
}

pub struct ActionDispatcher {
    surface: Arc<dyn ActionSurface>,
    images: Arc<dyn ImageProcessor>,
    deletions: DeletionScheduler,
}

impl ActionDispatcher {
    pub fn new(surface: Arc<dyn ActionSurface>, images: Arc<dyn ImageProcessor>) -> Self {
        Self {
            surface,
            images,
            deletions: DeletionScheduler::new(),
        }
    }

    pub fn deletions(&self) -> &DeletionScheduler {
        &self.deletions
    }

    /// Run every action of `trigger` in order. A failing action is recorded
    /// and the remaining actions still run.
    pub async fn execute(&self, trigger: &Trigger, found: &MatchResult, event: &TriggerEvent) -> DispatchReport {
        let mut outcomes = Vec::with_capacity(trigger.actions.len());

        for action in &trigger.actions {
            let result = self.run_action(trigger, action, found, event).await;
            if let Err(e) = &result {
                warn!("Trigger '{}' in guild {}: {}", trigger.name, event.guild_id, e);
            }
            outcomes.push(ActionOutcome {
                kind: action.kind(),
                result,
            });
        }

        let report = DispatchReport {
            guild_id: event.guild_id,
            trigger: trigger.name.clone(),
            outcomes,
        };
        info!(
            "Trigger '{}' fired in guild {} ({}/{} actions succeeded)",
            trigger.name,
            event.guild_id,
            report.succeeded(),
            report.outcomes.len()
        );
        report
    }

    async fn run_action(&self, trigger: &Trigger, action: &Action, found: &MatchResult, event: &TriggerEvent) -> Result<(), TriggerError> {
        let kind = action.kind();
        let failed = |e: anyhow::Error| TriggerError::ActionFailed {
            trigger: trigger.name.clone(),
            kind,
            reason: format!("{:#}", e),
        };
        let guild_id = event.guild_id;
        let author_id = event.author.id;

        match action {
            Action::Text { text } => {
                let content = render_template(text, event, found);
                self.respond(trigger, event, Some(content), None).await.map_err(failed)
            }
            Action::RandomText { choices } => {
                let choice = choices.choose(&mut rand::rng()).cloned().unwrap_or_default();
                let content = render_template(&choice, event, found);
                self.respond(trigger, event, Some(content), None).await.map_err(failed)
            }
            Action::Dm { text } => {
                let content = render_template(text, event, found);
                self.surface.send_dm(author_id, &content).await.map_err(failed)
            }
            Action::DmMe { text } => {
                let content = render_template(text, event, found);
                self.surface.send_dm(trigger.author_id, &content).await.map_err(failed)
            }
            Action::Rename { nickname } => {
                self.require(trigger, event, Authority::ManageNicknames).await?;
                let nickname: String = render_template(nickname, event, found)
                    .chars()
                    .take(MAX_NICKNAME_CHARS)
                    .collect();
                self.surface
                    .change_nickname(guild_id, author_id, &nickname)
                    .await
                    .map_err(failed)
            }
            Action::Image { image } => self.respond(trigger, event, None, Some(image.clone())).await.map_err(failed),
            Action::RandomImage { images } => {
                let image = images.choose(&mut rand::rng()).cloned();
                self.respond(trigger, event, None, image).await.map_err(failed)
            }
            Action::ImageText { image, text } => {
                let content = render_template(text, event, found);
                self.respond(trigger, event, Some(content), Some(image.clone()))
                    .await
                    .map_err(failed)
            }
            Action::Resize { image } => {
                let resized = self.images.resize(image, found.char_len()).await.map_err(failed)?;
                self.respond(trigger, event, None, Some(resized)).await.map_err(failed)
            }
            Action::Ban => {
                self.require(trigger, event, Authority::Ban).await?;
                let reason = moderation_reason(trigger);
                self.surface.ban(guild_id, author_id, &reason).await.map_err(failed)
            }
            Action::Kick => {
                self.require(trigger, event, Authority::Kick).await?;
                let reason = moderation_reason(trigger);
                self.surface.kick(guild_id, author_id, &reason).await.map_err(failed)
            }
            Action::React { emojis } => {
                let mut first_error = None;
                for emoji in emojis {
                    if let Err(e) = self.surface.add_reaction(event.channel_id, event.message_id, emoji).await {
                        first_error.get_or_insert(e);
                    }
                }
                first_error.map_or(Ok(()), |e| Err(failed(e)))
            }
            Action::Publish => self
                .surface
                .publish_message(event.channel_id, event.message_id)
                .await
                .map_err(failed),
            Action::Command { command } => {
                let command = render_template(command, event, found);
                self.surface.invoke_command(event, &command, author_id).await.map_err(failed)
            }
            Action::Mock { command } => {
                let command = render_template(command, event, found);
                self.surface
                    .invoke_command(event, &command, trigger.author_id)
                    .await
                    .map_err(failed)
            }
            Action::Delete => self
                .surface
                .delete_message(event.channel_id, event.message_id)
                .await
                .map_err(failed),
            Action::AddRole { roles } => {
                self.require(trigger, event, Authority::ManageRoles).await?;
                self.surface.add_roles(guild_id, author_id, roles).await.map_err(failed)
            }
            Action::RemoveRole { roles } => {
                self.require(trigger, event, Authority::ManageRoles).await?;
                self.surface.remove_roles(guild_id, author_id, roles).await.map_err(failed)
            }
        }
    }

    /// Re-check the bot's authority over the author right before acting
    async fn require(&self, trigger: &Trigger, event: &TriggerEvent, authority: Authority) -> Result<(), TriggerError> {
        let denied = |reason: String| TriggerError::AuthorizationDenied {
            trigger: trigger.name.clone(),
            reason,
        };
        match self.surface.check_authority(event.guild_id, event.author.id, authority).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(denied(format!("cannot {} for user {}", authority, event.author.id))),
            Err(e) => Err(denied(format!("authority check failed: {:#}", e))),
        }
    }

    async fn respond(
        &self,
        trigger: &Trigger,
        event: &TriggerEvent,
        content: Option<String>,
        image: Option<String>,
    ) -> anyhow::Result<()> {
        let flags = &trigger.flags;
        let message = OutgoingMessage {
            channel_id: event.channel_id,
            content,
            image,
            reply_to: flags.reply.map(|_| event.message_id),
            tts: flags.tts,
            allowed_mentions: AllowedMentions {
                users: flags.user_mention,
                everyone: flags.everyone_mention,
                roles: flags.role_mention,
                replied_user: flags.reply == Some(ReplyMode::ReplyWithPing),
            },
        };

        let posted = self.surface.send_message(event.guild_id, message).await?;
        if let Some(after) = trigger.delete_after {
            self.deletions
                .schedule(Arc::clone(&self.surface), event.channel_id, posted, after)
                .await;
        }
        Ok(())
    }
}

fn moderation_reason(trigger: &Trigger) -> String {
    format!("Trigger `{}` matched (pattern `{}`)", trigger.name, trigger.pattern.source())
}
