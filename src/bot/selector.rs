// src/bot/selector.rs - Candidate filtering, matching and gating for one event

use chrono::Utc;
use futures_util::future::join_all;
use log::{debug, error, warn};
use rand::Rng;
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::bot::cooldown::CooldownLedger;
use crate::bot::matcher::{BoundedMatcher, MatchError, MatchLimit};
use crate::bot::trigger::{Trigger, TriggerFlags};
use crate::platforms::ImageProcessor;
use crate::types::{MatchResult, TriggerEvent};

/// A trigger that passed every gate for an event, with its match
#[derive(Debug, Clone)]
pub struct TriggerMatch {
    pub trigger: Arc<Trigger>,
    pub result: MatchResult,
}

/// Per-guild evaluation options
#[derive(Debug, Clone, Copy)]
pub struct SelectOptions {
    pub allow_multiple: bool,
    pub limit: MatchLimit,
}

/// Fire with probability 1/chance; a chance of 0 always fires
pub fn roll_chance<R: Rng + ?Sized>(chance: u32, rng: &mut R) -> bool {
    chance == 0 || rng.random_range(0..chance) == 0
}

/// Cheap checks that need neither the matcher nor the ledger
fn passes_filters(trigger: &Trigger, event: &TriggerEvent) -> bool {
    if !trigger.enabled {
        return false;
    }
    if trigger.flags.nsfw && !event.channel_nsfw {
        return false;
    }
    if event.scope_ids().any(|id| trigger.deny_list.contains(&id)) {
        return false;
    }
    if !trigger.allow_list.is_empty() && !event.scope_ids().any(|id| trigger.allow_list.contains(&id)) {
        return false;
    }
    if event.is_command && trigger.flags.ignore_commands {
        return false;
    }
    if event.is_edit && !trigger.flags.check_edits {
        return false;
    }
    true
}

/// Builds the searchable text; OCR runs at most once per event
struct SearchText<'a> {
    event: &'a TriggerEvent,
    images: &'a dyn ImageProcessor,
    ocr: OnceCell<String>,
}

impl<'a> SearchText<'a> {
    fn new(event: &'a TriggerEvent, images: &'a dyn ImageProcessor) -> Self {
        Self {
            event,
            images,
            ocr: OnceCell::new(),
        }
    }

    async fn ocr_text(&self) -> &str {
        self.ocr
            .get_or_init(|| async {
                let mut parts = Vec::new();
                for attachment in self.event.attachments.iter().filter(|a| a.image) {
                    match self.images.ocr(attachment).await {
                        Ok(text) if !text.trim().is_empty() => parts.push(text),
                        Ok(_) => {}
                        Err(e) => warn!("OCR failed for {}: {}", attachment.filename, e),
                    }
                }
                parts.join(" ")
            })
            .await
    }

    async fn for_flags(&self, flags: &TriggerFlags) -> String {
        let mut text = self.event.content.clone();
        if flags.read_filenames && !self.event.attachments.is_empty() {
            let names: Vec<&str> = self.event.attachments.iter().map(|a| a.filename.as_str()).collect();
            text.push(' ');
            text.push_str(&names.join(" "));
        }
        if flags.ocr_search {
            let ocr = self.ocr_text().await;
            if !ocr.is_empty() {
                text.push(' ');
                text.push_str(ocr);
            }
        }
        text
    }
}

pub struct TriggerSelector {
    matcher: Arc<dyn BoundedMatcher>,
    ledger: Arc<CooldownLedger>,
    images: Arc<dyn ImageProcessor>,
}

impl TriggerSelector {
    pub fn new(matcher: Arc<dyn BoundedMatcher>, ledger: Arc<CooldownLedger>, images: Arc<dyn ImageProcessor>) -> Self {
        Self { matcher, ledger, images }
    }

    /// Triggers that fire for `event`, in evaluation order.
    ///
    /// `triggers` must already be in creation order. Without `allow_multiple`
    /// at most one trigger is returned and evaluation stops at the first hit;
    /// with it every candidate is matched concurrently.
    pub async fn select(&self, event: &TriggerEvent, triggers: &[Arc<Trigger>], options: SelectOptions) -> Vec<TriggerMatch> {
        if event.author.bot {
            return Vec::new();
        }

        let search = SearchText::new(event, self.images.as_ref());
        let candidates: Vec<&Arc<Trigger>> = triggers.iter().filter(|t| passes_filters(t, event)).collect();

        if options.allow_multiple {
            join_all(candidates.into_iter().map(|t| self.evaluate(event, t, &search, options.limit)))
                .await
                .into_iter()
                .flatten()
                .collect()
        } else {
            for trigger in candidates {
                if let Some(found) = self.evaluate(event, trigger, &search, options.limit).await {
                    return vec![found];
                }
            }
            Vec::new()
        }
    }

    async fn evaluate(
        &self,
        event: &TriggerEvent,
        trigger: &Arc<Trigger>,
        search: &SearchText<'_>,
        limit: MatchLimit,
    ) -> Option<TriggerMatch> {
        let scope_key = trigger
            .cooldown
            .map(|spec| CooldownLedger::scope_key(spec.style, event))
            .unwrap_or(event.guild_id);

        if !self.ledger.allow(event.guild_id, trigger, scope_key, Utc::now()).await {
            debug!("Trigger '{}' skipped: cooling down", trigger.name);
            return None;
        }

        let text = search.for_flags(&trigger.flags).await;
        let result = match self.matcher.find(&trigger.pattern, &text, limit).await {
            Ok(Some(result)) => result,
            Ok(None) => return None,
            Err(MatchError::TimedOut(after)) => {
                warn!(
                    "Trigger '{}' in guild {} timed out after {:?}; treated as no match",
                    trigger.name, event.guild_id, after
                );
                return None;
            }
            Err(e) => {
                error!("Trigger '{}' in guild {} could not be matched: {}", trigger.name, event.guild_id, e);
                return None;
            }
        };

        if !roll_chance(trigger.chance, &mut rand::rng()) {
            debug!("Trigger '{}' matched but lost the 1/{} roll", trigger.name, trigger.chance);
            return None;
        }

        if !self.ledger.try_consume(event.guild_id, trigger, scope_key, Utc::now()).await {
            debug!("Trigger '{}' lost its cooldown slot to a concurrent event", trigger.name);
            return None;
        }

        Some(TriggerMatch {
            trigger: Arc::clone(trigger),
            result,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::matcher::InlineMatcher;
    use crate::bot::pattern::{Pattern, PatternCompiler};
    use crate::bot::trigger::{FlagEdit, NewTrigger, TriggerEdit};
    use crate::platforms::console::PassthroughImages;
    use crate::types::{Action, Attachment, Author, CooldownStyle};
    use async_trait::async_trait;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::time::Duration;

    const LIMIT: MatchLimit = MatchLimit::Timeout(Duration::from_secs(1));

    fn trigger(name: &str, pattern: &str, created_at: u64, edits: Vec<TriggerEdit>) -> Arc<Trigger> {
        let compiler = PatternCompiler::default();
        let mut trigger = Trigger::build(
            NewTrigger {
                name: name.to_string(),
                pattern: pattern.to_string(),
                actions: vec![Action::Delete],
                author_id: 1,
                created_at,
            },
            &compiler,
        )
        .unwrap();
        for edit in edits {
            trigger = trigger.apply_edit(edit, &compiler).unwrap();
        }
        Arc::new(trigger)
    }

    fn event(content: &str) -> TriggerEvent {
        TriggerEvent {
            guild_id: 1,
            message_id: 100,
            channel_id: 10,
            channel_nsfw: false,
            author: Author {
                id: 20,
                name: "someone".to_string(),
                display_name: None,
                roles: vec![30],
                bot: false,
            },
            content: content.to_string(),
            attachments: Vec::new(),
            is_edit: false,
            is_command: false,
            timestamp: Utc::now(),
        }
    }

    fn selector_with(matcher: Arc<dyn BoundedMatcher>) -> TriggerSelector {
        TriggerSelector::new(matcher, Arc::new(CooldownLedger::new()), Arc::new(PassthroughImages))
    }

    fn selector() -> TriggerSelector {
        selector_with(Arc::new(InlineMatcher))
    }

    fn single() -> SelectOptions {
        SelectOptions {
            allow_multiple: false,
            limit: LIMIT,
        }
    }

    fn names(found: &[TriggerMatch]) -> Vec<&str> {
        found.iter().map(|m| m.trigger.name.as_str()).collect()
    }

    #[test]
    fn test_chance_rate() {
        let mut rng = StdRng::seed_from_u64(42);
        let fired = (0..100_000).filter(|_| roll_chance(10, &mut rng)).count();
        assert!((9_500..=10_500).contains(&fired), "fired {} times", fired);

        assert!((0..100).all(|_| roll_chance(0, &mut rng)));
        assert!((0..100).all(|_| roll_chance(1, &mut rng)));
    }

    #[tokio::test]
    async fn test_deny_wins_over_allow() {
        let both = trigger(
            "both",
            "foo",
            1,
            vec![TriggerEdit::AllowAdd(vec![20]), TriggerEdit::DenyAdd(vec![20])],
        );
        assert!(selector().select(&event("foo"), &[both], single()).await.is_empty());

        let role_denied = trigger("role", "foo", 1, vec![TriggerEdit::DenyAdd(vec![30])]);
        assert!(selector().select(&event("foo"), &[role_denied], single()).await.is_empty());

        let elsewhere = trigger("elsewhere", "foo", 1, vec![TriggerEdit::AllowAdd(vec![11])]);
        assert!(selector().select(&event("foo"), &[elsewhere], single()).await.is_empty());

        let here = trigger("here", "foo", 1, vec![TriggerEdit::AllowAdd(vec![10])]);
        assert_eq!(names(&selector().select(&event("foo"), &[here], single()).await), vec!["here"]);
    }

    #[tokio::test]
    async fn test_event_kind_filters() {
        let disabled = trigger("off", "foo", 1, vec![TriggerEdit::Enabled(false)]);
        let nsfw = trigger("nsfw", "foo", 2, vec![TriggerEdit::Flag(FlagEdit::Nsfw(true))]);
        let no_commands = trigger("nocmd", "foo", 3, vec![TriggerEdit::Flag(FlagEdit::IgnoreCommands(true))]);
        let triggers = vec![disabled, nsfw, no_commands];
        let selector = selector();

        let mut command = event("foo");
        command.is_command = true;
        assert!(selector.select(&command, &triggers, single()).await.is_empty());

        let mut nsfw_channel = event("foo");
        nsfw_channel.channel_nsfw = true;
        assert_eq!(names(&selector.select(&nsfw_channel, &triggers, single()).await), vec!["nsfw"]);

        let mut edit = event("foo");
        edit.is_edit = true;
        assert!(selector.select(&edit, &triggers, single()).await.is_empty());

        let mut bot = event("foo");
        bot.author.bot = true;
        assert!(selector.select(&bot, &triggers, single()).await.is_empty());

        // The same kinds of event reach triggers that opt in
        let edits = trigger("edits", "foo", 4, vec![TriggerEdit::Flag(FlagEdit::CheckEdits(true))]);
        let plain = trigger("plain", "foo", 5, vec![]);
        let triggers = vec![Arc::clone(&triggers[2]), edits, plain];
        let every = SelectOptions {
            allow_multiple: true,
            limit: LIMIT,
        };

        assert_eq!(names(&selector.select(&edit, &triggers, every).await), vec!["edits"]);
        assert_eq!(names(&selector.select(&command, &triggers, every).await), vec!["edits", "plain"]);
        assert_eq!(names(&selector.select(&event("foo"), &triggers, every).await), vec!["nocmd", "edits", "plain"]);
    }

    #[tokio::test]
    async fn test_first_match_wins_unless_multiple_allowed() {
        let triggers = vec![
            trigger("later", "foo", 20, vec![]),
            trigger("first", "fo+", 10, vec![]),
            trigger("miss", "bar", 15, vec![]),
        ];
        let mut ordered = triggers.clone();
        ordered.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

        let found = selector().select(&event("foo"), &ordered, single()).await;
        assert_eq!(names(&found), vec!["first"]);
        assert_eq!(found[0].result.matched, "foo");

        let options = SelectOptions {
            allow_multiple: true,
            limit: LIMIT,
        };
        let found = selector().select(&event("foo"), &ordered, options).await;
        assert_eq!(names(&found), vec!["first", "later"]);
    }

    #[tokio::test]
    async fn test_filenames_and_ocr_extend_search_text() {
        let mut with_file = event("look");
        with_file.attachments.push(Attachment {
            filename: "secret_code.png".to_string(),
            url: String::new(),
            image: true,
        });

        let plain = trigger("plain", "secret", 1, vec![]);
        assert!(selector().select(&with_file, &[plain], single()).await.is_empty());

        let filenames = trigger("files", r"^look secret_code\.png$", 1, vec![TriggerEdit::Flag(FlagEdit::ReadFilenames(true))]);
        assert_eq!(names(&selector().select(&with_file, &[filenames], single()).await), vec!["files"]);

        let ocr = trigger("ocr", r"^look secret code$", 1, vec![TriggerEdit::Flag(FlagEdit::OcrSearch(true))]);
        assert_eq!(names(&selector().select(&with_file, &[ocr], single()).await), vec!["ocr"]);
    }

    #[tokio::test]
    async fn test_cooldown_consumed_once_per_window() {
        let cooled = trigger(
            "cd",
            "foo",
            1,
            vec![TriggerEdit::Cooldown {
                seconds: 60,
                style: CooldownStyle::Channel,
            }],
        );
        let selector = selector();
        let triggers = vec![cooled];

        assert_eq!(selector.select(&event("foo"), &triggers, single()).await.len(), 1);
        assert!(selector.select(&event("foo"), &triggers, single()).await.is_empty());

        let mut other_channel = event("foo");
        other_channel.channel_id = 11;
        assert_eq!(selector.select(&other_channel, &triggers, single()).await.len(), 1);
    }

    struct StallingMatcher;

    #[async_trait]
    impl BoundedMatcher for StallingMatcher {
        async fn find(&self, pattern: &Pattern, text: &str, limit: MatchLimit) -> Result<Option<MatchResult>, MatchError> {
            if pattern.source() == "stall" {
                return Err(MatchError::TimedOut(Duration::from_secs(1)));
            }
            InlineMatcher.find(pattern, text, limit).await
        }
    }

    #[tokio::test]
    async fn test_timeout_is_treated_as_no_match() {
        let triggers = vec![trigger("slow", "stall", 1, vec![]), trigger("fast", "foo", 2, vec![])];
        let found = selector_with(Arc::new(StallingMatcher))
            .select(&event("foo"), &triggers, single())
            .await;
        assert_eq!(names(&found), vec!["fast"]);
    }
}
