// src/bot/trigger.rs - Trigger record, construction, edits and persisted form

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::bot::pattern::{Pattern, PatternCompiler};
use crate::error::TriggerError;
use crate::types::{Action, ActionKind, CooldownStyle, ReplyMode, RoleId, UserId};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerFlags {
    pub nsfw: bool,
    pub check_edits: bool,
    pub read_filenames: bool,
    pub ocr_search: bool,
    pub ignore_commands: bool,
    pub user_mention: bool,
    pub everyone_mention: bool,
    pub role_mention: bool,
    pub reply: Option<ReplyMode>,
    pub tts: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownSpec {
    /// Seconds between fires within one bucket
    pub time: u64,
    pub style: CooldownStyle,
}

impl CooldownSpec {
    pub fn duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.time as i64)
    }
}

/// Input to trigger construction
#[derive(Debug, Clone)]
pub struct NewTrigger {
    pub name: String,
    pub pattern: String,
    pub actions: Vec<Action>,
    pub author_id: UserId,
    pub created_at: u64,
}

/// A named rule binding a pattern to its actions.
///
/// Instances are shared behind `Arc` and never mutated in place: every edit
/// produces a new record that replaces the old one in the registry. Runtime
/// state (cooldown timestamps, fire counts) lives in the cooldown ledger.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub name: String,
    pub pattern: Pattern,
    pub actions: Vec<Action>,
    pub author_id: UserId,
    pub enabled: bool,
    pub created_at: u64,
    pub allow_list: Vec<u64>,
    pub deny_list: Vec<u64>,
    pub chance: u32,
    pub cooldown: Option<CooldownSpec>,
    pub delete_after: Option<Duration>,
    pub flags: TriggerFlags,
}

/// Field edits, one per dedicated edit operation
#[derive(Debug, Clone)]
pub enum TriggerEdit {
    Pattern(String),
    Text(String),
    Chance(i64),
    Cooldown { seconds: i64, style: CooldownStyle },
    DeleteAfter(Option<Duration>),
    AllowAdd(Vec<u64>),
    AllowRemove(Vec<u64>),
    DenyAdd(Vec<u64>),
    DenyRemove(Vec<u64>),
    Command(String),
    Roles(Vec<RoleId>),
    Reactions(Vec<String>),
    Enabled(bool),
    Flag(FlagEdit),
}

#[derive(Debug, Clone, Copy)]
pub enum FlagEdit {
    Nsfw(bool),
    CheckEdits(bool),
    ReadFilenames(bool),
    OcrSearch(bool),
    IgnoreCommands(bool),
    UserMention(bool),
    EveryoneMention(bool),
    RoleMention(bool),
    Reply(Option<ReplyMode>),
    Tts(bool),
}

impl Trigger {
    /// Validate and build a new trigger with default settings
    pub fn build(new: NewTrigger, compiler: &PatternCompiler) -> Result<Self, TriggerError> {
        validate_name(&new.name)?;
        validate_actions(&new.actions)?;
        let pattern = compiler.compile(&new.pattern)?;

        Ok(Self {
            name: new.name,
            pattern,
            actions: new.actions,
            author_id: new.author_id,
            enabled: true,
            created_at: new.created_at,
            allow_list: Vec::new(),
            deny_list: Vec::new(),
            chance: 0,
            cooldown: None,
            delete_after: None,
            flags: TriggerFlags::default(),
        })
    }

    pub fn kind(&self) -> ActionKind {
        match self.actions.as_slice() {
            [single] => single.kind(),
            _ => ActionKind::Multi,
        }
    }

    pub fn is_multi(&self) -> bool {
        self.actions.len() > 1
    }

    /// Evaluation order within a guild
    pub fn sort_key(&self) -> (u64, &str) {
        (self.created_at, &self.name)
    }

    /// Apply one edit, returning the replacement record
    pub fn apply_edit(&self, edit: TriggerEdit, compiler: &PatternCompiler) -> Result<Trigger, TriggerError> {
        let mut updated = self.clone();

        match edit {
            TriggerEdit::Pattern(source) => {
                updated.pattern = compiler.compile(&source)?;
            }
            TriggerEdit::Text(text) => {
                let action = updated.single_action_mut("text")?;
                match action {
                    Action::Text { text: t } | Action::Dm { text: t } | Action::DmMe { text: t } => *t = text,
                    Action::ImageText { text: t, .. } => *t = text,
                    other => return Err(self.not_editable(format!("{} triggers have no text", other.kind()))),
                }
            }
            TriggerEdit::Chance(chance) => {
                updated.chance = chance.clamp(0, u32::MAX as i64) as u32;
            }
            TriggerEdit::Cooldown { seconds, style } => {
                updated.cooldown = (seconds > 0).then(|| CooldownSpec { time: seconds as u64, style });
            }
            TriggerEdit::DeleteAfter(delete_after) => {
                if !self.actions.iter().any(Action::posts_response) {
                    return Err(self.not_editable("only text and image responses can be deleted"));
                }
                if let Some(after) = delete_after {
                    if after < Duration::from_secs(1) {
                        return Err(TriggerError::InvalidSetting(
                            "`delete_after` must be at least 1 second".to_string(),
                        ));
                    }
                }
                updated.delete_after = delete_after;
            }
            TriggerEdit::AllowAdd(ids) => extend_unique(&mut updated.allow_list, ids),
            TriggerEdit::AllowRemove(ids) => updated.allow_list.retain(|id| !ids.contains(id)),
            TriggerEdit::DenyAdd(ids) => extend_unique(&mut updated.deny_list, ids),
            TriggerEdit::DenyRemove(ids) => updated.deny_list.retain(|id| !ids.contains(id)),
            TriggerEdit::Command(command) => {
                match updated.single_action_mut("command")? {
                    Action::Command { command: c } | Action::Mock { command: c } => *c = command,
                    other => return Err(self.not_editable(format!("{} triggers have no command", other.kind()))),
                }
            }
            TriggerEdit::Roles(roles) => {
                match updated.single_action_mut("roles")? {
                    Action::AddRole { roles: r } | Action::RemoveRole { roles: r } => *r = roles,
                    other => return Err(self.not_editable(format!("{} triggers have no roles", other.kind()))),
                }
            }
            TriggerEdit::Reactions(emojis) => {
                match updated.single_action_mut("reactions")? {
                    Action::React { emojis: e } => *e = emojis,
                    other => return Err(self.not_editable(format!("{} triggers have no reactions", other.kind()))),
                }
            }
            TriggerEdit::Enabled(enabled) => updated.enabled = enabled,
            TriggerEdit::Flag(flag) => {
                let flags = &mut updated.flags;
                match flag {
                    FlagEdit::Nsfw(v) => flags.nsfw = v,
                    FlagEdit::CheckEdits(v) => flags.check_edits = v,
                    FlagEdit::ReadFilenames(v) => flags.read_filenames = v,
                    FlagEdit::OcrSearch(v) => flags.ocr_search = v,
                    FlagEdit::IgnoreCommands(v) => flags.ignore_commands = v,
                    FlagEdit::UserMention(v) => flags.user_mention = v,
                    FlagEdit::EveryoneMention(v) => flags.everyone_mention = v,
                    FlagEdit::RoleMention(v) => flags.role_mention = v,
                    FlagEdit::Reply(v) => flags.reply = v,
                    FlagEdit::Tts(v) => flags.tts = v,
                }
            }
        }

        validate_actions(&updated.actions)?;
        Ok(updated)
    }

    fn single_action_mut(&mut self, field: &str) -> Result<&mut Action, TriggerError> {
        if self.is_multi() {
            return Err(TriggerError::NotEditable {
                name: self.name.clone(),
                reason: format!("the {} of a multi trigger cannot be edited", field),
            });
        }
        let name = self.name.clone();
        self.actions.first_mut().ok_or(TriggerError::NotEditable {
            name,
            reason: "trigger has no actions".to_string(),
        })
    }

    fn not_editable(&self, reason: impl Into<String>) -> TriggerError {
        TriggerError::NotEditable {
            name: self.name.clone(),
            reason: reason.into(),
        }
    }

    /// Serialize into the canonical persisted form
    pub fn to_stored(&self, state: Option<&StoredState>) -> StoredTrigger {
        StoredTrigger {
            name: self.name.clone(),
            regex: self.pattern.source().to_string(),
            actions: self.actions.clone(),
            author: self.author_id,
            enabled: self.enabled,
            created_at: self.created_at,
            allow_list: self.allow_list.clone(),
            deny_list: self.deny_list.clone(),
            chance: self.chance,
            cooldown: self.cooldown.map(|spec| StoredCooldown {
                time: spec.time,
                style: spec.style,
                last: state.map(|s| s.last.clone()).unwrap_or_default(),
            }),
            delete_after: self.delete_after.map(|d| d.as_secs()),
            flags: self.flags.clone(),
            count: state.map(|s| s.count).unwrap_or(0),
        }
    }

    /// Rebuild a trigger from its persisted form, recompiling the pattern
    pub fn from_stored(stored: StoredTrigger, compiler: &PatternCompiler) -> Result<(Self, StoredState), TriggerError> {
        validate_name(&stored.name)?;
        validate_actions(&stored.actions)?;
        let pattern = compiler.compile(&stored.regex)?;

        let state = StoredState {
            last: stored.cooldown.as_ref().map(|c| c.last.clone()).unwrap_or_default(),
            count: stored.count,
        };
        let trigger = Self {
            name: stored.name,
            pattern,
            actions: stored.actions,
            author_id: stored.author,
            enabled: stored.enabled,
            created_at: stored.created_at,
            allow_list: stored.allow_list,
            deny_list: stored.deny_list,
            chance: stored.chance,
            cooldown: stored
                .cooldown
                .filter(|c| c.time > 0)
                .map(|c| CooldownSpec { time: c.time, style: c.style }),
            delete_after: stored.delete_after.filter(|s| *s > 0).map(Duration::from_secs),
            flags: stored.flags,
        };
        Ok((trigger, state))
    }
}

fn validate_name(name: &str) -> Result<(), TriggerError> {
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(TriggerError::InvalidSetting(format!(
            "trigger name `{}` must be non-empty and contain no whitespace",
            name
        )));
    }
    Ok(())
}

fn validate_actions(actions: &[Action]) -> Result<(), TriggerError> {
    if actions.is_empty() {
        return Err(TriggerError::invalid_action(ActionKind::Multi, "no actions provided"));
    }
    for action in actions {
        action
            .validate()
            .map_err(|reason| TriggerError::invalid_action(action.kind(), reason))?;
        if actions.len() > 1 && !action.kind().allowed_in_multi() {
            return Err(TriggerError::invalid_action(
                action.kind(),
                "not allowed in a multi trigger",
            ));
        }
    }
    Ok(())
}

fn extend_unique(list: &mut Vec<u64>, ids: Vec<u64>) {
    for id in ids {
        if !list.contains(&id) {
            list.push(id);
        }
    }
}

/// Volatile per-trigger state carried in the persisted record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredState {
    /// Last fire per cooldown bucket (guild, channel or author id)
    pub last: BTreeMap<u64, chrono::DateTime<chrono::Utc>>,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCooldown {
    pub time: u64,
    pub style: CooldownStyle,
    #[serde(default)]
    pub last: BTreeMap<u64, chrono::DateTime<chrono::Utc>>,
}

/// Canonical persisted form. New optional fields must default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTrigger {
    pub name: String,
    pub regex: String,
    pub actions: Vec<Action>,
    pub author: UserId,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub allow_list: Vec<u64>,
    #[serde(default)]
    pub deny_list: Vec<u64>,
    #[serde(default)]
    pub chance: u32,
    #[serde(default)]
    pub cooldown: Option<StoredCooldown>,
    /// Seconds
    #[serde(default)]
    pub delete_after: Option<u64>,
    #[serde(default)]
    pub flags: TriggerFlags,
    #[serde(default)]
    pub count: u64,
}

fn default_enabled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn new_trigger(actions: Vec<Action>) -> NewTrigger {
        NewTrigger {
            name: "t1".to_string(),
            pattern: r"\bfoo\b".to_string(),
            actions,
            author_id: 7,
            created_at: 1000,
        }
    }

    #[test]
    fn test_build_rejects_bad_input() {
        let compiler = PatternCompiler::default();

        let mut bad_name = new_trigger(vec![Action::Delete]);
        bad_name.name = "two words".to_string();
        assert!(Trigger::build(bad_name, &compiler).is_err());

        assert!(matches!(
            Trigger::build(new_trigger(vec![]), &compiler),
            Err(TriggerError::InvalidAction { .. })
        ));

        let mut bad_regex = new_trigger(vec![Action::Delete]);
        bad_regex.pattern = "[".to_string();
        assert!(matches!(
            Trigger::build(bad_regex, &compiler),
            Err(TriggerError::InvalidPattern { .. })
        ));

        let image_in_multi = new_trigger(vec![Action::Delete, Action::Image { image: "a.png".to_string() }]);
        assert!(Trigger::build(image_in_multi, &compiler).is_err());
    }

    #[test]
    fn test_kind_reports_multi() {
        let compiler = PatternCompiler::default();
        let single = Trigger::build(new_trigger(vec![Action::Delete]), &compiler).unwrap();
        assert_eq!(single.kind(), ActionKind::Delete);

        let multi = Trigger::build(new_trigger(vec![Action::Delete, Action::Ban]), &compiler).unwrap();
        assert_eq!(multi.kind(), ActionKind::Multi);
    }

    #[test]
    fn test_edits_replace_single_fields() {
        let compiler = PatternCompiler::default();
        let trigger = Trigger::build(new_trigger(vec![Action::Text { text: "hi".to_string() }]), &compiler).unwrap();

        let edited = trigger.apply_edit(TriggerEdit::Text("hello".to_string()), &compiler).unwrap();
        assert_eq!(edited.actions, vec![Action::Text { text: "hello".to_string() }]);
        assert_eq!(trigger.actions, vec![Action::Text { text: "hi".to_string() }]);

        let edited = edited.apply_edit(TriggerEdit::Chance(-5), &compiler).unwrap();
        assert_eq!(edited.chance, 0);

        let edited = edited
            .apply_edit(TriggerEdit::Cooldown { seconds: 30, style: CooldownStyle::Channel }, &compiler)
            .unwrap();
        assert_eq!(edited.cooldown, Some(CooldownSpec { time: 30, style: CooldownStyle::Channel }));
        let cleared = edited
            .apply_edit(TriggerEdit::Cooldown { seconds: 0, style: CooldownStyle::Channel }, &compiler)
            .unwrap();
        assert_eq!(cleared.cooldown, None);

        assert!(matches!(
            edited.apply_edit(TriggerEdit::DeleteAfter(Some(Duration::from_millis(200))), &compiler),
            Err(TriggerError::InvalidSetting(_))
        ));

        let allow = edited.apply_edit(TriggerEdit::AllowAdd(vec![1, 2, 2]), &compiler).unwrap();
        assert_eq!(allow.allow_list, vec![1, 2]);
    }

    #[test]
    fn test_multi_and_kind_mismatch_edits_refused() {
        let compiler = PatternCompiler::default();
        let multi = Trigger::build(
            new_trigger(vec![Action::Dm { text: "no".to_string() }, Action::Delete]),
            &compiler,
        )
        .unwrap();
        assert!(matches!(
            multi.apply_edit(TriggerEdit::Text("x".to_string()), &compiler),
            Err(TriggerError::NotEditable { .. })
        ));

        let ban = Trigger::build(new_trigger(vec![Action::Ban]), &compiler).unwrap();
        assert!(matches!(
            ban.apply_edit(TriggerEdit::Reactions(vec!["👍".to_string()]), &compiler),
            Err(TriggerError::NotEditable { .. })
        ));
        assert!(ban.apply_edit(TriggerEdit::DeleteAfter(Some(Duration::from_secs(5))), &compiler).is_err());
        assert!(matches!(
            ban.apply_edit(TriggerEdit::Pattern("(".to_string()), &compiler),
            Err(TriggerError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_stored_round_trip() {
        let compiler = PatternCompiler::default();
        let trigger = Trigger::build(
            new_trigger(vec![Action::React { emojis: vec!["👋".to_string()] }, Action::AddRole { roles: vec![5] }]),
            &compiler,
        )
        .unwrap()
        .apply_edit(TriggerEdit::Cooldown { seconds: 60, style: CooldownStyle::Author }, &compiler)
        .unwrap()
        .apply_edit(TriggerEdit::DenyAdd(vec![99]), &compiler)
        .unwrap()
        .apply_edit(TriggerEdit::Flag(FlagEdit::Reply(Some(ReplyMode::ReplyWithPing))), &compiler)
        .unwrap();

        let mut state = StoredState::default();
        state.last.insert(42, chrono::Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        state.count = 3;

        let first = serde_json::to_value(trigger.to_stored(Some(&state))).unwrap();
        let parsed: StoredTrigger = serde_json::from_value(first.clone()).unwrap();
        let (rebuilt, rebuilt_state) = Trigger::from_stored(parsed, &compiler).unwrap();
        let second = serde_json::to_value(rebuilt.to_stored(Some(&rebuilt_state))).unwrap();

        assert_eq!(first, second);
        assert_eq!(rebuilt_state, state);
        assert_eq!(rebuilt.pattern, trigger.pattern);
    }

    #[test]
    fn test_stored_defaults_for_missing_fields() {
        let minimal = serde_json::json!({
            "name": "old",
            "regex": "hello",
            "actions": [{"kind": "text", "text": "hi"}],
            "author": 1
        });
        let stored: StoredTrigger = serde_json::from_value(minimal).unwrap();
        assert!(stored.enabled);
        assert_eq!(stored.chance, 0);
        assert_eq!(stored.flags, TriggerFlags::default());
        assert!(Trigger::from_stored(stored, &PatternCompiler::default()).is_ok());
    }
}
