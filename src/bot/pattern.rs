// src/bot/pattern.rs - Regex compilation and validation for trigger patterns

use fancy_regex::{Regex, RegexBuilder};
use log::debug;
use std::fmt;
use std::sync::Arc;

use crate::error::TriggerError;
use crate::types::MatchResult;

/// Placeholder replaced by the configured command prefix
pub const PREFIX_PLACEHOLDER: &str = "{prefix}";

/// A compiled trigger pattern.
///
/// `source` is what the moderator typed and what gets persisted; `expanded`
/// is the source after prefix substitution and is what actually runs, both
/// here and inside the match workers.
#[derive(Clone)]
pub struct Pattern {
    source: String,
    expanded: String,
    regex: Arc<Regex>,
}

impl Pattern {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expanded(&self) -> &str {
        &self.expanded
    }

    /// Run the pattern on the current thread. Unbounded; callers that need a
    /// time limit go through the bounded matcher instead.
    pub fn find(&self, text: &str) -> Result<Option<MatchResult>, fancy_regex::Error> {
        captures_to_result(&self.regex, text)
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pattern").field("source", &self.source).finish()
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.expanded == other.expanded
    }
}

pub(crate) fn captures_to_result(regex: &Regex, text: &str) -> Result<Option<MatchResult>, fancy_regex::Error> {
    let Some(caps) = regex.captures(text)? else {
        return Ok(None);
    };
    let Some(whole) = caps.get(0) else {
        return Ok(None);
    };
    let groups = (1..caps.len())
        .map(|i| caps.get(i).map(|m| m.as_str().to_string()))
        .collect();

    Ok(Some(MatchResult {
        start: whole.start(),
        end: whole.end(),
        matched: whole.as_str().to_string(),
        groups,
    }))
}

/// Compiles moderator-supplied sources. Never executes a pattern.
#[derive(Debug, Clone)]
pub struct PatternCompiler {
    command_prefix: String,
    backtrack_limit: usize,
}

impl Default for PatternCompiler {
    fn default() -> Self {
        Self::new("!")
    }
}

impl PatternCompiler {
    pub fn new(command_prefix: impl Into<String>) -> Self {
        Self {
            command_prefix: command_prefix.into(),
            backtrack_limit: usize::MAX,
        }
    }

    /// Cap the backtracking steps of in-process matches; the worker timeout
    /// stays the primary bound.
    pub fn with_backtrack_limit(mut self, limit: usize) -> Self {
        self.backtrack_limit = limit;
        self
    }

    pub fn command_prefix(&self) -> &str {
        &self.command_prefix
    }

    pub fn backtrack_limit(&self) -> usize {
        self.backtrack_limit
    }

    /// Compile a source for use, substituting the command prefix placeholder
    pub fn compile(&self, source: &str) -> Result<Pattern, TriggerError> {
        let expanded = source.replace(PREFIX_PLACEHOLDER, &regex::escape(&self.command_prefix));
        let regex = build_regex(&expanded, self.backtrack_limit).map_err(|e| TriggerError::InvalidPattern {
            pattern: source.to_string(),
            reason: e.to_string(),
        })?;

        debug!("Compiled pattern `{}`", source);
        Ok(Pattern {
            source: source.to_string(),
            expanded,
            regex: Arc::new(regex),
        })
    }

    /// Syntax check only. Placeholders are treated as literal text and the
    /// source is left as written.
    pub fn validate(source: &str) -> Result<(), TriggerError> {
        let literal = source.replace(PREFIX_PLACEHOLDER, &regex::escape(PREFIX_PLACEHOLDER));
        build_regex(&literal, usize::MAX)
            .map(|_| ())
            .map_err(|e| TriggerError::InvalidPattern {
                pattern: source.to_string(),
                reason: e.to_string(),
            })
    }

    /// Substitute the placeholder for display in help and listings
    pub fn render(source: &str, prefix: &str) -> String {
        source.replace(PREFIX_PLACEHOLDER, prefix)
    }
}

pub(crate) fn build_regex(expanded: &str, backtrack_limit: usize) -> Result<Regex, fancy_regex::Error> {
    RegexBuilder::new(expanded).backtrack_limit(backtrack_limit).build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_and_find() {
        let compiler = PatternCompiler::default();
        let pattern = compiler.compile(r"\bfoo(\d+)?\b").unwrap();

        let found = pattern.find("say foo42 now").unwrap().unwrap();
        assert_eq!(found.start, 4);
        assert_eq!(found.end, 9);
        assert_eq!(found.matched, "foo42");
        assert_eq!(found.groups, vec![Some("42".to_string())]);

        assert!(pattern.find("food").unwrap().is_none());
    }

    #[test]
    fn test_agrees_with_reference_engine() {
        let compiler = PatternCompiler::default();
        let cases = [
            (r"\bfoo\b", "foo bar"),
            (r"(?i)hello\s+world", "HELLO   World!"),
            (r"^\d{3}-\d{4}$", "555-1234"),
            (r"[aeiou]{2,}", "rhythm"),
            (r"colou?r", "what colour is it"),
        ];
        for (source, text) in cases {
            let reference = regex::Regex::new(source).unwrap();
            let ours = compiler.compile(source).unwrap().find(text).unwrap();
            let expected = reference.find(text).map(|m| (m.start(), m.end()));
            assert_eq!(ours.map(|m| (m.start, m.end)), expected, "pattern {}", source);
        }
    }

    #[test]
    fn test_lookaround_and_backreferences() {
        let compiler = PatternCompiler::default();
        let doubled = compiler.compile(r"\b(\w+)\s+\1\b").unwrap();
        assert_eq!(doubled.find("this is is fine").unwrap().unwrap().matched, "is is");

        let lookahead = compiler.compile(r"foo(?=bar)").unwrap();
        assert!(lookahead.find("foobar").unwrap().is_some());
        assert!(lookahead.find("foobaz").unwrap().is_none());
    }

    #[test]
    fn test_invalid_pattern_carries_diagnostic() {
        let err = PatternCompiler::default().compile("(unclosed").unwrap_err();
        match err {
            TriggerError::InvalidPattern { pattern, reason } => {
                assert_eq!(pattern, "(unclosed");
                assert!(!reason.is_empty());
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_prefix_placeholder() {
        let compiler = PatternCompiler::new("?");
        let pattern = compiler.compile(r"^{prefix}help").unwrap();
        assert_eq!(pattern.source(), r"^{prefix}help");
        assert_eq!(pattern.expanded(), r"^\?help");
        assert!(pattern.find("?help me").unwrap().is_some());
        assert!(pattern.find("!help me").unwrap().is_none());

        assert!(PatternCompiler::validate(r"^{prefix}help").is_ok());
        assert_eq!(PatternCompiler::render(r"^{prefix}help", "?"), "^?help");
    }
}
