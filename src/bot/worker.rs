// src/bot/worker.rs - Match worker process: wire protocol and request loop
//
// A worker reads one JSON request per line on stdin and answers with one JSON
// reply per line on stdout. It holds no state the parent depends on, so the
// parent can kill it at any point and start a fresh one.

use anyhow::{Context, Result};
use fancy_regex::Regex;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{BufRead, Write};

use crate::bot::pattern::{build_regex, captures_to_result};
use crate::types::MatchResult;

/// Compiled patterns kept per worker before the cache is reset
const PATTERN_CACHE_LIMIT: usize = 512;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub id: u64,
    pub pattern: String,
    pub text: String,
    pub backtrack_limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerReply {
    Matched { id: u64, result: MatchResult },
    NoMatch { id: u64 },
    Failed { id: u64, error: String },
}

impl WorkerReply {
    pub fn id(&self) -> u64 {
        match self {
            WorkerReply::Matched { id, .. } | WorkerReply::NoMatch { id } | WorkerReply::Failed { id, .. } => *id,
        }
    }
}

/// Serve requests until the input closes
pub fn run_worker<R: BufRead, W: Write>(input: R, mut output: W) -> Result<()> {
    let mut cache: HashMap<(String, usize), Regex> = HashMap::new();

    for line in input.lines() {
        let line = line.context("Failed to read match request")?;
        if line.trim().is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<WorkerRequest>(&line) {
            Ok(request) => handle_request(&mut cache, request),
            Err(e) => {
                warn!("Malformed match request: {}", e);
                WorkerReply::Failed {
                    id: 0,
                    error: format!("malformed request: {}", e),
                }
            }
        };

        serde_json::to_writer(&mut output, &reply).context("Failed to encode match reply")?;
        output.write_all(b"\n")?;
        output.flush()?;
    }

    debug!("Match worker input closed, exiting");
    Ok(())
}

fn handle_request(cache: &mut HashMap<(String, usize), Regex>, request: WorkerRequest) -> WorkerReply {
    let key = (request.pattern, request.backtrack_limit);
    if !cache.contains_key(&key) {
        if cache.len() >= PATTERN_CACHE_LIMIT {
            cache.clear();
        }
        match build_regex(&key.0, key.1) {
            Ok(regex) => {
                cache.insert(key.clone(), regex);
            }
            Err(e) => {
                return WorkerReply::Failed {
                    id: request.id,
                    error: e.to_string(),
                }
            }
        }
    }

    let Some(regex) = cache.get(&key) else {
        return WorkerReply::Failed {
            id: request.id,
            error: "pattern cache miss".to_string(),
        };
    };

    match captures_to_result(regex, &request.text) {
        Ok(Some(result)) => WorkerReply::Matched { id: request.id, result },
        Ok(None) => WorkerReply::NoMatch { id: request.id },
        Err(e) => WorkerReply::Failed {
            id: request.id,
            error: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn request(id: u64, pattern: &str, text: &str) -> String {
        serde_json::to_string(&WorkerRequest {
            id,
            pattern: pattern.to_string(),
            text: text.to_string(),
            backtrack_limit: usize::MAX,
        })
        .unwrap()
    }

    fn replies(input: String) -> Vec<WorkerReply> {
        let mut output = Vec::new();
        run_worker(Cursor::new(input), &mut output).unwrap();
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn test_worker_answers_each_request_in_order() {
        let input = format!(
            "{}\n{}\n\n{}\n",
            request(1, r"\bfoo\b", "foo bar"),
            request(2, r"\bfoo\b", "food"),
            request(3, "(", "anything"),
        );
        let replies = replies(input);

        assert_eq!(replies.len(), 3);
        match &replies[0] {
            WorkerReply::Matched { id, result } => {
                assert_eq!(*id, 1);
                assert_eq!((result.start, result.end), (0, 3));
            }
            other => panic!("unexpected reply: {:?}", other),
        }
        assert_eq!(replies[1], WorkerReply::NoMatch { id: 2 });
        assert!(matches!(replies[2], WorkerReply::Failed { id: 3, .. }));
    }

    #[test]
    fn test_malformed_request_does_not_stop_worker() {
        let input = format!("not json\n{}\n", request(9, "a", "a"));
        let replies = replies(input);
        assert!(matches!(replies[0], WorkerReply::Failed { id: 0, .. }));
        assert_eq!(replies[1].id(), 9);
    }

    #[test]
    fn test_backtrack_limit_reported_as_failure() {
        let input = serde_json::to_string(&WorkerRequest {
            id: 4,
            pattern: r"^(?:a|(?=a)a)+$".to_string(),
            text: format!("{}!", "a".repeat(40)),
            backtrack_limit: 1_000,
        })
        .unwrap();
        let replies = replies(format!("{}\n", input));
        assert!(matches!(replies[0], WorkerReply::Failed { id: 4, .. }));
    }
}
