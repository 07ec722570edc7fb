//! Classify what a worker's output says about how it ended.
//!
//! Workers are asked to finish with one of
//!
//! - `<promise>COMPLETE</promise>` or `<promise>COMPLETE: PR #12</promise>`
//! - `<promise>BLOCKED: reason</promise>`
//! - `<promise>FAILED: reason</promise>`
//!
//! They do not always manage to, so the detector falls back to completion
//! phrasing near the end of the output and, for coordinator items, to the
//! pull request they created.

use std::sync::LazyLock;

use regex::Regex;

static MARKER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<promise>\s*(COMPLETE|BLOCKED|FAILED)\s*(?::\s*(.*?))?\s*</promise>")
        .unwrap_or_else(|e| panic!("marker regex: {e}"))
});

static PR_URL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https://github\.com/[\w.-]+/[\w.-]+/pull/(\d+)")
        .unwrap_or_else(|e| panic!("pr url regex: {e}"))
});

static PR_REF_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:PR|pull request)\s*#(\d+)\b")
        .unwrap_or_else(|e| panic!("pr ref regex: {e}"))
});

static SUMMARY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<summary>\s*(.*?)\s*</summary>")
        .unwrap_or_else(|e| panic!("summary regex: {e}"))
});

const BUILTIN_COMPLETION_PATTERNS: &[&str] = &[
    r"(?i)\ball (?:tasks|work|changes|items) (?:are |is |have been )?(?:complete|completed|done|finished)\b",
    r"(?i)\bimplementation (?:is )?(?:now )?complete\b",
    r"(?i)\bsuccessfully (?:completed|implemented|finished) (?:the |this )?(?:task|issue|work)\b",
    r"(?i)\b(?:pull request|PR) (?:has been |was )?(?:created|opened)\b",
    r"(?i)\bwork (?:on this issue )?is (?:complete|done)\b",
];

/// Heuristics only look at this many trailing bytes of output. Completion
/// talk early in a long run is usually about a sub-step.
const TAIL_BYTES: usize = 4000;

/// Reference to what a finished worker produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultRef {
    PullRequest(u64),
    Other(String),
}

impl ResultRef {
    fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        Some(find_pull_request(text).map_or_else(|| Self::Other(text.to_string()), Self::PullRequest))
    }
}

impl std::fmt::Display for ResultRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PullRequest(n) => write!(f, "PR #{n}"),
            Self::Other(s) => f.write_str(s),
        }
    }
}

/// A structured marker emitted by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker {
    Complete { result: Option<ResultRef> },
    Blocked { reason: String },
    Failed { reason: String },
}

/// Strongest completion evidence found in a worker's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Explicit(Marker),
    Heuristic { phrase: String },
    CoordinatorResult(ResultRef),
    None,
}

pub struct SignalDetector {
    completion: Vec<Regex>,
}

impl SignalDetector {
    /// Built-in completion phrases plus `extra` patterns. Invalid extra
    /// patterns are skipped with a warning; config validation rejects them
    /// before we get here.
    pub fn new(extra: &[String]) -> Self {
        let completion = BUILTIN_COMPLETION_PATTERNS
            .iter()
            .copied()
            .chain(extra.iter().map(String::as_str))
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!(pattern = p, error = %e, "skipping completion pattern");
                    None
                }
            })
            .collect();
        Self { completion }
    }

    /// Classify `output`: explicit marker first, then heuristic phrasing,
    /// then (coordinator items only) a created pull request.
    pub fn detect(&self, output: &str, coordinator: bool) -> Signal {
        if let Some(marker) = last_marker(output) {
            return Signal::Explicit(marker);
        }
        let tail = tail(output, TAIL_BYTES);
        for re in &self.completion {
            if let Some(m) = re.find(tail) {
                return Signal::Heuristic {
                    phrase: m.as_str().to_string(),
                };
            }
        }
        if coordinator {
            if let Some(n) = find_last_pull_request(output) {
                return Signal::CoordinatorResult(ResultRef::PullRequest(n));
            }
        }
        Signal::None
    }
}

impl Default for SignalDetector {
    fn default() -> Self {
        Self::new(&[])
    }
}

/// The last marker wins: a worker that reported BLOCKED and then recovered
/// and finished should be treated as finished.
fn last_marker(output: &str) -> Option<Marker> {
    let cap = MARKER_REGEX.captures_iter(output).last()?;
    let detail = cap.get(2).map_or("", |m| m.as_str()).trim();
    let marker = match &cap[1] {
        "COMPLETE" => Marker::Complete {
            result: ResultRef::parse(detail),
        },
        "BLOCKED" => Marker::Blocked {
            reason: reason_or_default(detail),
        },
        _ => Marker::Failed {
            reason: reason_or_default(detail),
        },
    };
    Some(marker)
}

fn reason_or_default(detail: &str) -> String {
    if detail.is_empty() {
        "no reason given".to_string()
    } else {
        unescape(detail)
    }
}

fn find_pull_request(text: &str) -> Option<u64> {
    PR_URL_REGEX
        .captures(text)
        .or_else(|| PR_REF_REGEX.captures(text))
        .and_then(|c| c[1].parse().ok())
}

fn find_last_pull_request(text: &str) -> Option<u64> {
    let url = PR_URL_REGEX
        .captures_iter(text)
        .last()
        .and_then(|c| Some((c.get(0)?.start(), c[1].parse::<u64>().ok()?)));
    let reference = PR_REF_REGEX
        .captures_iter(text)
        .last()
        .and_then(|c| Some((c.get(0)?.start(), c[1].parse::<u64>().ok()?)));
    match (url, reference) {
        (Some(a), Some(b)) => Some(if a.0 >= b.0 { a.1 } else { b.1 }),
        (Some((_, n)), None) | (None, Some((_, n))) => Some(n),
        (None, None) => None,
    }
}

/// The last `<summary>` block, if the worker wrote one.
pub fn extract_summary(output: &str) -> Option<String> {
    let cap = SUMMARY_REGEX.captures_iter(output).last()?;
    let text = unescape(cap[1].trim());
    if text.is_empty() { None } else { Some(text) }
}

/// Worker logs are JSON event streams, so text arrives with escaped newlines.
fn unescape(text: &str) -> String {
    text.replace("\\n", "\n").replace("\\\"", "\"")
}

fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_complete_with_pull_request() {
        let out = "working...\n<promise>COMPLETE: opened PR #31</promise>\n";
        assert_eq!(
            SignalDetector::default().detect(out, false),
            Signal::Explicit(Marker::Complete {
                result: Some(ResultRef::PullRequest(31))
            })
        );
    }

    #[test]
    fn explicit_complete_without_result() {
        let out = "<promise>COMPLETE</promise>";
        assert_eq!(
            SignalDetector::default().detect(out, false),
            Signal::Explicit(Marker::Complete { result: None })
        );
    }

    #[test]
    fn blocked_and_failed_carry_reasons() {
        let d = SignalDetector::default();
        assert_eq!(
            d.detect("<promise>BLOCKED: need API credentials</promise>", false),
            Signal::Explicit(Marker::Blocked {
                reason: "need API credentials".into()
            })
        );
        assert_eq!(
            d.detect("<promise>FAILED</promise>", false),
            Signal::Explicit(Marker::Failed {
                reason: "no reason given".into()
            })
        );
    }

    #[test]
    fn last_marker_wins() {
        let out = "<promise>BLOCKED: flaky test</promise>\nretrying\n<promise>COMPLETE</promise>";
        assert!(matches!(
            SignalDetector::default().detect(out, false),
            Signal::Explicit(Marker::Complete { .. })
        ));
    }

    #[test]
    fn markers_beat_heuristics() {
        let out = "All tasks are complete.\n<promise>FAILED: build broken</promise>";
        assert!(matches!(
            SignalDetector::default().detect(out, false),
            Signal::Explicit(Marker::Failed { .. })
        ));
    }

    #[test]
    fn heuristic_phrase_in_tail() {
        let out = "lots of work\nThe implementation is complete and tests pass.";
        assert!(matches!(
            SignalDetector::default().detect(out, false),
            Signal::Heuristic { .. }
        ));
    }

    #[test]
    fn heuristic_phrase_early_in_long_output_is_ignored() {
        let mut out = String::from("Implementation complete for step one.\n");
        out.push_str(&"still going ".repeat(1000));
        assert_eq!(SignalDetector::default().detect(&out, false), Signal::None);
    }

    #[test]
    fn extra_patterns_extend_heuristics() {
        let d = SignalDetector::new(&["(?i)shipped it".to_string()]);
        assert!(matches!(d.detect("ok, shipped it", false), Signal::Heuristic { .. }));
        assert_eq!(SignalDetector::default().detect("ok, shipped it", false), Signal::None);
    }

    #[test]
    fn coordinator_pull_request_counts_only_for_coordinators() {
        let out = "see https://github.com/acme/widgets/pull/88 for details";
        let d = SignalDetector::default();
        assert_eq!(
            d.detect(out, true),
            Signal::CoordinatorResult(ResultRef::PullRequest(88))
        );
        assert_eq!(d.detect(out, false), Signal::None);
    }

    #[test]
    fn coordinator_uses_latest_pull_request() {
        let out = "based on PR #3\n...\ncreated https://github.com/acme/widgets/pull/9";
        assert_eq!(
            SignalDetector::default().detect(out, true),
            Signal::CoordinatorResult(ResultRef::PullRequest(9))
        );
    }

    #[test]
    fn no_signal() {
        assert_eq!(SignalDetector::default().detect("", false), Signal::None);
        assert_eq!(
            SignalDetector::default().detect("edited src/main.rs", true),
            Signal::None
        );
    }

    #[test]
    fn summary_is_extracted_and_unescaped() {
        let out = r#"{"text":"<summary>Added cache.\nTests pass.</summary>"}"#;
        assert_eq!(
            extract_summary(out).as_deref(),
            Some("Added cache.\nTests pass.")
        );
        assert_eq!(extract_summary("nothing here"), None);
    }

    #[test]
    fn tail_respects_char_boundaries() {
        let s = "ééééé";
        let t = tail(s, 3);
        assert!(t.len() <= 3);
        assert!(s.ends_with(t));
    }
}
