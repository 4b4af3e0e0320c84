//! Moderation: two independent gates around the pipeline. Pre-input
//! red-flag detection runs on the raw incoming message before any LLM call
//! is billed; the post-output filter runs on the composed reply before it
//! is ever sent.

use crate::db::moderation::ModerationAction;

/// Severity of a pre-input red-flag match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// No red-flag keyword matched.
    None,
    /// Matched a low-severity keyword.
    Low,
    /// Matched a medium-severity keyword.
    Medium,
    /// Matched a high-severity keyword; logged, processing continues.
    High,
    /// Matched a critical-severity keyword; the pipeline must stop.
    Critical,
}

/// Keywords whose presence halts the pipeline outright.
const CRITICAL_KEYWORDS: &[&str] = &[
    "kill myself",
    "suicide",
    "end my life",
    "want to die",
    "self harm",
    "self-harm",
];

/// Keywords logged but allowed to continue, one tier down from critical.
const HIGH_KEYWORDS: &[&str] = &["hurt someone", "kill him", "kill her", "kill them", "violence"];

/// Outcome of scanning an inbound message for red flags.
#[derive(Debug, Clone, PartialEq)]
pub struct RedFlagResult {
    /// Highest severity found, or [`Severity::None`] if nothing matched.
    pub severity: Severity,
    /// Which keyword classes matched, for the audit log.
    pub flags: Vec<String>,
    /// Whether the pipeline must stop and emit a crisis response instead.
    pub should_continue: bool,
}

/// Canned response for a `critical` red flag, listing crisis resources.
pub const CRISIS_RESPONSE: &str = "I'm really concerned about what you just shared. \
You don't have to go through this alone. If you're in the US, you can call or text \
988 (Suicide & Crisis Lifeline) any time, or text HOME to 741741 to reach the Crisis \
Text Line. If you're in immediate danger, please call 911 or your local emergency \
number.";

/// Scan a raw inbound message for fixed red-flag keywords.
///
/// Matching is case-insensitive substring search against two keyword
/// classes; anything that matches neither class but still warrants a
/// human look later is left to callers to classify as `medium`/`low`
/// via their own domain logic — this scan only distinguishes
/// `critical`/`high` from "nothing matched".
pub fn scan(message: &str) -> RedFlagResult {
    let lowered = message.to_lowercase();

    let critical: Vec<&str> = CRITICAL_KEYWORDS
        .iter()
        .copied()
        .filter(|kw| lowered.contains(kw))
        .collect();
    if !critical.is_empty() {
        return RedFlagResult {
            severity: Severity::Critical,
            flags: critical.into_iter().map(str::to_owned).collect(),
            should_continue: false,
        };
    }

    let high: Vec<&str> = HIGH_KEYWORDS
        .iter()
        .copied()
        .filter(|kw| lowered.contains(kw))
        .collect();
    if !high.is_empty() {
        return RedFlagResult {
            severity: Severity::High,
            flags: high.into_iter().map(str::to_owned).collect(),
            should_continue: true,
        };
    }

    RedFlagResult {
        severity: Severity::None,
        flags: Vec::new(),
        should_continue: true,
    }
}

/// Outcome of the post-output filter.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterResult {
    /// The response to actually deliver: the original, or a replacement.
    pub response: String,
    /// What action was taken, for the audit log.
    pub action: ModerationAction,
}

/// A classifier that judges whether a composed response should be
/// delivered as-is. Implementations may call out to an external service;
/// the gate fails *open* on classifier error by design, not oversight.
pub trait OutputClassifier: Send + Sync {
    /// Returns `true` if `response` should be blocked/replaced.
    fn is_flagged(&self, response: &str) -> Result<bool, anyhow::Error>;
}

/// Apply the post-output gate. If the classifier errors, the original
/// response is allowed through unchanged.
pub fn filter_output(
    response: &str,
    excuse: &str,
    classifier: &dyn OutputClassifier,
) -> FilterResult {
    match classifier.is_flagged(response) {
        Ok(true) => FilterResult {
            response: excuse.to_owned(),
            action: ModerationAction::Replaced,
        },
        Ok(false) => FilterResult {
            response: response.to_owned(),
            action: ModerationAction::Allowed,
        },
        Err(_) => FilterResult {
            response: response.to_owned(),
            action: ModerationAction::Allowed,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysFlags;
    impl OutputClassifier for AlwaysFlags {
        fn is_flagged(&self, _response: &str) -> Result<bool, anyhow::Error> {
            Ok(true)
        }
    }

    struct AlwaysFails;
    impl OutputClassifier for AlwaysFails {
        fn is_flagged(&self, _response: &str) -> Result<bool, anyhow::Error> {
            Err(anyhow::anyhow!("classifier unreachable"))
        }
    }

    #[test]
    fn critical_keyword_halts_the_pipeline() {
        let result = scan("I want to kill myself");
        assert_eq!(result.severity, Severity::Critical);
        assert!(!result.should_continue);
    }

    #[test]
    fn high_keyword_continues_but_is_logged() {
        let result = scan("sometimes I think about violence");
        assert_eq!(result.severity, Severity::High);
        assert!(result.should_continue);
    }

    #[test]
    fn clean_message_has_no_flags() {
        let result = scan("what's the weather tomorrow?");
        assert_eq!(result.severity, Severity::None);
        assert!(result.flags.is_empty());
        assert!(result.should_continue);
    }

    #[test]
    fn flagged_output_is_replaced_with_excuse() {
        let result = filter_output("original", "let's talk about something else", &AlwaysFlags);
        assert_eq!(result.response, "let's talk about something else");
        assert_eq!(result.action, ModerationAction::Replaced);
    }

    #[test]
    fn classifier_failure_fails_open() {
        let result = filter_output("original", "excuse", &AlwaysFails);
        assert_eq!(result.response, "original");
        assert_eq!(result.action, ModerationAction::Allowed);
    }
}
