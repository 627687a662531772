//! Screen classifier for "does this session need a human?".
//!
//! ## Claude Code TUI layout when idle
//!
//! ```text
//! [content area]
//! ────────────────────────────── (rule)
//! > Try "fix lint errors"       (prompt)
//! ────────────────────────────── (rule)
//!   ? for shortcuts
//! ```
//!
//! Explicit prompts (permission requests, choice menus, y/n questions) are
//! checked first, line by line, top to bottom. Only when none match do we
//! look for the boxed empty prompt above. All of this is heuristic and
//! expected to drift with upstream rendering changes, so callers go through
//! the [`Classifier`] trait and never depend on the patterns directly.

use once_cell::sync::Lazy;
use regex::Regex;

/// Label returned when only the idle-prompt check fired.
pub const IDLE_PROMPT_LABEL: &str = "idle prompt";

/// Anything that can decide whether a screen needs attention.
///
/// Returns the human-readable trigger (a screen line or a fixed label), or
/// `None` when the session looks busy.
pub trait Classifier: Send + Sync {
    fn classify(&self, lines: &[String]) -> Option<String>;
}

/// The regex/box-drawing heuristic classifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatternClassifier;

impl Classifier for PatternClassifier {
    fn classify(&self, lines: &[String]) -> Option<String> {
        classify(lines)
    }
}

/// Navigation hint shown under multiple-choice menus.
static SELECTION_HINT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\benter to (?:select|confirm)\b|\bto navigate\b").unwrap());

/// "Allow <something>?" permission phrasing. `\s+` after "allow" keeps
/// "Allowing ..." out.
static ALLOW_PROMPT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\ballow\s+\S.*\?").unwrap());

/// Two or more button words at the start of the line, e.g. `Yes  No  Always`
/// or `❯ 1. Yes 2. No`.
static BUTTON_ROW: Lazy<Regex> = Lazy::new(|| {
    let word = r"(?:[❯>›]\s*)?(?:\d+\.\s*)?(?:Yes|No|Always|Never|Cancel|Skip)\b";
    Regex::new(&format!(r"^{word}(?:[,/|]?\s+{word})+")).unwrap()
});

static DO_YOU_WANT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bdo you want to\b.*\?").unwrap());

/// Characters Claude Code uses for horizontal rules.
const RULE_CHARS: &[char] = &['─', '━', '═', '╌', '┄', '-'];

/// Characters that mark the input prompt.
const PROMPT_MARKERS: &[char] = &['>', '❯'];

/// Classify the visible screen. Pure function of `lines`.
pub fn classify<S: AsRef<str>>(lines: &[S]) -> Option<String> {
    if let Some(line) = lines
        .iter()
        .map(AsRef::as_ref)
        .filter(|line| !line.trim().is_empty())
        .find(|line| is_explicit_prompt(line))
    {
        return Some(line.trim().to_string());
    }

    if has_idle_prompt(lines) {
        return Some(IDLE_PROMPT_LABEL.to_string());
    }

    None
}

/// Whether a single line is an explicit question or permission prompt.
fn is_explicit_prompt(line: &str) -> bool {
    SELECTION_HINT.is_match(line)
        || ALLOW_PROMPT.is_match(line)
        || BUTTON_ROW.is_match(line.trim_start())
        || line.contains("? (y/n)")
        || line.contains("(Y)es")
        || DO_YOU_WANT.is_match(line)
}

/// A rule, a prompt line, and another rule on three consecutive rows.
fn has_idle_prompt<S: AsRef<str>>(lines: &[S]) -> bool {
    lines.windows(3).any(|w| {
        is_rule(w[0].as_ref()) && is_prompt(w[1].as_ref()) && is_rule(w[2].as_ref())
    })
}

fn is_rule(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.chars().count() >= 3 && trimmed.chars().all(|c| RULE_CHARS.contains(&c))
}

fn is_prompt(line: &str) -> bool {
    line.trim_start().starts_with(PROMPT_MARKERS)
}
