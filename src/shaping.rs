use crate::database::{Message, SenderKind};

/// Utterances at or under this length count as "short" for the reply filters.
const SHORT_UTTERANCE_MAX_CHARS: usize = 15;

/// Lines shorter than this that lack terminal punctuation are treated as
/// accidental mid-sentence breaks and merged into the following line.
const FRAGMENT_MAX_CHARS: usize = 8;

/// Replies with fewer total words than this are exempt from the one-question
/// rule.
const ONE_QUESTION_MIN_WORDS: usize = 10;

/// How many trailing user messages feed the context extraction.
const RECENT_USER_TEXTS: usize = 5;
const RECENT_COMPANION_QUESTIONS: usize = 5;
const TOPIC_SCAN_MESSAGES: usize = 10;

/// Bare acknowledgements: the user is listening, not opening a new subject.
const ACKNOWLEDGEMENTS: &[&str] = &[
    "ok", "okay", "k", "kk", "hmm", "hm", "mm", "lol", "haha", "lmao", "acha", "accha", "sare",
    "ss", "ya", "yeah", "yep",
];

/// Short closers with negative sentiment; pushing questions at these reads
/// as tone-deaf.
const NEGATIVE_CLOSERS: &[&str] = &[
    "no",
    "nope",
    "nah",
    "ledu",
    "em ledu",
    "emledu",
    "vaddu",
    "nothing",
    "nvm",
    "not really",
    "leave it",
];

/// Utterance fragments that mean the user is asking about the companion's
/// identity or name.
const IDENTITY_PROMPTS: &[&str] = &[
    "your name",
    "ur name",
    "who are you",
    "who r u",
    "what are you",
    "ni peru",
    "nee peru",
    "peru enti",
    "call you",
    "what do i call",
    "rename",
];

/// Reply lines that yank the thread to new business when the user only
/// acknowledged.
const TOPIC_SWITCH_TRIGGERS: &[&str] = &[
    "any update",
    "any updates",
    "new updates",
    "any news",
    "whats new",
    "what's new",
    "business idea",
    "new business",
    "emaina updates",
];

/// Filler questions that break a closing mood.
const MOOD_BREAKING_QUESTIONS: &[&str] = &[
    "what are you up to",
    "what r u up to",
    "wyd",
    "any plans",
    "did you eat",
    "have you eaten",
    "tinnava",
    "em chestunnav",
    "what are you doing",
    "hows your day",
    "how's your day",
];

/// Subjects that are off-topic while the user is asking about identity.
const UNRELATED_TOPIC_KEYWORDS: &[&str] = &[
    "business", "startup", "gym", "movie", "cricket", "biryani", "weather", "office",
];

/// A line touching these stays even when the unrelated-topic filter is live.
const IDENTITY_KEYWORDS: &[&str] = &["name", "peru", "call me", "call you"];

/// Topics worth tracking across the recent window (places and recurring
/// subjects the persona refers back to).
const TRACKED_TOPICS: &[&str] = &[
    "hitech city",
    "banjara hills",
    "gachibowli",
    "jubilee hills",
    "madhapur",
    "office",
    "college",
    "exam",
    "gym",
    "amma",
    "nanna",
];

const USER_GREETING_PATTERNS: &[&str] = &[
    r"(?i)^(hey+|h+i+|hello+|yo+|sup+|wa+ss?up+|hola|namaste|hai+)[!,. ]*$",
    r"(?i)^good (morning|afternoon|evening|night)[!,. ]*$",
    r"(?i)^(gm|gn)[!,. ]*$",
];

const CANNED_OPENER_PATTERNS: &[&str] = &[
    r"(?i)^(hey+|hi+|hello+|yo+)[,!. ]+.*\b(i'?m (good|fine|great|doing good)|i am (good|fine|great))",
    r"(?i)^(hey+|hi+|hello+|yo+)[,!. ]+how (are|r) (you|u)\b",
    r"(?i)^how (are|r) (you|u)[!?,. ]*$",
];

/// Per-turn view of the conversation the shaping engine and prompt builder
/// work from. Derived from the window snapshot, never persisted.
#[derive(Debug, Clone, Default)]
pub struct ShapingContext {
    /// The user message this turn replies to.
    pub user_utterance: String,
    /// Content of the last few user messages, oldest first.
    pub recent_user_texts: Vec<String>,
    /// Tracked topics mentioned anywhere in the recent window.
    pub mentioned_topics: Vec<String>,
    /// Questions the companion already asked recently.
    pub companion_questions: Vec<String>,
}

impl ShapingContext {
    pub fn from_window(messages: &[Message]) -> Self {
        let user_utterance = messages
            .iter()
            .rev()
            .find(|m| m.sender == SenderKind::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();

        let mut recent_user_texts: Vec<String> = messages
            .iter()
            .rev()
            .filter(|m| m.sender == SenderKind::User)
            .take(RECENT_USER_TEXTS)
            .map(|m| m.content.clone())
            .collect();
        recent_user_texts.reverse();

        let mut companion_questions: Vec<String> = messages
            .iter()
            .rev()
            .filter(|m| m.sender == SenderKind::Persona && m.content.contains('?'))
            .take(RECENT_COMPANION_QUESTIONS)
            .map(|m| m.content.clone())
            .collect();
        companion_questions.reverse();

        let scan_from = messages.len().saturating_sub(TOPIC_SCAN_MESSAGES);
        let mut mentioned_topics = Vec::new();
        for message in &messages[scan_from..] {
            let lowered = message.content.to_lowercase();
            for topic in TRACKED_TOPICS {
                if lowered.contains(topic) && !mentioned_topics.iter().any(|t: &String| t == topic)
                {
                    mentioned_topics.push((*topic).to_string());
                }
            }
        }

        Self {
            user_utterance,
            recent_user_texts,
            mentioned_topics,
            companion_questions,
        }
    }

    /// Recent user texts joined for the memory query.
    pub fn recent_text(&self) -> String {
        self.recent_user_texts.join(" | ")
    }

    #[cfg(test)]
    pub fn for_utterance(utterance: &str) -> Self {
        Self {
            user_utterance: utterance.to_string(),
            ..Self::default()
        }
    }
}

/// One reply filter: when `triggered` by the turn, drop every line matching
/// `drops`, except lines `unless` rescues. Evaluated in fixed order.
struct FilterRule {
    name: &'static str,
    triggered: fn(&ShapingContext) -> bool,
    drops: fn(&str) -> bool,
    unless: Option<fn(&str) -> bool>,
}

const FILTER_RULES: &[FilterRule] = &[
    FilterRule {
        name: "thread-killer",
        triggered: thread_killer_active,
        drops: is_topic_switch_line,
        unless: None,
    },
    FilterRule {
        name: "panic-question",
        triggered: panic_question_active,
        drops: is_mood_breaking_question,
        unless: None,
    },
    FilterRule {
        name: "unrelated-topic",
        triggered: identity_focus_active,
        drops: mentions_unrelated_topic,
        unless: Some(mentions_identity),
    },
];

fn thread_killer_active(ctx: &ShapingContext) -> bool {
    is_short_utterance(&ctx.user_utterance) || is_acknowledgement(&ctx.user_utterance)
}

fn panic_question_active(ctx: &ShapingContext) -> bool {
    is_negative_closer(&ctx.user_utterance)
}

fn identity_focus_active(ctx: &ShapingContext) -> bool {
    concerns_identity(&ctx.user_utterance)
}

/// Run the full shaping pipeline over a raw reply. Returns the surviving
/// lines, falling back down the chain (greeting-stripped text, then the raw
/// text) rather than ever going empty. `None` only when the raw reply itself
/// holds no content, which aborts the turn.
pub fn shape_reply(raw: &str, ctx: &ShapingContext) -> Option<Vec<String>> {
    let original_lines = split_lines(raw);
    if original_lines.is_empty() {
        return None;
    }

    let after_greeting = strip_canned_greeting(&original_lines, ctx);

    let mut lines = merge_fragments(&after_greeting);

    for rule in FILTER_RULES {
        if (rule.triggered)(ctx) {
            lines.retain(|line| {
                let lowered = line.to_lowercase();
                if (rule.drops)(&lowered) {
                    if let Some(unless) = rule.unless {
                        if unless(&lowered) {
                            return true;
                        }
                    }
                    tracing::debug!("Reply filter {} dropped: {}", rule.name, line);
                    return false;
                }
                true
            });
        }
    }

    let lines = enforce_one_question(lines);

    if !lines.is_empty() {
        return Some(lines);
    }
    if !after_greeting.is_empty() {
        return Some(after_greeting);
    }
    Some(original_lines)
}

fn split_lines(raw: &str) -> Vec<String> {
    raw.lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .map(|line| line.to_string())
        .collect()
}

/// Drop a canned-greeting opener unless the user opened with a greeting
/// themselves. Reverted when stripping would leave nothing.
fn strip_canned_greeting(lines: &[String], ctx: &ShapingContext) -> Vec<String> {
    if is_greeting(&ctx.user_utterance) {
        return lines.to_vec();
    }

    let Some(first) = lines.first() else {
        return lines.to_vec();
    };
    if !is_canned_greeting_line(first) {
        return lines.to_vec();
    }

    let stripped: Vec<String> = lines[1..].to_vec();
    if stripped.is_empty() {
        return lines.to_vec();
    }
    stripped
}

/// Re-join lines that look like an accidental mid-sentence break.
fn merge_fragments(lines: &[String]) -> Vec<String> {
    let mut merged = Vec::new();
    let mut carry: Option<String> = None;

    for line in lines {
        let current = match carry.take() {
            Some(prefix) => format!("{} {}", prefix, line),
            None => line.clone(),
        };
        if current.chars().count() < FRAGMENT_MAX_CHARS && !ends_in_terminal(&current) {
            carry = Some(current);
        } else {
            merged.push(current);
        }
    }
    if let Some(rest) = carry {
        merged.push(rest);
    }
    merged
}

/// Keep only the first question line. Exempt when the reply is tiny or
/// carries exclamatory energy.
fn enforce_one_question(lines: Vec<String>) -> Vec<String> {
    let total_words: usize = lines.iter().map(|l| l.split_whitespace().count()).sum();
    if total_words < ONE_QUESTION_MIN_WORDS {
        return lines;
    }
    if lines.iter().any(|l| l.contains('!')) {
        return lines;
    }

    let mut seen_question = false;
    lines
        .into_iter()
        .filter(|line| {
            if !line.contains('?') {
                return true;
            }
            if seen_question {
                return false;
            }
            seen_question = true;
            true
        })
        .collect()
}

pub fn ends_in_terminal(line: &str) -> bool {
    matches!(
        line.trim_end().chars().last(),
        Some('.') | Some('!') | Some('?') | Some('…')
    )
}

fn normalized(utterance: &str) -> String {
    utterance
        .trim()
        .trim_matches(|c: char| c.is_ascii_punctuation())
        .to_lowercase()
}

pub fn is_greeting(utterance: &str) -> bool {
    let trimmed = utterance.trim();
    for pattern in USER_GREETING_PATTERNS {
        if let Ok(re) = regex_lite::Regex::new(pattern) {
            if re.is_match(trimmed) {
                return true;
            }
        }
    }
    false
}

fn is_canned_greeting_line(line: &str) -> bool {
    for pattern in CANNED_OPENER_PATTERNS {
        if let Ok(re) = regex_lite::Regex::new(pattern) {
            if re.is_match(line.trim()) {
                return true;
            }
        }
    }
    false
}

fn is_short_utterance(utterance: &str) -> bool {
    utterance.trim().chars().count() < SHORT_UTTERANCE_MAX_CHARS
}

fn is_acknowledgement(utterance: &str) -> bool {
    let normalized = normalized(utterance);
    ACKNOWLEDGEMENTS.contains(&normalized.as_str())
}

fn is_negative_closer(utterance: &str) -> bool {
    let normalized = normalized(utterance);
    NEGATIVE_CLOSERS.contains(&normalized.as_str())
}

fn concerns_identity(utterance: &str) -> bool {
    let lowered = utterance.to_lowercase();
    IDENTITY_PROMPTS.iter().any(|p| lowered.contains(p))
}

fn is_topic_switch_line(lowered_line: &str) -> bool {
    TOPIC_SWITCH_TRIGGERS.iter().any(|t| lowered_line.contains(t))
}

fn is_mood_breaking_question(lowered_line: &str) -> bool {
    MOOD_BREAKING_QUESTIONS
        .iter()
        .any(|q| lowered_line.contains(q))
}

fn mentions_unrelated_topic(lowered_line: &str) -> bool {
    UNRELATED_TOPIC_KEYWORDS
        .iter()
        .any(|k| lowered_line.contains(k))
}

fn mentions_identity(lowered_line: &str) -> bool {
    IDENTITY_KEYWORDS.iter().any(|k| lowered_line.contains(k))
}
