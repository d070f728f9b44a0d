use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::shaping::ends_in_terminal;

/// Replies need at least this many lines to qualify for batch delivery.
const BATCH_MIN_LINES: usize = 3;

/// Lines shorter than this must end in terminal punctuation to keep a reply
/// batch-eligible.
const BATCH_MIN_LINE_CHARS: usize = 8;

/// Raw replies longer than this lean harder toward batch mode.
const LONG_REPLY_CHARS: usize = 150;

const BATCH_PROBABILITY_LONG: f64 = 0.7;
const BATCH_PROBABILITY_SHORT: f64 = 0.5;

/// First companion message lands this long after the user's send time.
const REPLY_OFFSET_MS: i64 = 1000;

/// Timestamp spacing between consecutive batch messages.
const BATCH_STEP_MS: i64 = 1000;

/// Wall-clock pacing between consecutive batch sends.
const BATCH_PACING_MS: u64 = 1200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Each line lands as its own message, paced like someone typing.
    Batch,
    /// All lines joined into a single message.
    Paragraph,
}

/// One outgoing message with its locked timestamp and the wall-clock delay
/// to wait before sending it.
#[derive(Debug, Clone)]
pub struct PlannedMessage {
    pub content: String,
    pub send_at: DateTime<Utc>,
    pub delay: std::time::Duration,
}

/// The delivery shape for one reply turn. Built once, consumed once.
#[derive(Debug)]
pub struct DeliveryPlan {
    pub mode: DeliveryMode,
    pub messages: Vec<PlannedMessage>,
}

/// Chooses between batch and paragraph delivery. Owns its randomness so the
/// choice can be seeded in tests.
pub struct DeliveryDecider {
    rng: StdRng,
}

impl DeliveryDecider {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Decide how the shaped lines go out, anchored to the user's send time.
    pub fn plan(
        &mut self,
        lines: Vec<String>,
        raw_reply: &str,
        user_sent_at: DateTime<Utc>,
    ) -> DeliveryPlan {
        if batch_eligible(&lines) {
            let probability = if raw_reply.chars().count() > LONG_REPLY_CHARS {
                BATCH_PROBABILITY_LONG
            } else {
                BATCH_PROBABILITY_SHORT
            };
            if self.rng.gen::<f64>() < probability {
                return batch_plan(lines, user_sent_at);
            }
        }
        paragraph_plan(lines, user_sent_at)
    }
}

impl Default for DeliveryDecider {
    fn default() -> Self {
        Self::new()
    }
}

/// Batch mode needs enough lines, and every line substantial enough to stand
/// alone as a message.
fn batch_eligible(lines: &[String]) -> bool {
    if lines.len() < BATCH_MIN_LINES {
        return false;
    }
    lines
        .iter()
        .all(|line| line.chars().count() >= BATCH_MIN_LINE_CHARS || ends_in_terminal(line))
}

fn batch_plan(lines: Vec<String>, user_sent_at: DateTime<Utc>) -> DeliveryPlan {
    let messages = lines
        .into_iter()
        .enumerate()
        .map(|(i, content)| PlannedMessage {
            content,
            send_at: user_sent_at
                + Duration::milliseconds(REPLY_OFFSET_MS + i as i64 * BATCH_STEP_MS),
            delay: std::time::Duration::from_millis(i as u64 * BATCH_PACING_MS),
        })
        .collect();
    DeliveryPlan {
        mode: DeliveryMode::Batch,
        messages,
    }
}

fn paragraph_plan(lines: Vec<String>, user_sent_at: DateTime<Utc>) -> DeliveryPlan {
    let content = lines.join(" ");
    DeliveryPlan {
        mode: DeliveryMode::Paragraph,
        messages: vec![PlannedMessage {
            content,
            send_at: user_sent_at + Duration::milliseconds(REPLY_OFFSET_MS),
            delay: std::time::Duration::ZERO,
        }],
    }
}
