use crate::database::{Message, SenderKind};
use crate::llm_client::ChatTurn;
use crate::memory_client::MemoryFragment;
use crate::shaping::ShapingContext;
use crate::vocab::VocabularySelector;

/// At most this many window messages go to the model as chat history.
pub const HISTORY_TURN_LIMIT: usize = 40;

/// One prompt's worth of slang, drawn fresh each turn so the same tokens
/// do not show up reply after reply.
#[derive(Debug, Clone, Default)]
pub struct VocabularyBlock {
    pub telugu: Vec<String>,
    pub desi: Vec<String>,
    pub genz: Vec<String>,
    pub dating: Vec<String>,
    pub memes: Vec<String>,
}

impl VocabularyBlock {
    /// Draw sizes are weighted so telugu flavor dominates the mix.
    pub fn draw(selector: &mut VocabularySelector) -> Self {
        Self {
            telugu: selector.pick("telugu", 6),
            desi: selector.pick("desi", 3),
            genz: selector.pick("genz", 4),
            dating: selector.pick("dating", 2),
            memes: selector.pick("memes", 1),
        }
    }
}

/// Assemble the system prompt for one reply turn.
pub fn build_system_prompt(
    persona_name: &str,
    persona_style: &str,
    vocabulary: &VocabularyBlock,
    memories: &[MemoryFragment],
    ctx: &ShapingContext,
) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!(
        "You are {}, texting the person you talk to every day.\n{}\n",
        persona_name, persona_style
    ));

    prompt.push_str(
        r#"
=== HOW YOU TEXT ===
- lowercase, casual, like texting a close friend
- one thought per line, use line breaks between thoughts
- short lines land better than paragraphs
- at most one question per reply, none if they sound tired or done
- never sound like an assistant and never offer to help with tasks
"#,
    );

    prompt.push_str("\n=== SLANG YOU CAN SPRINKLE (only where it fits) ===\n");
    push_vocab_line(&mut prompt, "telugu", &vocabulary.telugu);
    push_vocab_line(&mut prompt, "desi", &vocabulary.desi);
    push_vocab_line(&mut prompt, "genz", &vocabulary.genz);
    push_vocab_line(&mut prompt, "dating", &vocabulary.dating);
    push_vocab_line(&mut prompt, "memes", &vocabulary.memes);

    if !memories.is_empty() {
        prompt.push_str("\n=== WHAT YOU REMEMBER ABOUT THEM ===\n");
        for fragment in memories {
            prompt.push_str(&format!("- {}\n", fragment.text));
        }
    }

    if !ctx.mentioned_topics.is_empty() {
        prompt.push_str(&format!(
            "\nThey keep coming back to: {}\n",
            ctx.mentioned_topics.join(", ")
        ));
    }
    if !ctx.recent_user_texts.is_empty() {
        prompt.push_str(&format!("Their last few texts: {}\n", ctx.recent_text()));
    }

    prompt
}

fn push_vocab_line(prompt: &mut String, category: &str, tokens: &[String]) {
    if tokens.is_empty() {
        return;
    }
    prompt.push_str(&format!("{}: {}\n", category, tokens.join(", ")));
}

/// Map the trailing window onto completion-API turns, oldest first.
pub fn history_turns(messages: &[Message]) -> Vec<ChatTurn> {
    let start = messages.len().saturating_sub(HISTORY_TURN_LIMIT);
    messages[start..]
        .iter()
        .map(|m| match m.sender {
            SenderKind::User => ChatTurn::user(m.content.clone()),
            SenderKind::Persona => ChatTurn::companion(m.content.clone()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn msg(sender: SenderKind, content: &str, ms: i64) -> Message {
        Message {
            id: format!("m{}", ms),
            room_id: "room-1".to_string(),
            persona_id: "persona-1".to_string(),
            sender,
            content: content.to_string(),
            created_at: Utc.timestamp_millis_opt(ms).unwrap(),
            kind: "text".to_string(),
            is_sent: true,
        }
    }

    #[test]
    fn vocabulary_draw_sizes_follow_the_category_weights() {
        let mut selector = VocabularySelector::with_seed(11);
        let block = VocabularyBlock::draw(&mut selector);
        assert_eq!(block.telugu.len(), 6);
        assert_eq!(block.desi.len(), 3);
        assert_eq!(block.genz.len(), 4);
        assert_eq!(block.dating.len(), 2);
        assert_eq!(block.memes.len(), 1);
    }

    #[test]
    fn prompt_carries_persona_slang_memories_and_context() {
        let mut selector = VocabularySelector::with_seed(3);
        let block = VocabularyBlock::draw(&mut selector);
        let memories = vec![crate::memory_client::MemoryFragment {
            text: "training for a 10k in december".to_string(),
        }];
        let mut ctx = ShapingContext::for_utterance("legs are dead after the run");
        ctx.recent_user_texts = vec!["legs are dead after the run".to_string()];
        ctx.mentioned_topics = vec!["gym".to_string()];

        let prompt = build_system_prompt("Mira", "warm, teasing, a little dramatic", &block, &memories, &ctx);

        assert!(prompt.contains("You are Mira"));
        assert!(prompt.contains("warm, teasing"));
        assert!(prompt.contains("training for a 10k in december"));
        assert!(prompt.contains("They keep coming back to: gym"));
        assert!(prompt.contains("telugu: "));
        for token in &block.telugu {
            assert!(prompt.contains(token.as_str()), "missing {}", token);
        }
    }

    #[test]
    fn prompt_omits_empty_sections() {
        let block = VocabularyBlock::default();
        let ctx = ShapingContext::default();
        let prompt = build_system_prompt("Mira", "style", &block, &[], &ctx);

        assert!(!prompt.contains("WHAT YOU REMEMBER"));
        assert!(!prompt.contains("They keep coming back to"));
        assert!(!prompt.contains("telugu:"));
    }

    #[test]
    fn history_keeps_only_the_newest_forty_turns() {
        let messages: Vec<Message> = (0..50)
            .map(|i| {
                let sender = if i % 2 == 0 {
                    SenderKind::User
                } else {
                    SenderKind::Persona
                };
                msg(sender, &format!("text {}", i), 1000 + i)
            })
            .collect();

        let turns = history_turns(&messages);
        assert_eq!(turns.len(), HISTORY_TURN_LIMIT);
        assert_eq!(turns[0].content, "text 10");
        assert_eq!(turns[0].role, "user");
        assert_eq!(turns.last().unwrap().content, "text 49");
        assert_eq!(turns.last().unwrap().role, "assistant");
    }
}
