use chrono::Duration as ChronoDuration;

use crate::database::{Message, SenderKind};

/// Default number of recent messages the window keeps.
pub const DEFAULT_WINDOW_CAP: usize = 50;

/// How close (in seconds) a store echo of a user message may land to its
/// optimistic copy and still be treated as the same message. Wide on purpose:
/// clock and latency skew between the writer and the feed can exceed a few
/// seconds.
const ECHO_WINDOW_SECS: i64 = 60;

/// In-memory, time-ordered view of the most recent messages for one room.
///
/// Owned by the room's session. The feed merge below is the only writer of
/// the remote side; local optimistic appends go through `append_local` so
/// the monotonic ordering invariant holds for every insertion path.
pub struct ConversationWindow {
    messages: Vec<Message>,
    cap: usize,
    primed: bool,
}

impl Default for ConversationWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationWindow {
    pub fn new() -> Self {
        Self::with_cap(DEFAULT_WINDOW_CAP)
    }

    pub fn with_cap(cap: usize) -> Self {
        Self {
            messages: Vec::new(),
            cap,
            primed: false,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Room switch: drop everything, including the primed flag, so the next
    /// feed snapshot replaces wholesale again.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.primed = false;
    }

    /// Append a locally-originated message (optimistic user copy or a
    /// companion line about to be persisted). If its timestamp does not
    /// advance past the current last message it is bumped to last + 1ms
    /// before insertion. Returns the message as inserted, so the caller can
    /// persist the exact same timestamp.
    pub fn append_local(&mut self, mut message: Message) -> Message {
        if let Some(last) = self.messages.last() {
            if message.created_at <= last.created_at {
                message.created_at = last.created_at + ChronoDuration::milliseconds(1);
            }
        }
        self.messages.push(message.clone());
        self.truncate_to_cap();
        message
    }

    /// Reconcile a whole-collection feed snapshot against the local set.
    ///
    /// The first snapshot for a freshly opened room replaces the local set
    /// wholesale. After that, each remote message is dropped when its id is
    /// already present locally, and a remote *user* message is additionally
    /// dropped when a local message carries identical content within
    /// `ECHO_WINDOW_SECS` of it (the store echoing a message already rendered
    /// optimistically). Companion messages are never created optimistically,
    /// so they are always accepted.
    pub fn apply_snapshot(&mut self, remote: Vec<Message>) {
        if !self.primed {
            self.messages = remote;
            sort_window(&mut self.messages);
            self.primed = true;
            self.truncate_to_cap();
            return;
        }

        for incoming in remote {
            if self.messages.iter().any(|m| m.id == incoming.id) {
                continue;
            }
            if incoming.sender == SenderKind::User && self.has_recent_echo(&incoming) {
                continue;
            }
            self.messages.push(incoming);
        }

        sort_window(&mut self.messages);
        self.truncate_to_cap();
    }

    fn has_recent_echo(&self, incoming: &Message) -> bool {
        self.messages.iter().any(|local| {
            local.sender == SenderKind::User
                && local.content == incoming.content
                && (local.created_at - incoming.created_at)
                    .num_seconds()
                    .abs()
                    <= ECHO_WINDOW_SECS
        })
    }

    fn truncate_to_cap(&mut self) {
        if self.messages.len() > self.cap {
            let excess = self.messages.len() - self.cap;
            self.messages.drain(..excess);
        }
    }
}

fn sort_window(messages: &mut [Message]) {
    messages.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn msg(id: &str, ms: i64, sender: SenderKind, content: &str) -> Message {
        Message {
            id: id.to_string(),
            room_id: "room-1".to_string(),
            persona_id: "persona-1".to_string(),
            sender,
            content: content.to_string(),
            created_at: at(ms),
            kind: "text".to_string(),
            is_sent: true,
        }
    }

    #[test]
    fn first_snapshot_replaces_wholesale() {
        let mut window = ConversationWindow::new();
        window.apply_snapshot(vec![
            msg("b", 2000, SenderKind::Persona, "two"),
            msg("a", 1000, SenderKind::User, "one"),
        ]);

        assert_eq!(window.len(), 2);
        assert_eq!(window.messages()[0].id, "a");
        assert_eq!(window.messages()[1].id, "b");
    }

    #[test]
    fn merge_is_sorted_regardless_of_arrival_order() {
        let mut window = ConversationWindow::new();
        window.apply_snapshot(vec![msg("a", 1000, SenderKind::User, "one")]);

        window.apply_snapshot(vec![
            msg("a", 1000, SenderKind::User, "one"),
            msg("d", 4000, SenderKind::Persona, "four"),
            msg("b", 2000, SenderKind::Persona, "two"),
            msg("c", 3000, SenderKind::Persona, "three"),
        ]);

        let times: Vec<i64> = window
            .messages()
            .iter()
            .map(|m| m.created_at.timestamp_millis())
            .collect();
        let mut sorted = times.clone();
        sorted.sort();
        assert_eq!(times, sorted);
        assert_eq!(window.len(), 4);
    }

    #[test]
    fn equal_timestamps_break_ties_by_id() {
        let mut window = ConversationWindow::new();
        window.apply_snapshot(vec![
            msg("b", 1000, SenderKind::Persona, "second"),
            msg("a", 1000, SenderKind::Persona, "first"),
        ]);

        assert_eq!(window.messages()[0].id, "a");
        assert_eq!(window.messages()[1].id, "b");
    }

    #[test]
    fn applying_the_same_snapshot_twice_changes_nothing() {
        let snapshot = vec![
            msg("a", 1000, SenderKind::User, "one"),
            msg("b", 2000, SenderKind::Persona, "two"),
        ];

        let mut window = ConversationWindow::new();
        window.apply_snapshot(snapshot.clone());
        let once: Vec<String> = window.messages().iter().map(|m| m.id.clone()).collect();

        window.apply_snapshot(snapshot);
        let twice: Vec<String> = window.messages().iter().map(|m| m.id.clone()).collect();

        assert_eq!(once, twice);
    }

    #[test]
    fn store_echo_of_optimistic_user_message_is_suppressed() {
        let mut window = ConversationWindow::new();
        window.apply_snapshot(Vec::new());

        // Optimistic copy rendered locally with a locally-chosen id
        window.append_local(msg("local-1", 1000, SenderKind::User, "hello there"));

        // The store echoes the same content under its own id, 5s later
        window.apply_snapshot(vec![msg("store-9", 6000, SenderKind::User, "hello there")]);

        assert_eq!(window.len(), 1);
        assert_eq!(window.messages()[0].id, "local-1");
    }

    #[test]
    fn user_message_outside_echo_window_is_accepted() {
        let mut window = ConversationWindow::new();
        window.apply_snapshot(Vec::new());
        window.append_local(msg("local-1", 1000, SenderKind::User, "hello there"));

        // Same content but 2 minutes later: a genuine repeat, not an echo
        window.apply_snapshot(vec![msg(
            "store-9",
            121_000,
            SenderKind::User,
            "hello there",
        )]);

        assert_eq!(window.len(), 2);
    }

    #[test]
    fn companion_messages_are_always_accepted() {
        let mut window = ConversationWindow::new();
        window.apply_snapshot(Vec::new());
        window.append_local(msg("local-1", 1000, SenderKind::Persona, "same words"));

        window.apply_snapshot(vec![msg("store-9", 2000, SenderKind::Persona, "same words")]);

        assert_eq!(window.len(), 2);
    }

    #[test]
    fn append_local_bumps_non_advancing_timestamps() {
        let mut window = ConversationWindow::new();
        window.apply_snapshot(vec![msg("a", 5000, SenderKind::Persona, "anchor")]);

        let inserted = window.append_local(msg("b", 4000, SenderKind::User, "late clock"));
        assert_eq!(inserted.created_at.timestamp_millis(), 5001);

        let inserted = window.append_local(msg("c", 5001, SenderKind::User, "tied clock"));
        assert_eq!(inserted.created_at.timestamp_millis(), 5002);

        let inserted = window.append_local(msg("d", 9000, SenderKind::User, "fine"));
        assert_eq!(inserted.created_at.timestamp_millis(), 9000);
    }

    #[test]
    fn window_truncates_to_cap_keeping_newest() {
        let mut window = ConversationWindow::with_cap(3);
        window.apply_snapshot(Vec::new());
        for i in 0..5 {
            window.append_local(msg(
                &format!("m{}", i),
                1000 + i * 1000,
                SenderKind::User,
                "line",
            ));
        }

        assert_eq!(window.len(), 3);
        assert_eq!(window.messages()[0].id, "m2");
        assert_eq!(window.messages()[2].id, "m4");
    }

    #[test]
    fn clear_resets_primed_so_next_snapshot_replaces() {
        let mut window = ConversationWindow::new();
        window.apply_snapshot(vec![msg("a", 1000, SenderKind::User, "one")]);
        window.append_local(msg("local-1", 2000, SenderKind::User, "optimistic"));

        window.clear();
        assert!(window.is_empty());

        window.apply_snapshot(vec![msg("z", 9000, SenderKind::Persona, "fresh room")]);
        assert_eq!(window.len(), 1);
        assert_eq!(window.messages()[0].id, "z");
    }
}
