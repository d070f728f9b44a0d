use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio_util::sync::CancellationToken;

use crate::config::CompanionConfig;
use crate::coordinator::Coordinator;
use crate::database::{Message, MessageDraft, SenderKind};
use crate::greetings::{pick_greeting, GreetingRegister};

/// Terminal state of one check-in evaluation. Every run ends in exactly one
/// of these; there is no lingering armed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckinOutcome {
    /// Conditions for a check-in were not met, nothing happened.
    NotArmed,
    /// Armed, but the user came back during the wait.
    Cancelled,
    /// The check-in message went out and was read back.
    Delivered,
    /// Armed and fired, but the store rejected the message.
    Failed,
}

fn guard_key(room_id: &str) -> String {
    format!("checkin_guard:{}", room_id)
}

/// Sends a proactive "miss you" style message when the user reopens a room
/// after a long silence. One evaluation per room open; racing sessions are
/// kept apart by a persisted guard.
pub struct CheckinScheduler {
    coordinator: Arc<Coordinator>,
    config: CompanionConfig,
    rng: Mutex<StdRng>,
}

impl CheckinScheduler {
    pub fn new(coordinator: Arc<Coordinator>, config: CompanionConfig) -> Self {
        Self {
            coordinator,
            config,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_seed(coordinator: Arc<Coordinator>, config: CompanionConfig, seed: u64) -> Self {
        Self {
            coordinator,
            config,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Evaluate the arming conditions and, if they hold, wait out the
    /// composing delay and fire. The cancellation token is only consulted at
    /// the end of the wait: arming is cheap, and a user who typed in the
    /// meantime deserves a reply instead of a canned check-in.
    pub async fn evaluate_and_fire(
        &self,
        room_id: &str,
        persona_id: &str,
        last_message: Option<&Message>,
        cancel: CancellationToken,
        mut on_composing: impl FnMut(bool),
    ) -> CheckinOutcome {
        let Some(last) = last_message else {
            return CheckinOutcome::NotArmed;
        };

        let gap = Utc::now() - last.created_at;
        let min = chrono::Duration::hours(self.config.checkin_min_gap_hours as i64);
        let max = chrono::Duration::hours(self.config.checkin_max_gap_hours as i64);
        if gap <= min || gap >= max {
            return CheckinOutcome::NotArmed;
        }

        if self.guard_is_live(room_id).await {
            tracing::debug!("Check-in guard still live for {}, skipping", room_id);
            return CheckinOutcome::NotArmed;
        }

        // Claim the guard before waiting so a racing session backs off
        if let Err(err) = self.set_guard(room_id).await {
            tracing::warn!("Could not claim check-in guard for {}: {}", room_id, err);
            return CheckinOutcome::NotArmed;
        }

        tracing::info!(
            "Check-in armed for {} after {}h of silence",
            room_id,
            gap.num_hours()
        );

        on_composing(true);
        tokio::time::sleep(Duration::from_millis(self.config.compose_delay_ms)).await;

        if cancel.is_cancelled() {
            tracing::info!("Check-in for {} cancelled, the user is back", room_id);
            on_composing(false);
            return CheckinOutcome::Cancelled;
        }

        let outcome = self.fire(room_id, persona_id).await;
        on_composing(false);
        outcome
    }

    async fn fire(&self, room_id: &str, persona_id: &str) -> CheckinOutcome {
        let Some(text) = self.pick_line() else {
            self.clear_guard(room_id).await;
            return CheckinOutcome::Failed;
        };

        let draft = MessageDraft::new(room_id, persona_id, SenderKind::Persona, text);
        let now = Utc::now();
        match self.coordinator.persist_message(&draft, now).await {
            Ok(message) => {
                self.coordinator
                    .bump_room_preview(room_id, &message.content, message.created_at)
                    .await;

                self.confirm_visible(room_id, &message.id, "immediate").await;
                tokio::time::sleep(Duration::from_millis(self.config.confirm_delay_ms)).await;
                self.confirm_visible(room_id, &message.id, "delayed").await;

                CheckinOutcome::Delivered
            }
            Err(err) => {
                tracing::warn!("Check-in message for {} failed to store: {}", room_id, err);
                self.clear_guard(room_id).await;
                CheckinOutcome::Failed
            }
        }
    }

    fn pick_line(&self) -> Option<&'static str> {
        let register = GreetingRegister::from_config(&self.config.greeting_language);
        let mut rng = self.rng.lock().ok()?;
        Some(pick_greeting(register, &mut *rng))
    }

    /// Whether the check-in message actually landed in the feed. Purely
    /// diagnostic; the outcome does not change either way.
    async fn confirm_visible(&self, room_id: &str, message_id: &str, stage: &str) {
        match self.coordinator.store().read_recent(room_id, 10).await {
            Ok(messages) => {
                if messages.iter().any(|m| m.id == message_id) {
                    tracing::info!("Check-in visible on {} read-back", stage);
                } else {
                    tracing::warn!("Check-in missing from {} read-back", stage);
                }
            }
            Err(err) => {
                tracing::debug!("Check-in {} read-back failed: {}", stage, err);
            }
        }
    }

    async fn guard_is_live(&self, room_id: &str) -> bool {
        match self.coordinator.store().get_state(&guard_key(room_id)).await {
            Ok(Some(value)) => match value.parse::<DateTime<Utc>>() {
                Ok(armed_at) => {
                    let age = Utc::now() - armed_at;
                    age < chrono::Duration::seconds(self.config.checkin_guard_secs as i64)
                }
                Err(_) => false,
            },
            Ok(None) => false,
            Err(err) => {
                tracing::debug!("Check-in guard lookup failed for {}: {}", room_id, err);
                false
            }
        }
    }

    async fn set_guard(&self, room_id: &str) -> Result<()> {
        self.coordinator
            .store()
            .set_state(&guard_key(room_id), &Utc::now().to_rfc3339())
            .await
    }

    async fn clear_guard(&self, room_id: &str) {
        if let Err(err) = self.coordinator.store().delete_state(&guard_key(room_id)).await {
            tracing::debug!("Could not clear check-in guard for {}: {}", room_id, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::testing::InMemoryStore;
    use crate::database::MessageStore;

    fn test_config() -> CompanionConfig {
        CompanionConfig {
            compose_delay_ms: 4000,
            confirm_delay_ms: 1500,
            ..CompanionConfig::default()
        }
    }

    fn scheduler_with_store() -> (Arc<InMemoryStore>, Arc<CheckinScheduler>) {
        let store = Arc::new(InMemoryStore::new());
        let coordinator = Arc::new(Coordinator::new(store.clone()));
        let scheduler = Arc::new(CheckinScheduler::with_seed(coordinator, test_config(), 5));
        (store, scheduler)
    }

    fn message_hours_ago(hours: i64) -> Message {
        Message {
            id: "old-1".to_string(),
            room_id: "room-1".to_string(),
            persona_id: "persona-1".to_string(),
            sender: SenderKind::User,
            content: "see you".to_string(),
            created_at: Utc::now() - chrono::Duration::hours(hours),
            kind: "text".to_string(),
            is_sent: true,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn an_empty_room_never_arms() {
        let (_store, scheduler) = scheduler_with_store();
        let outcome = scheduler
            .evaluate_and_fire("room-1", "persona-1", None, CancellationToken::new(), |_| {})
            .await;
        assert_eq!(outcome, CheckinOutcome::NotArmed);
    }

    #[tokio::test(start_paused = true)]
    async fn short_and_ancient_gaps_do_not_arm() {
        let (store, scheduler) = scheduler_with_store();

        for hours in [1, 3, 600] {
            let last = message_hours_ago(hours);
            let outcome = scheduler
                .evaluate_and_fire(
                    "room-1",
                    "persona-1",
                    Some(&last),
                    CancellationToken::new(),
                    |_| {},
                )
                .await;
            assert_eq!(outcome, CheckinOutcome::NotArmed, "gap of {}h", hours);
        }
        assert_eq!(store.message_count("room-1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn a_five_hour_gap_fires_a_greeting() {
        let (store, scheduler) = scheduler_with_store();
        let last = message_hours_ago(5);

        let mut composing = Vec::new();
        let outcome = scheduler
            .evaluate_and_fire(
                "room-1",
                "persona-1",
                Some(&last),
                CancellationToken::new(),
                |c| composing.push(c),
            )
            .await;

        assert_eq!(outcome, CheckinOutcome::Delivered);
        assert_eq!(composing, vec![true, false]);
        assert_eq!(store.message_count("room-1"), 1);

        let messages = store.read_recent("room-1", 5).await.expect("read");
        assert_eq!(messages[0].sender, SenderKind::Persona);
        assert!(!messages[0].content.is_empty());

        // Guard stays claimed after a successful send
        let guard = store
            .get_state(&guard_key("room-1"))
            .await
            .expect("state read");
        assert!(guard.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn a_live_guard_blocks_the_next_session() {
        let (_store, scheduler) = scheduler_with_store();
        let last = message_hours_ago(5);

        let first = scheduler
            .evaluate_and_fire(
                "room-1",
                "persona-1",
                Some(&last),
                CancellationToken::new(),
                |_| {},
            )
            .await;
        assert_eq!(first, CheckinOutcome::Delivered);

        let second = scheduler
            .evaluate_and_fire(
                "room-1",
                "persona-1",
                Some(&last),
                CancellationToken::new(),
                |_| {},
            )
            .await;
        assert_eq!(second, CheckinOutcome::NotArmed);
    }

    #[tokio::test(start_paused = true)]
    async fn user_activity_during_the_wait_cancels_the_checkin() {
        let (store, scheduler) = scheduler_with_store();
        let last = message_hours_ago(5);
        let cancel = CancellationToken::new();

        let composing = Arc::new(Mutex::new(Vec::new()));
        let task = {
            let scheduler = scheduler.clone();
            let cancel = cancel.clone();
            let composing = composing.clone();
            tokio::spawn(async move {
                scheduler
                    .evaluate_and_fire("room-1", "persona-1", Some(&last), cancel, move |c| {
                        composing.lock().expect("composing lock").push(c)
                    })
                    .await
            })
        };

        // Let the scheduler arm and start its wait, then interrupt it
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(2000)).await;
        cancel.cancel();

        let outcome = task.await.expect("join");
        assert_eq!(outcome, CheckinOutcome::Cancelled);
        assert_eq!(store.message_count("room-1"), 0);
        assert_eq!(*composing.lock().expect("composing lock"), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn a_store_failure_at_firing_releases_the_guard() {
        let (store, scheduler) = scheduler_with_store();
        let last = message_hours_ago(5);

        store.fail_next_creates(1);
        let outcome = scheduler
            .evaluate_and_fire(
                "room-1",
                "persona-1",
                Some(&last),
                CancellationToken::new(),
                |_| {},
            )
            .await;

        assert_eq!(outcome, CheckinOutcome::Failed);
        assert_eq!(store.message_count("room-1"), 0);
        let guard = store
            .get_state(&guard_key("room-1"))
            .await
            .expect("state read");
        assert!(guard.is_none(), "a failed check-in must allow a retry");
    }
}
