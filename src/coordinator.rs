use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::database::{Message, MessageDraft, MessageStore, SenderKind};
use crate::delivery::DeliveryPlan;

/// Owns every write to the message store. Timestamps are decided by the
/// caller and locked before the first write, so optimistic copies and
/// persisted copies never drift apart.
pub struct Coordinator {
    store: Arc<dyn MessageStore>,
}

impl Coordinator {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    /// Persist one message under its locked timestamp and hand back the full
    /// stored record, id included.
    pub async fn persist_message(
        &self,
        draft: &MessageDraft,
        at: DateTime<Utc>,
    ) -> Result<Message> {
        let id = self.store.create(draft, at).await?;
        Ok(Message {
            id,
            room_id: draft.room_id.clone(),
            persona_id: draft.persona_id.clone(),
            sender: draft.sender,
            content: draft.content.clone(),
            created_at: at,
            kind: draft.kind.clone(),
            is_sent: true,
        })
    }

    /// Keep the room list preview current. Losing this update costs a stale
    /// preview, not a message, so failures only get logged.
    pub async fn bump_room_preview(&self, room_id: &str, content: &str, at: DateTime<Utc>) {
        if let Err(err) = self
            .store
            .update_room_last_message(room_id, content, at)
            .await
        {
            tracing::debug!("Room preview update failed for {}: {}", room_id, err);
        }
    }

    /// Walk a delivery plan to completion. Each line waits out its offset
    /// from the start of delivery, then persists under its locked timestamp.
    /// A line the store rejects is logged and skipped; the rest of the plan
    /// still goes out.
    pub async fn execute_plan(
        &self,
        room_id: &str,
        persona_id: &str,
        plan: DeliveryPlan,
        mut on_sent: impl FnMut(Message),
    ) -> usize {
        let started = tokio::time::Instant::now();
        let mut delivered = 0;

        for planned in plan.messages {
            tokio::time::sleep_until(started + planned.delay).await;

            let draft =
                MessageDraft::new(room_id, persona_id, SenderKind::Persona, &planned.content);
            match self.persist_message(&draft, planned.send_at).await {
                Ok(message) => {
                    self.bump_room_preview(room_id, &message.content, message.created_at)
                        .await;
                    delivered += 1;
                    on_sent(message);
                }
                Err(err) => {
                    tracing::warn!("Dropping one outgoing line the store rejected: {}", err);
                }
            }
        }
        delivered
    }
}
