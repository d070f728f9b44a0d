use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::checkin::{CheckinOutcome, CheckinScheduler};
use crate::config::CompanionConfig;
use crate::coordinator::Coordinator;
use crate::database::{Message, MessageDraft, Room, SenderKind};
use crate::delivery::DeliveryDecider;
use crate::greetings::OPENING_LINE;
use crate::llm_client::GenerationBackend;
use crate::memory_client::{recall_best_effort, MemoryRecall};
use crate::prompt::{build_system_prompt, history_turns, VocabularyBlock};
use crate::shaping::{shape_reply, ShapingContext};
use crate::vocab::VocabularySelector;
use crate::window::{ConversationWindow, DEFAULT_WINDOW_CAP};

/// What the embedding app asks the session to do.
#[derive(Debug, Clone)]
pub enum SessionCommand {
    OpenRoom {
        room_id: String,
        user_id: String,
        persona_id: String,
    },
    Submit {
        text: String,
    },
    /// The user is typing. Cancels any pending check-in.
    Typing,
    Close,
}

/// What the session reports back to the embedding app.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The merged window changed; this is the full feed to render.
    FeedUpdated(Vec<Message>),
    /// One streamed piece of the reply being generated.
    ReplyChunk(String),
    /// The companion's typing indicator.
    ComposingChanged(bool),
    /// Generation failed before any reply content arrived.
    ReplyFailed(String),
    /// A check-in evaluation for the open room finished.
    CheckinResolved(CheckinOutcome),
}

struct RoomContext {
    room_id: String,
    persona_id: String,
    feed: flume::Receiver<Vec<Message>>,
}

/// One live conversation. Owns the merged window and drives the whole
/// submit/reply cycle; the embedding app talks to it over channels.
pub struct ChatSession {
    config: CompanionConfig,
    coordinator: Arc<Coordinator>,
    generation: Arc<dyn GenerationBackend>,
    memory: Option<Arc<dyn MemoryRecall>>,
    checkin: Arc<CheckinScheduler>,
    selector: VocabularySelector,
    decider: DeliveryDecider,
    window: ConversationWindow,
    events: flume::Sender<SessionEvent>,
    room: Option<RoomContext>,
    checkin_cancel: CancellationToken,
}

impl ChatSession {
    pub fn new(
        config: CompanionConfig,
        coordinator: Arc<Coordinator>,
        generation: Arc<dyn GenerationBackend>,
        memory: Option<Arc<dyn MemoryRecall>>,
        events: flume::Sender<SessionEvent>,
    ) -> Self {
        let checkin = Arc::new(CheckinScheduler::new(coordinator.clone(), config.clone()));
        Self {
            config,
            coordinator,
            generation,
            memory,
            checkin,
            selector: VocabularySelector::new(),
            decider: DeliveryDecider::new(),
            window: ConversationWindow::new(),
            events,
            room: None,
            checkin_cancel: CancellationToken::new(),
        }
    }

    /// Seed the vocabulary and delivery draws for reproducible runs.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.selector = VocabularySelector::with_seed(seed);
        self.decider = DeliveryDecider::with_seed(seed);
        self
    }

    /// Process commands and feed snapshots until the command channel closes.
    pub async fn run_loop(mut self, commands: flume::Receiver<SessionCommand>) {
        loop {
            let feed = self.room.as_ref().map(|r| r.feed.clone());
            tokio::select! {
                command = commands.recv_async() => match command {
                    Ok(SessionCommand::OpenRoom { room_id, user_id, persona_id }) => {
                        self.open_room(room_id, user_id, persona_id).await;
                    }
                    Ok(SessionCommand::Submit { text }) => self.handle_submit(text).await,
                    Ok(SessionCommand::Typing) => self.checkin_cancel.cancel(),
                    Ok(SessionCommand::Close) | Err(_) => {
                        self.checkin_cancel.cancel();
                        break;
                    }
                },
                snapshot = recv_feed(feed) => match snapshot {
                    Some(snapshot) => self.apply_feed(snapshot),
                    None => {
                        tracing::warn!("Feed subscription closed, ending session");
                        break;
                    }
                },
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn apply_feed(&mut self, snapshot: Vec<Message>) {
        self.window.apply_snapshot(snapshot);
        self.emit(SessionEvent::FeedUpdated(self.window.messages().to_vec()));
    }

    async fn open_room(&mut self, room_id: String, user_id: String, persona_id: String) {
        tracing::info!("Opening room {} for {}", room_id, user_id);
        self.window.clear();
        // A check-in armed for the previous room dies with the switch
        self.checkin_cancel.cancel();
        self.checkin_cancel = CancellationToken::new();

        let room = Room::new(&room_id, &user_id, &persona_id);
        if let Err(err) = self.coordinator.store().ensure_room(&room).await {
            tracing::warn!("Could not ensure room {}: {}", room_id, err);
        }
        self.ensure_opening_message(&room_id, &persona_id).await;

        let feed = self.coordinator.store().subscribe(&room_id);

        match self
            .coordinator
            .store()
            .read_recent(&room_id, DEFAULT_WINDOW_CAP)
            .await
        {
            Ok(snapshot) => {
                self.window.apply_snapshot(snapshot);
                self.emit(SessionEvent::FeedUpdated(self.window.messages().to_vec()));
            }
            Err(err) => {
                tracing::warn!("Initial history load failed for {}: {}", room_id, err);
            }
        }

        self.spawn_checkin(&room_id, &persona_id);

        self.room = Some(RoomContext {
            room_id,
            persona_id,
            feed,
        });
    }

    /// A brand new room opens with the companion speaking first.
    async fn ensure_opening_message(&self, room_id: &str, persona_id: &str) {
        match self.coordinator.store().read_recent(room_id, 1).await {
            Ok(messages) if messages.is_empty() => {
                let draft = MessageDraft::new(room_id, persona_id, SenderKind::Persona, OPENING_LINE);
                match self.coordinator.persist_message(&draft, Utc::now()).await {
                    Ok(message) => {
                        self.coordinator
                            .bump_room_preview(room_id, &message.content, message.created_at)
                            .await;
                    }
                    Err(err) => {
                        tracing::warn!("Opening message failed to store: {}", err);
                    }
                }
            }
            Ok(_) => {}
            Err(err) => {
                tracing::debug!("Opening check failed for {}: {}", room_id, err);
            }
        }
    }

    fn spawn_checkin(&self, room_id: &str, persona_id: &str) {
        let scheduler = self.checkin.clone();
        let events = self.events.clone();
        let cancel = self.checkin_cancel.clone();
        let last = self.window.last().cloned();
        let room_id = room_id.to_string();
        let persona_id = persona_id.to_string();

        tokio::spawn(async move {
            let composing_events = events.clone();
            let outcome = scheduler
                .evaluate_and_fire(&room_id, &persona_id, last.as_ref(), cancel, move |c| {
                    let _ = composing_events.send(SessionEvent::ComposingChanged(c));
                })
                .await;
            tracing::debug!("Check-in for {} resolved: {:?}", room_id, outcome);
            let _ = events.send(SessionEvent::CheckinResolved(outcome));
        });
    }

    async fn handle_submit(&mut self, text: String) {
        let text = text.trim().to_string();
        if text.is_empty() {
            return;
        }
        let Some(room) = self.room.as_ref() else {
            tracing::warn!("Submit with no open room, dropping");
            return;
        };
        let room_id = room.room_id.clone();
        let persona_id = room.persona_id.clone();

        // The user is clearly here; a pending check-in would be noise
        self.checkin_cancel.cancel();

        let sent_at = Utc::now();
        let local = Message {
            id: uuid::Uuid::new_v4().to_string(),
            room_id: room_id.clone(),
            persona_id: persona_id.clone(),
            sender: SenderKind::User,
            content: text.clone(),
            created_at: sent_at,
            kind: "text".to_string(),
            is_sent: true,
        };
        let inserted = self.window.append_local(local);
        // The locked timestamp, monotonic bump included; every copy of this
        // message carries it
        let locked_at = inserted.created_at;
        self.emit(SessionEvent::FeedUpdated(self.window.messages().to_vec()));

        let draft = MessageDraft::new(&room_id, &persona_id, SenderKind::User, &text);
        match self.coordinator.persist_message(&draft, locked_at).await {
            Ok(_) => {
                self.coordinator
                    .bump_room_preview(&room_id, &text, locked_at)
                    .await;
            }
            Err(err) => {
                tracing::warn!("User message failed to store, replying anyway: {}", err);
            }
        }

        self.reply_turn(&room_id, &persona_id, locked_at).await;
    }

    async fn reply_turn(&mut self, room_id: &str, persona_id: &str, sent_at: DateTime<Utc>) {
        self.emit(SessionEvent::ComposingChanged(true));

        let ctx = ShapingContext::from_window(self.window.messages());

        let memories = match &self.memory {
            Some(memory) => {
                recall_best_effort(
                    memory.as_ref(),
                    room_id,
                    &ctx.recent_text(),
                    self.config.memory_top_k,
                    Duration::from_millis(self.config.memory_timeout_ms),
                )
                .await
            }
            None => Vec::new(),
        };

        let vocabulary = VocabularyBlock::draw(&mut self.selector);
        let prompt = build_system_prompt(
            &self.config.persona_name,
            &self.config.persona_style,
            &vocabulary,
            &memories,
            &ctx,
        );
        let turns = history_turns(self.window.messages());

        let stream = match self.generation.stream_reply(&prompt, turns).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::error!("Reply generation failed to start: {}", err);
                self.emit(SessionEvent::ReplyFailed(err.to_string()));
                self.emit(SessionEvent::ComposingChanged(false));
                return;
            }
        };

        let mut raw = String::new();
        let mut stream_error = None;
        while let Ok(item) = stream.recv_async().await {
            match item {
                Ok(chunk) => {
                    raw.push_str(&chunk);
                    self.emit(SessionEvent::ReplyChunk(chunk));
                }
                Err(err) => {
                    stream_error = Some(err);
                    break;
                }
            }
        }

        if raw.is_empty() {
            match stream_error {
                Some(err) => {
                    tracing::error!("Reply stream failed before any content: {}", err);
                    self.emit(SessionEvent::ReplyFailed(err.to_string()));
                }
                None => {
                    tracing::info!("Model produced an empty reply, skipping the turn");
                }
            }
            self.emit(SessionEvent::ComposingChanged(false));
            return;
        }
        if let Some(err) = stream_error {
            tracing::warn!(
                "Reply stream dropped mid-way, delivering the partial text: {}",
                err
            );
        }

        let lines = match shape_reply(&raw, &ctx) {
            Some(lines) => lines,
            None => {
                tracing::info!("Reply had no usable lines, skipping the turn");
                self.emit(SessionEvent::ComposingChanged(false));
                return;
            }
        };

        let plan = self.decider.plan(lines, &raw, sent_at);
        tracing::info!(
            "Delivering {} line(s) in {:?} mode",
            plan.messages.len(),
            plan.mode
        );

        let coordinator = self.coordinator.clone();
        let window = &mut self.window;
        let events = &self.events;
        coordinator
            .execute_plan(room_id, persona_id, plan, |message| {
                window.append_local(message);
                let _ = events.send(SessionEvent::FeedUpdated(window.messages().to_vec()));
            })
            .await;

        self.emit(SessionEvent::ComposingChanged(false));
    }
}

async fn recv_feed(feed: Option<flume::Receiver<Vec<Message>>>) -> Option<Vec<Message>> {
    match feed {
        Some(rx) => rx.recv_async().await.ok(),
        None => std::future::pending().await,
    }
}
