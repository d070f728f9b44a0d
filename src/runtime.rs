use std::sync::Arc;

use anyhow::Result;
use flume::{Receiver, Sender};
use tokio::task::JoinHandle;

use crate::config::CompanionConfig;
use crate::coordinator::Coordinator;
use crate::database::{MessageStore, SqliteStore};
use crate::llm_client::{GenerationBackend, GenerationClient};
use crate::memory_client::{MemoryRecall, MemoryServiceClient};
use crate::session::{ChatSession, SessionCommand, SessionEvent};

/// A running companion chat backend. The embedding app pushes commands in
/// and renders the events that come out.
pub struct ChatRuntime {
    pub config: CompanionConfig,
    pub commands: Sender<SessionCommand>,
    pub events: Receiver<SessionEvent>,
    handle: JoinHandle<()>,
}

/// Assembles the store, generation backend and memory service, then spawns
/// the session loop. Every seam can be overridden before `build`.
pub struct ChatRuntimeBuilder {
    config: CompanionConfig,
    store: Option<Arc<dyn MessageStore>>,
    generation: Option<Arc<dyn GenerationBackend>>,
    memory: Option<Arc<dyn MemoryRecall>>,
}

impl ChatRuntimeBuilder {
    pub fn new(config: CompanionConfig) -> Self {
        Self {
            config,
            store: None,
            generation: None,
            memory: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_generation_backend(mut self, backend: Arc<dyn GenerationBackend>) -> Self {
        self.generation = Some(backend);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryRecall>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Must be called from inside a Tokio runtime; the session loop is
    /// spawned onto it.
    pub fn build(self) -> Result<ChatRuntime> {
        let config = self.config;

        let store: Arc<dyn MessageStore> = match self.store {
            Some(store) => store,
            None => Arc::new(SqliteStore::new(&config.database_path)?),
        };

        let generation: Arc<dyn GenerationBackend> = match self.generation {
            Some(backend) => backend,
            None => Arc::new(GenerationClient::new(
                config.llm_api_url.clone(),
                config.llm_api_key.clone(),
                config.llm_model.clone(),
            )),
        };

        let memory: Option<Arc<dyn MemoryRecall>> = match self.memory {
            Some(memory) => Some(memory),
            None => config
                .memory_api_url
                .as_ref()
                .map(|url| Arc::new(MemoryServiceClient::new(url.clone())) as Arc<dyn MemoryRecall>),
        };
        if memory.is_none() {
            tracing::info!("Memory service not configured, replies run without recall");
        }

        let coordinator = Arc::new(Coordinator::new(store));
        let (command_tx, command_rx) = flume::unbounded();
        let (event_tx, event_rx) = flume::unbounded();

        let session = ChatSession::new(
            config.clone(),
            coordinator,
            generation,
            memory,
            event_tx,
        );
        let handle = tokio::spawn(session.run_loop(command_rx));

        tracing::info!(
            "Chat runtime started (model {}, persona {})",
            config.llm_model,
            config.persona_name
        );

        Ok(ChatRuntime {
            config,
            commands: command_tx,
            events: event_rx,
            handle,
        })
    }
}

impl ChatRuntime {
    pub fn bootstrap(config: CompanionConfig) -> Result<Self> {
        ChatRuntimeBuilder::new(config).build()
    }

    pub fn open_room(&self, room_id: &str, user_id: &str, persona_id: &str) -> Result<()> {
        self.send(SessionCommand::OpenRoom {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            persona_id: persona_id.to_string(),
        })
    }

    pub fn submit(&self, text: &str) -> Result<()> {
        self.send(SessionCommand::Submit {
            text: text.to_string(),
        })
    }

    pub fn typing(&self) -> Result<()> {
        self.send(SessionCommand::Typing)
    }

    fn send(&self, command: SessionCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow::anyhow!("Session loop has stopped"))
    }

    /// Ask the loop to finish and wait for it.
    pub async fn shutdown(self) {
        let _ = self.commands.send(SessionCommand::Close);
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::testing::InMemoryStore;
    use crate::database::SenderKind;
    use crate::greetings::OPENING_LINE;
    use crate::llm_client::testing::ScriptedBackend;

    fn test_runtime(backend: ScriptedBackend) -> (Arc<InMemoryStore>, ChatRuntime) {
        let store = Arc::new(InMemoryStore::new());
        let runtime = ChatRuntimeBuilder::new(CompanionConfig::default())
            .with_store(store.clone())
            .with_generation_backend(Arc::new(backend))
            .build()
            .expect("runtime builds");
        (store, runtime)
    }

    #[tokio::test(start_paused = true)]
    async fn a_built_runtime_round_trips_a_conversation() {
        let backend = ScriptedBackend::new().reply_with(&["with you in spirit"]);
        let (store, runtime) = test_runtime(backend);

        runtime
            .open_room("room-1", "user-1", "persona-1")
            .expect("open");
        runtime.submit("wish you were here").expect("submit");

        loop {
            let event = runtime.events.recv_async().await.expect("events open");
            if matches!(event, SessionEvent::ComposingChanged(false)) {
                break;
            }
        }

        let messages = store.read_recent("room-1", 10).await.expect("read");
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].content, OPENING_LINE);
        assert_eq!(messages[1].sender, SenderKind::User);
        assert_eq!(messages[2].content, "with you in spirit");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_the_session_loop() {
        let (_store, runtime) = test_runtime(ScriptedBackend::new());
        runtime.shutdown().await;
    }
}
