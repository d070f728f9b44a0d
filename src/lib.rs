pub mod checkin;
pub mod config;
pub mod coordinator;
pub mod database;
pub mod delivery;
pub mod greetings;
pub mod llm_client;
pub mod memory_client;
pub mod prompt;
pub mod runtime;
pub mod session;
pub mod shaping;
pub mod vocab;
pub mod window;

pub use checkin::CheckinOutcome;
pub use config::CompanionConfig;
pub use database::{Message, MessageStore, Room, SenderKind, SqliteStore};
pub use llm_client::{ChatTurn, GenerationBackend};
pub use memory_client::MemoryRecall;
pub use runtime::{ChatRuntime, ChatRuntimeBuilder};
pub use session::{SessionCommand, SessionEvent};
