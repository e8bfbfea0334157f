//! # chatwarden
//!
//! Group-chat moderation: a trust-gated content filter for new members and a
//! community-driven warn/unwarn escalation ladder.
//!
//! ## Features
//!
//! - **Trust gate**: links, mentions and photos from new members are deleted
//!   until they have been around long enough and posted enough messages
//! - **Allow-lists**: per-entity regex overrides for otherwise forbidden entities
//! - **Community escalation**: `/warn` and `/unwarn` replies, with restrictions
//!   whose duration grows with every repeat offence
//! - **Replicated state**: synchronous in-memory reads with asynchronous
//!   persistence to a document store
//! - **Hot reload**: `bot.yaml` changes are applied without a restart
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chatwarden::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BotConfiguration::default();
//!     let backend = Arc::new(FileDocumentStore::open(&config.data_dir).await?);
//!     let store = Arc::new(ModerationStore::open(backend).await?);
//!
//!     let platform = Arc::new(ConsolePlatform::new());
//!     platform.connect().await?;
//!     let events = platform.get_event_receiver().expect("console platform is open");
//!
//!     let gate = ModerationGate::new(&config, store, platform)?;
//!     gate.run(events).await;
//!     Ok(())
//! }
//! ```

pub mod types;
pub mod store;
pub mod config;
pub mod platforms;
pub mod bot;

// Re-export commonly used items
pub mod prelude {
    pub use crate::bot::{ModerationGate, ModerationRules};
    pub use crate::config::{BotConfiguration, ConfigChangeEvent, ConfigurationManager};
    pub use crate::platforms::{console::ConsolePlatform, ChatPlatform};
    pub use crate::store::{DocumentStore, FileDocumentStore, MemoryDocumentStore, ModerationStore};
    pub use crate::types::{ChatEvent, ChatUser, IncomingMessage, ModerationAction};
    pub use anyhow::Result;
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
