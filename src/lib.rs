//! # Change Feed
//!
//! A durable, multi-consumer change feed with reference-counted pruning,
//! plus a lossy live broadcast path for in-process consumers.
//!
//! ## Core Concepts
//!
//! - **Changes**: Immutable facts about a state transition of some data item
//! - **Registrations**: Durable subscribers; each new change is added to the
//!   pending set of every registration that exists when it is written
//! - **Pruning**: A change is deleted once the last registration holding it
//!   acknowledges it
//! - **Live handlers**: Ephemeral callbacks fed through bounded queues; a full
//!   queue drops the change for that handler only
//!
//! ## Example
//!
//! ```ignore
//! use changefeed::{ChangeInput, ChangefeedConfig, Logic};
//!
//! let feed = Logic::open(&ChangefeedConfig::default())?;
//!
//! feed.registration_upsert("billing")?;
//! feed.handler_create(|change| println!("live: {}", change.id))?;
//!
//! feed.change_upsert(
//!     ChangeInput::new("timer-42")
//!         .with_service_name("timers")
//!         .with_action("stop")
//!         .with_version(3),
//! )?;
//!
//! let pending = feed.registration_changes_read("billing")?;
//! let ids: Vec<String> = pending.into_iter().map(|c| c.id).collect();
//! feed.registration_change_acknowledge("billing", &ids)?;
//! ```

pub mod config;
pub mod error;
pub mod handlers;
pub mod lifetime;
pub mod logic;
pub mod meta;
pub mod types;
pub mod wire;

// Re-exports
pub use config::{ChangefeedConfig, MetaConfig};
pub use error::{ChangeError, ErrorKind, Result};
pub use handlers::{HandlerId, HandlerRegistry, DEFAULT_QUEUE_CAPACITY};
pub use lifetime::Lifetime;
pub use logic::Logic;
#[cfg(feature = "sqlite")]
pub use meta::SqlMeta;
pub use meta::{open_meta, FileMeta, MemoryMeta, Meta, MetaSnapshot};
pub use types::*;
pub use wire::{ChangeDigest, WirePayload, Wrapper, WrapperType};
