//! Live handler registry for ephemeral change broadcasts.
//!
//! Each live handler owns a bounded FIFO queue and one worker thread that
//! feeds queued changes to a caller-supplied callback. Broadcasting never
//! blocks: when a handler's queue is full the change is dropped for that
//! handler only. Live handlers are not durable; a consumer that must not
//! miss changes uses a registration instead.
//!
//! # Example
//!
//! ```ignore
//! let registry = HandlerRegistry::new(100, Lifetime::new());
//!
//! let id = registry.create(|change| {
//!     println!("live change {} for {}", change.id, change.data_id);
//! })?;
//!
//! registry.broadcast(&change);
//! registry.delete(id)?;
//! ```

mod registry;
mod types;

pub use registry::{HandlerRegistry, DEFAULT_QUEUE_CAPACITY};
pub use types::HandlerId;
