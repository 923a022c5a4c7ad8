//! Object Events
//!
//! Change notifications flow through a durable outbox:
//!
//! 1. The read/write core appends an [`EventRecord`] to the same write batch
//!    as the change it describes.
//! 2. An [`OutboxRelay`] drains pending records and hands each to an
//!    [`EventPublisher`].
//! 3. Delivered records are marked; failed ones are retried on the next poll
//!    until they run out of attempts and are dead-lettered.

mod publisher;
mod record;
mod relay;

pub use publisher::{BroadcastPublisher, EventPublisher, PublishError, TracingPublisher};
pub use record::{EventKind, EventRecord, EventStamp, OutboxEntry};
pub use relay::{OutboxRelay, RelayHandle, RelayStats};
