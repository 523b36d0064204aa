//! Domain models.

pub mod event;
pub mod mapping;
pub mod sync_log;
pub mod webhook;

pub use event::{
    EventIntent, EventOutcome, EventPayload, EventStatus, FieldSet, ItemRef, PendingEvent,
    Provider, ProviderIds, Stamped, SyncEventType, UserRef,
};
pub use mapping::{ItemCacheEntry, UserMapping};
pub use sync_log::{SyncLogEntry, SyncLogFilter};
pub use webhook::{NotificationType, WebhookPayload};
