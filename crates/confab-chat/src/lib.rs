//! # confab-chat
//!
//! Service layer of the confab messaging core.
//!
//! [`ChatFacade`] is the single entry point for the host application. It
//! composes the store components from `confab-store` inside one write
//! transaction per operation, consults the external collaborators
//! ([`UserDirectory`], [`ContactPolicy`]) before writing and hands
//! notifications to a [`NotificationSink`] only after the transaction has
//! committed.

pub mod collaborators;
pub mod config;
pub mod error;
pub mod facade;
pub mod notify;

pub use collaborators::{AllowAll, AnyUser, ContactPolicy, UserDirectory};
pub use config::ChatConfig;
pub use error::{ChatError, Result};
pub use facade::{ChatFacade, OutgoingMessage};
pub use notify::{ChannelNotifier, Notification, NotificationPayload, NotificationSink, NoopNotifier};
