//! Restock waitlist engine: priority-ordered waitlists for out-of-stock
//! products, deposit-backed promotion, back-in-stock fan-out, and a durable
//! notification queue with retry and backoff.

pub mod analytics;
pub mod collab;
pub mod config;
pub mod db;
pub mod deposit;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod mailer;
pub mod messages;
pub mod model;
pub mod outbox;
pub mod settings;
pub mod storefront;
pub mod sweeper;
pub mod waitlist;

pub use engine::{Collaborators, Engine, EnginePolicy};
pub use error::{Result, WaitlistError};
