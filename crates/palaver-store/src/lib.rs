//! # palaver-store
//!
//! Durable storage for Palaver, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for the social graph
//! (users, friendships, friend requests, blocks) and for direct messages and
//! their reactions. Operations that must keep several rows consistent run in
//! a single transaction.

pub mod database;
pub mod messages;
pub mod migrations;
pub mod reactions;
pub mod social;
pub mod users;

mod error;
mod rows;

pub use database::Database;
pub use error::{Result, StoreError};
pub use social::BlockOutcome;
pub use users::{NewUser, ProfileUpdate, StoreStats};
