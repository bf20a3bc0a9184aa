//! # palaver-shared
//!
//! Types shared by the Palaver store and server: identifiers, domain models,
//! the JSON wire protocol spoken over the real-time socket, input validation,
//! and the block-list authorization gate.

pub mod constants;
pub mod error;
pub mod gate;
pub mod models;
pub mod protocol;
pub mod rooms;
pub mod types;
pub mod validation;

pub use error::ChatError;
pub use types::{MessageId, RequestId, UserId};
