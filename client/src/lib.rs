//! Client side of the health assistant conversation service.
//!
//! [`HttpApi`] speaks the REST surface; [`ChatState`] keeps the local mirror
//! of conversations and the open thread and drives the append, ask, attach
//! sequence of a send.

pub mod api;
pub mod error;
pub mod state;

pub use api::{ConversationApi, HttpApi};
pub use error::ClientError;
pub use state::{ChatState, Draft};
