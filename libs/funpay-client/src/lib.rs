//! Typed client for the FunPay marketplace.
//!
//! The upstream has no public API: everything here is built on the endpoints
//! and HTML fragments the web frontend itself uses. [`Account`] is the typed
//! facade (login probe, sales, chats, lot management), [`runner::Runner`] is
//! the long-poll event source that feeds the rest of the bot.

pub mod account;
pub mod error;
pub mod events;
pub mod html;
pub mod patterns;
pub mod runner;
pub mod types;

pub use account::Account;
pub use error::{ClientError, Result};
pub use events::{Event, MessageEventsStack};
pub use runner::{Runner, RunnerHandle};
