//! # Mathpad Common Library
//!
//! Shared code for the mathpad row pipeline including:
//! - Error types
//! - Configuration loading and data folder resolution
//! - Event types (RowEvent enum) and the EventBus
//! - Clock abstraction and content hashing utilities

pub mod config;
pub mod error;
pub mod events;
pub mod hash;
pub mod time;

pub use error::{Error, Result};
pub use time::{Clock, ManualClock, SystemClock};
