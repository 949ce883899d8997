//! Daily Dispatch - one scheduled message per day to a messaging group
//!
//! Keeps a messaging session alive, fires at a fixed local time, retries
//! within a bounded window, and records delivery durably so a restart or
//! reconnect never sends the same day's message twice.

pub mod error;
pub mod config;
pub mod schedule;
pub mod state;
pub mod session;
pub mod bridge;
pub mod controller;
pub mod hooks;
pub mod dispatcher;

pub use error::{Error, Result};
