//! Core session lifecycle and recovery for the Telegram member manager.
//!
//! This crate has no CLI or Telegram client code. Storage sits behind the
//! [`recovery::SessionStorage`] port so recovery can run against the on-disk
//! session directory or an in-memory fake.

pub mod archive;
pub mod autosave;
pub mod cache;
pub mod config;
pub mod domain;
pub mod errors;
pub mod logging;
pub mod maintenance;
pub mod recovery;
pub mod session;
pub mod storage;
pub mod utils;

pub use errors::{Error, Result};
