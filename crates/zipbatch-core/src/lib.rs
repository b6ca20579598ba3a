//! Core of zipbatch: run archives of paired files through a per-item action and
//! repackage them by outcome.
//!
//! Front-ends (the CLI, or a chat adapter) stay thin: they feed uploads into
//! [`dispatch::Dispatcher`] or [`job::BatchJob`] and render what comes back.

pub mod actions;
pub mod archive_security;
pub mod classify;
pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod domain;
pub mod errors;
pub mod intake;
pub mod job;
pub mod logging;
pub mod outcome;
pub mod packager;
pub mod pacing;
pub mod pipeline;
pub mod progress;
pub mod state;

pub use errors::{Error, Result};
