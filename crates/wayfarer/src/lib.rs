//! An out-of-the-box agent that launches tool servers and talks to them
//! through a language model.
//!
//! The crate includes a CLI tool for using in the terminal. And you can also
//! use it as a library to bring agent functionality into your own host apps.

#![deny(missing_docs)]

#[macro_use]
extern crate tracing;

pub mod config;
mod session;

pub use config::Config;
pub use session::{Session, SessionBuilder};

/// Re-exports of [`wayfarer_core`] crate.
pub mod core {
    pub use wayfarer_core::*;
}
