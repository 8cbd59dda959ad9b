//! A provider-neutral protocol between the reasoning loop and language
//! models.
//!
//! The agent talks to every model through the types in this crate, so a
//! provider can be swapped (OpenAI, Groq, a scripted test model) without
//! touching the orchestration logic.
//!
//! Types in this crate don't define any behavior, instead they are the
//! constraints that the implementors should adhere to.

#![deny(missing_docs)]

mod error;
mod provider;
mod request;
mod response;

pub use error::*;
pub use provider::*;
pub use request::*;
pub use response::*;
