//! Core logic of the agent: the reasoning loop, tool servers and their
//! registry, conversation state and the execution trace.

#![deny(missing_docs)]
#![deny(clippy::missing_safety_doc)]

#[macro_use]
extern crate tracing;

mod agent;
pub mod conversation;
pub mod decision;
pub mod error;
mod model_client;
pub mod server;
pub mod tool;
pub mod trace;
pub mod transport;

pub use agent::{Agent, AgentBuilder, AgentStage, TurnPolicy, Warning};
pub use error::{Error, ErrorKind};
