use std::collections::VecDeque;
use std::pin::pin;

use serde_json::json;
use tokio::sync::{mpsc, oneshot};

use super::turn::{TurnEnv, TurnOutcome};
use super::{AgentStage, Command};
use crate::conversation::{Conversation, Message};
use crate::trace::TraceKind;

enum TurnEnd {
    Finished(TurnOutcome),
    Cancelled,
    Cleared(oneshot::Sender<()>),
}

/// The driver owning the conversation. Turns run one at a time; commands
/// arriving meanwhile are handled without waiting for the turn.
pub(super) struct AgentState {
    env: TurnEnv,
    conversation: Conversation,
    pending_inputs: VecDeque<String>,
}

impl AgentState {
    pub fn new(env: TurnEnv, conversation: Conversation) -> Self {
        Self {
            env,
            conversation,
            pending_inputs: VecDeque::new(),
        }
    }

    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut open = true;

        loop {
            let input = match self.pending_inputs.pop_front() {
                Some(input) => input,
                None if open => match commands.recv().await {
                    Some(command) => match self.handle_idle_command(command) {
                        Some(input) => input,
                        None => continue,
                    },
                    None => break,
                },
                None => break,
            };

            self.run_turn(input, &mut commands, &mut open).await;

            while open {
                match commands.try_recv() {
                    Ok(command) => {
                        if let Some(input) = self.handle_idle_command(command) {
                            self.pending_inputs.push_back(input);
                        }
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => open = false,
                }
            }
            if self.pending_inputs.is_empty() {
                self.env.set_stage(AgentStage::AwaitingInput);
                if let Some(on_idle) = &self.env.callbacks.on_idle {
                    on_idle();
                }
            }
        }

        debug!("agent `{}` stopped", self.conversation.id());
    }

    async fn run_turn(
        &mut self,
        input: String,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        open: &mut bool,
    ) {
        debug!("starting a turn in `{}`", self.conversation.id());
        let end = {
            let mut turn =
                pin!(self.env.run_turn(self.conversation.history(), input.clone()));
            loop {
                tokio::select! {
                    biased;
                    command = commands.recv(), if *open => match command {
                        Some(Command::UserInput(next)) => self.pending_inputs.push_back(next),
                        Some(Command::Cancel) => break TurnEnd::Cancelled,
                        Some(Command::Clear(ack)) => break TurnEnd::Cleared(ack),
                        Some(Command::History(reply)) => {
                            reply.send(self.conversation.history().to_vec()).ok();
                        }
                        None => *open = false,
                    },
                    outcome = &mut turn => break TurnEnd::Finished(outcome),
                }
            }
        };

        match end {
            TurnEnd::Finished(outcome) => {
                for message in outcome.messages {
                    self.conversation.append_message(message);
                }
            }
            TurnEnd::Cancelled => {
                info!("turn cancelled in `{}`", self.conversation.id());
                self.env.record(
                    TraceKind::FinalAnswer,
                    json!({
                        "content": null,
                        "truncated": false,
                        "cancelled": true,
                    }),
                );
                self.conversation.append_message(Message::user(input));
            }
            TurnEnd::Cleared(ack) => {
                info!("turn cancelled by clearing `{}`", self.conversation.id());
                self.clear();
                ack.send(()).ok();
            }
        }
    }

    /// Handles a command while no turn is running, returning the input to
    /// start a turn with.
    fn handle_idle_command(&mut self, command: Command) -> Option<String> {
        match command {
            Command::UserInput(input) => Some(input),
            Command::Cancel => {
                debug!("nothing to cancel");
                None
            }
            Command::Clear(ack) => {
                self.clear();
                ack.send(()).ok();
                None
            }
            Command::History(reply) => {
                reply.send(self.conversation.history().to_vec()).ok();
                None
            }
        }
    }

    fn clear(&mut self) {
        self.conversation.clear();
        self.env.recorder.clear(self.conversation.id());
        self.pending_inputs.clear();
        self.env.set_stage(AgentStage::AwaitingInput);
    }
}
