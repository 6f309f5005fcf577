// src/connection/pipeline.rs

//! The queue of commands awaiting replies, and the dispatch of each reply to the
//! continuation that asked for it.
//!
//! The server answers in request order, so the oldest entry always owns the next
//! reply. Every entry is resolved exactly once: with the reply, with the server's
//! error, or with `ConnectionClosed` when the connection goes away first.

use crate::core::protocol::{RespFrame, RespValue};
use crate::core::ClientError;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use tracing::error;

pub type SuccessContinuation = Box<dyn FnOnce(RespValue) + Send>;
pub type FailureContinuation = Box<dyn FnOnce(ClientError) + Send>;

/// The continuation pair of one command whose bytes were handed to the engine.
pub struct PendingCommand {
    on_success: SuccessContinuation,
    on_failure: FailureContinuation,
}

impl PendingCommand {
    pub fn new(
        on_success: impl FnOnce(RespValue) + Send + 'static,
        on_failure: impl FnOnce(ClientError) + Send + 'static,
    ) -> Self {
        Self {
            on_success: Box::new(on_success),
            on_failure: Box::new(on_failure),
        }
    }

    /// Resolves the command with what the engine delivered for it. `None` means the
    /// connection was torn down before a reply arrived.
    pub fn resolve(self, reply: Option<RespFrame>) {
        match reply {
            None => self.fail(ClientError::ConnectionClosed),
            Some(RespFrame::Error(message)) => self.fail(ClientError::Server(message)),
            Some(frame) => self.succeed(RespValue::from(frame)),
        }
    }

    pub fn succeed(self, value: RespValue) {
        let on_success = self.on_success;
        guarded("success continuation", move || on_success(value));
    }

    pub fn fail(self, error: ClientError) {
        let on_failure = self.on_failure;
        guarded("failure continuation", move || on_failure(error));
    }
}

impl std::fmt::Debug for PendingCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCommand").finish_non_exhaustive()
    }
}

/// Outstanding commands in the order they were sent.
#[derive(Debug, Default)]
pub struct CommandPipeline {
    queue: VecDeque<PendingCommand>,
}

impl CommandPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, command: PendingCommand) {
        self.queue.push_back(command);
    }

    pub fn pop_front(&mut self) -> Option<PendingCommand> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Removes every entry, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = PendingCommand> + '_ {
        self.queue.drain(..)
    }
}

/// Runs user code on the loop thread, containing any panic so it cannot unwind into
/// the reactor.
pub(crate) fn guarded(kind: &str, user_code: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(user_code)) {
        error!(
            "A {} panicked: {}",
            kind,
            panic_message(payload.as_ref())
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}
