//! Control-channel command queue.
//!
//! FIFO of commands waiting for the control connection, plus the single
//! in-flight slot. `promote` pushes a command to the head so it goes out next
//! (ABOR, chained commands such as RNTO). The queue can be *held* while a
//! passive data connection is being negotiated so nothing else is dispatched
//! between `PASV` and the transfer command that uses it.
//!
//! The continuation type is generic; the session stores its reply routing
//! there and the queue never looks inside it.

use crate::ftp::types::Command;
use std::collections::VecDeque;

/// A command and whatever should happen with its reply.
#[derive(Debug)]
pub struct QueuedCommand<C> {
    pub command: Command,
    pub continuation: C,
}

#[derive(Debug)]
pub struct CommandQueue<C> {
    pending: VecDeque<QueuedCommand<C>>,
    in_flight: Option<QueuedCommand<C>>,
    held: bool,
}

impl<C> Default for CommandQueue<C> {
    fn default() -> Self {
        Self {
            pending: VecDeque::new(),
            in_flight: None,
            held: false,
        }
    }
}

impl<C> CommandQueue<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the tail.
    pub fn enqueue(&mut self, command: Command, continuation: C) {
        self.pending.push_back(QueuedCommand {
            command,
            continuation,
        });
    }

    /// Insert at the head; it is the next command dispatched.
    pub fn promote(&mut self, command: Command, continuation: C) {
        self.pending.push_front(QueuedCommand {
            command,
            continuation,
        });
    }

    /// Move the head into the in-flight slot and return the command to write.
    ///
    /// Returns `None` while a command is in flight, while held, or when empty.
    pub fn dispatch_next(&mut self) -> Option<&Command> {
        if self.in_flight.is_some() || self.held {
            return None;
        }
        let next = self.pending.pop_front()?;
        self.in_flight = Some(next);
        self.in_flight.as_ref().map(|q| &q.command)
    }

    /// Whether the head of the waiting list is `verb`.
    pub fn next_is(&self, verb: &str) -> bool {
        self.pending.front().map_or(false, |q| q.command.is(verb))
    }

    pub fn in_flight(&self) -> Option<&QueuedCommand<C>> {
        self.in_flight.as_ref()
    }

    pub fn in_flight_mut(&mut self) -> Option<&mut QueuedCommand<C>> {
        self.in_flight.as_mut()
    }

    /// Clear the in-flight slot, handing back its command for completion.
    pub fn complete(&mut self) -> Option<QueuedCommand<C>> {
        self.in_flight.take()
    }

    /// Stop dispatching until [`release`](Self::release).
    pub fn hold(&mut self) {
        self.held = true;
    }

    pub fn release(&mut self) {
        self.held = false;
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Nothing in flight, nothing waiting, not held.
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.pending.is_empty() && !self.held
    }

    pub fn len(&self) -> usize {
        self.pending.len() + usize::from(self.in_flight.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove everything, in-flight first, for failing on shutdown.
    pub fn drain(&mut self) -> Vec<QueuedCommand<C>> {
        let mut all: Vec<QueuedCommand<C>> = self.in_flight.take().into_iter().collect();
        all.extend(self.pending.drain(..));
        self.held = false;
        all
    }
}
