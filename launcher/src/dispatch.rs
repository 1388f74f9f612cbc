//! Decides what a process invocation does, before anything with side effects runs.

use crate::cli::Command;

/// What the process should do with its invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Run the command's action and exit.
    OneShot(Command),
    /// Started by autorun while auto start is disabled; exit without doing anything.
    Skip,
    /// Start the lifecycle controller.
    Launch,
}

/// Maps the parsed invocation and the persisted auto start flag to a [`Dispatch`].
///
/// A one-shot command always wins over the autorun modifier.
#[must_use]
pub const fn plan(command: Option<Command>, autorun: bool, auto_start: bool) -> Dispatch {
    match command {
        Some(command) => Dispatch::OneShot(command),
        None if autorun && !auto_start => Dispatch::Skip,
        None => Dispatch::Launch,
    }
}
