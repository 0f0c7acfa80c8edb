//! Command channel.
//!
//! Commands are appended to the store and never deleted. A reader flips
//! `consumed` exactly once; consuming again is a no-op so that redelivered
//! tasks can replay safely. Apply a command and consume it in the same
//! transaction to get exactly-once effects.

use crate::core::error::{DrydockError, Result};
use crate::core::model::{Command, CommandKind};
use crate::core::policy::Actor;
use crate::core::store::{Store, StoreExt, Tables};
use crate::util::{CommandRef, ObjectRef};

/// Post, read, and consume commands.
#[derive(Clone, Copy)]
pub struct CommandChannel<'a> {
    store: &'a dyn Store,
    now_ms: u64,
}

impl<'a> CommandChannel<'a> {
    /// Channel over `store`, stamping new commands with `now_ms`.
    #[must_use]
    pub fn new(store: &'a dyn Store, now_ms: u64) -> Self {
        Self { store, now_ms }
    }

    /// Append an unconsumed command inside an open transaction.
    pub fn post_in(tables: &mut Tables, target: ObjectRef, author: Actor, kind: CommandKind, now_ms: u64) -> Command {
        let command = Command {
            reference: CommandRef::generate(),
            sequence: tables.next_command_sequence(),
            target,
            author,
            kind,
            consumed: false,
            created_at_ms: now_ms,
        };
        tables.commands.insert(command.sequence, command.clone());
        command
    }

    /// Unconsumed commands for `target`, oldest first.
    #[must_use]
    pub fn unconsumed_in(tables: &Tables, target: ObjectRef) -> Vec<Command> {
        tables
            .commands
            .values()
            .filter(|c| c.target == target && !c.consumed)
            .cloned()
            .collect()
    }

    /// Whether an unconsumed RELEASE targets `target`.
    #[must_use]
    pub fn is_releasing_in(tables: &Tables, target: ObjectRef) -> bool {
        tables
            .commands
            .values()
            .any(|c| c.target == target && !c.consumed && c.kind == CommandKind::Release)
    }

    /// Mark a command consumed inside an open transaction. Returns `true` if
    /// this call flipped it, `false` if it was already consumed.
    ///
    /// # Errors
    ///
    /// Returns [`DrydockError::NotFound`] for an unknown command.
    pub fn consume_in(tables: &mut Tables, command: CommandRef) -> Result<bool> {
        let row = tables
            .commands
            .values_mut()
            .find(|c| c.reference == command)
            .ok_or_else(|| DrydockError::NotFound(command.to_string()))?;
        if row.consumed {
            return Ok(false);
        }
        row.consumed = true;
        Ok(true)
    }

    /// Append an unconsumed command.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the store cannot be written.
    pub fn post(&self, target: ObjectRef, author: Actor, kind: CommandKind) -> Result<Command> {
        let now_ms = self.now_ms;
        let command = self
            .store
            .transaction(|tables| Ok(Self::post_in(tables, target, author, kind, now_ms)))?;
        tracing::debug!(
            target_ref = %command.target,
            author = %command.author,
            kind = %command.kind,
            sequence = command.sequence,
            "command posted"
        );
        Ok(command)
    }

    /// Unconsumed commands for `target`, ordered by sequence.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the store cannot be read.
    pub fn fetch_unconsumed(&self, target: ObjectRef) -> Result<Vec<Command>> {
        self.store.snapshot(|tables| Self::unconsumed_in(tables, target))
    }

    /// Mark a command consumed. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`DrydockError::NotFound`] for an unknown command.
    pub fn consume(&self, command: CommandRef) -> Result<bool> {
        self.store
            .transaction(|tables| Self::consume_in(tables, command))
    }

    /// Whether an unconsumed RELEASE targets `target`.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the store cannot be read.
    pub fn is_releasing(&self, target: ObjectRef) -> Result<bool> {
        self.store
            .snapshot(|tables| Self::is_releasing_in(tables, target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::InMemoryStore;
    use crate::util::LeaseRef;

    #[test]
    fn fetch_is_ordered_and_consume_is_idempotent() {
        let store = InMemoryStore::new();
        let channel = CommandChannel::new(&store, 5);
        let target = ObjectRef::Lease(LeaseRef::generate());
        let other = ObjectRef::Lease(LeaseRef::generate());

        let first = channel.post(target, Actor::System, CommandKind::Release).unwrap();
        channel.post(other, Actor::System, CommandKind::Release).unwrap();
        let second = channel
            .post(target, Actor::user("alice"), CommandKind::Other("reboot".into()))
            .unwrap();

        let pending = channel.fetch_unconsumed(target).unwrap();
        assert_eq!(
            pending.iter().map(|c| c.reference).collect::<Vec<_>>(),
            vec![first.reference, second.reference]
        );
        assert!(channel.is_releasing(target).unwrap());

        assert!(channel.consume(first.reference).unwrap());
        assert!(!channel.consume(first.reference).unwrap());
        assert!(!channel.is_releasing(target).unwrap());
        assert_eq!(channel.fetch_unconsumed(target).unwrap().len(), 1);
    }

    #[test]
    fn consuming_unknown_command_fails() {
        let store = InMemoryStore::new();
        let channel = CommandChannel::new(&store, 0);
        assert!(matches!(
            channel.consume(CommandRef::generate()),
            Err(DrydockError::NotFound(_))
        ));
    }
}
