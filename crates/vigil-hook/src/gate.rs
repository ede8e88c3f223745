//! Callback serialization.
//!
//! A session's callback never runs on two logical threads at once. Each
//! session has a guard owned by a [`ContextId`] rather than an OS thread, so
//! fibers of the owning thread re-enter it freely. All guards of a tracer
//! live in one [`GuardTable`] that also records who is waiting for what:
//! a context only waits for a guard when the wait cannot close a cycle.
//! When it would, [`GuardTable::enter`] returns `None` and the delivery is
//! skipped instead. A context blocked on another host thread gives up its
//! guards for the duration.

use std::collections::HashMap;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use vigil_core::{ContextId, SessionId};

#[derive(Debug, Default)]
struct Table {
    owners: HashMap<SessionId, (ContextId, usize)>,
    waits: HashMap<ContextId, SessionId>,
}

impl Table {
    fn owner(&self, session: SessionId) -> Option<ContextId> {
        self.owners.get(&session).map(|&(owner, _)| owner)
    }

    /// Whether `context` waiting for `session` would end up waiting on itself.
    fn closes_cycle(&self, context: ContextId, mut session: SessionId) -> bool {
        for _ in 0..=self.waits.len() {
            let Some(owner) = self.owner(session) else {
                return false;
            };
            if owner == context {
                return true;
            }
            match self.waits.get(&owner) {
                Some(&next) => session = next,
                None => return false,
            }
        }
        false
    }

    fn free_for(&self, context: ContextId, sessions: &[(SessionId, usize)]) -> bool {
        sessions.iter().all(|(session, _)| {
            self.owners
                .get(session)
                .is_none_or(|&(owner, _)| owner == context)
        })
    }
}

/// Session guards of one tracer.
#[derive(Debug, Default)]
pub(crate) struct GuardTable {
    table: Mutex<Table>,
    released: Condvar,
}

impl GuardTable {
    /// Acquire `session`'s guard for `context`.
    ///
    /// Waits while another context holds it, unless waiting would deadlock;
    /// then returns `None`.
    pub(crate) fn enter(&self, session: SessionId, context: ContextId) -> Option<SessionGuard<'_>> {
        let mut table = self.table.lock();
        loop {
            match table.owner(session) {
                None => {
                    table.owners.insert(session, (context, 1));
                    break;
                }
                Some(owner) if owner == context => {
                    if let Some((_, depth)) = table.owners.get_mut(&session) {
                        *depth += 1;
                    }
                    break;
                }
                Some(owner) => {
                    if table.closes_cycle(context, session) {
                        debug!(
                            session = %session,
                            context = %context,
                            owner = %owner,
                            "Skipping delivery that would deadlock"
                        );
                        return None;
                    }
                    table.waits.insert(context, session);
                    self.released.wait(&mut table);
                    table.waits.remove(&context);
                }
            }
        }
        Some(SessionGuard {
            guards: self,
            session,
            context,
        })
    }

    /// Release every guard `context` holds while `body` runs, then take
    /// them back.
    pub(crate) fn suspended<R>(&self, context: ContextId, body: impl FnOnce() -> R) -> R {
        let held: Vec<(SessionId, usize)> = {
            let mut table = self.table.lock();
            let held: Vec<(SessionId, usize)> = table
                .owners
                .iter()
                .filter(|(_, (owner, _))| *owner == context)
                .map(|(&session, &(_, depth))| (session, depth))
                .collect();
            for (session, _) in &held {
                table.owners.remove(session);
            }
            held
        };
        if !held.is_empty() {
            self.released.notify_all();
            trace!(context = %context, guards = held.len(), "Session guards released for wait");
        }

        let result = body();

        let mut table = self.table.lock();
        while !table.free_for(context, &held) {
            self.released.wait(&mut table);
        }
        for (session, depth) in held {
            let entry = table.owners.entry(session).or_insert((context, 0));
            entry.1 += depth;
        }
        result
    }

    /// Context holding `session`'s guard.
    #[cfg(test)]
    pub(crate) fn owner(&self, session: SessionId) -> Option<ContextId> {
        self.table.lock().owner(session)
    }

    /// Whether `context` is blocked on a guard.
    #[cfg(test)]
    pub(crate) fn is_waiting(&self, context: ContextId) -> bool {
        self.table.lock().waits.contains_key(&context)
    }

    fn release(&self, session: SessionId, context: ContextId) {
        let mut table = self.table.lock();
        let Some((owner, depth)) = table.owners.get_mut(&session) else {
            return;
        };
        if *owner != context {
            return;
        }
        *depth -= 1;
        if *depth == 0 {
            table.owners.remove(&session);
            drop(table);
            self.released.notify_all();
        }
    }
}

/// Holds one level of a session's guard until dropped.
pub(crate) struct SessionGuard<'a> {
    guards: &'a GuardTable,
    session: SessionId,
    context: ContextId,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.guards.release(self.session, self.context);
    }
}
