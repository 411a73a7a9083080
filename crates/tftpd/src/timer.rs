// Retransmission timer
//
// No per-session timer objects: the scheduler wakes at a fixed quantum and
// asks which waiting sessions have been silent for at least their current
// interval.
use std::time::Instant;
use tracing::warn;

use crate::session::{Session, SessionId, SessionTable};
use crate::stats::TimerStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    Pending,
    /// Clock reads earlier than the last send
    Skewed,
    Due,
}

/// Classify one waiting session at `now`
pub fn check(session: &Session, now: Instant) -> Expiry {
    match now.checked_duration_since(session.last_send()) {
        None => Expiry::Skewed,
        Some(elapsed) if elapsed >= session.interval() => Expiry::Due,
        Some(_) => Expiry::Pending,
    }
}

/// Waiting sessions whose interval has run out.
///
/// Skewed sessions get their timestamp reset without counting a retry.
pub fn due_sessions(table: &mut SessionTable, now: Instant, stats: &mut TimerStats) -> Vec<SessionId> {
    let mut due = Vec::new();

    for id in table.waiting() {
        let Some(session) = table.get_mut(id) else {
            warn!("Wait list holds unknown session {}", id);
            continue;
        };

        match check(session, now) {
            Expiry::Pending => {}
            Expiry::Skewed => {
                warn!("Clock went backwards, resetting timer of session {}", id);
                session.reset_timer(now);
                stats.reset += 1;
            }
            Expiry::Due => {
                stats.expired += 1;
                due.push(id);
            }
        }
    }

    due
}
