//! # Election State
//!
//! Pure state for the replica-holder election: the current phase, the
//! ballots collected so far, the decision deadline, and the
//! `min_election_time` rate limit. No I/O happens here; the engine
//! broadcasts ballots and applies role transitions, this module only
//! answers "may an election start", "who voted what", and "did we win".
//!
//! ## Phases
//!
//! A node is `Idle` until an election starts (its own watchdog, an empty
//! replica set, or a received Election request), then `Collecting` until
//! the decision deadline passes. Deciding is instantaneous: ballots are
//! compared against the node's own fitness and the state returns to Idle.
//!
//! ## Tie-breaking
//!
//! Fitness functions are chosen so two nodes rarely tie, but when they do
//! the incumbent keeps its role: a sitting replica holder wins against
//! equal ballots, while a challenger must strictly exceed every ballot
//! cast by a current holder.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::Role;
use crate::messages::NodeId;

/// Where the node is in the election cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElectionPhase {
    Idle,
    Collecting,
}

/// A recorded ballot.
#[derive(Clone, Copy, Debug)]
struct Ballot {
    fitness: f64,
    /// Whether the voter was a known replica holder when the ballot
    /// arrived. Holders win ties; challengers must beat them strictly.
    from_holder: bool,
}

/// Election bookkeeping for one node.
#[derive(Debug)]
pub struct ElectionState {
    phase: ElectionPhase,
    ballots: HashMap<NodeId, Ballot>,
    own_fitness: f64,
    decide_at: Option<Instant>,
    min_election_time: Option<Instant>,
    cooldown: Duration,
    timeout: Duration,
}

impl ElectionState {
    pub fn new(cooldown: Duration, timeout: Duration) -> Self {
        Self {
            phase: ElectionPhase::Idle,
            ballots: HashMap::new(),
            own_fitness: 0.0,
            decide_at: None,
            min_election_time: None,
            cooldown,
            timeout,
        }
    }

    pub fn phase(&self) -> ElectionPhase {
        self.phase
    }

    pub fn is_collecting(&self) -> bool {
        self.phase == ElectionPhase::Collecting
    }

    /// Whether the cooldown permits joining or starting an election now.
    pub fn may_join(&self, now: Instant) -> bool {
        match self.min_election_time {
            Some(earliest) => now >= earliest,
            None => true,
        }
    }

    /// Earliest time another election may be joined. `None` before the
    /// first election.
    pub fn min_election_time(&self) -> Option<Instant> {
        self.min_election_time
    }

    /// When the current collection phase decides, if one is running.
    pub fn decide_at(&self) -> Option<Instant> {
        self.decide_at
    }

    /// Enter the Collecting phase with this node's fitness.
    ///
    /// Returns `false` when already collecting (the decision is scheduled;
    /// a second Election request changes nothing). Entering always pushes
    /// `min_election_time` forward, never back.
    pub fn begin(&mut self, own_fitness: f64, now: Instant) -> bool {
        if self.phase == ElectionPhase::Collecting {
            return false;
        }
        self.phase = ElectionPhase::Collecting;
        self.ballots.clear();
        self.own_fitness = own_fitness;
        self.decide_at = Some(now + self.timeout);

        let earliest = now + self.cooldown;
        self.min_election_time = Some(match self.min_election_time {
            Some(current) => current.max(earliest),
            None => earliest,
        });
        true
    }

    /// Record a ballot from a peer.
    ///
    /// Ballots outside the Collecting phase are stale echoes of a decided
    /// election and are ignored. Returns whether the ballot was recorded.
    pub fn record_ballot(&mut self, peer: NodeId, fitness: f64, from_holder: bool) -> bool {
        if self.phase != ElectionPhase::Collecting {
            return false;
        }
        self.ballots.insert(
            peer,
            Ballot {
                fitness,
                from_holder,
            },
        );
        true
    }

    /// Number of ballots collected in the running election.
    pub fn ballot_count(&self) -> usize {
        self.ballots.len()
    }

    /// Decide the running election and return to Idle.
    ///
    /// Returns whether this node won. `role` is the node's current role,
    /// which settles ties: an incumbent wins with `F >= f` against every
    /// ballot, a challenger additionally needs `F > f` against ballots
    /// cast by sitting holders.
    pub fn decide(&mut self, role: Role) -> bool {
        let own = self.own_fitness;
        let won = self.ballots.values().all(|ballot| {
            if role == Role::NonReplicating && ballot.from_holder {
                own > ballot.fitness
            } else {
                own >= ballot.fitness
            }
        });

        self.phase = ElectionPhase::Idle;
        self.ballots.clear();
        self.decide_at = None;
        won
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COOLDOWN: Duration = Duration::from_secs(1);
    const TIMEOUT: Duration = Duration::from_secs(5);

    fn state() -> ElectionState {
        ElectionState::new(COOLDOWN, TIMEOUT)
    }

    #[test]
    fn begin_schedules_decision_and_cooldown() {
        let mut election = state();
        let now = Instant::now();

        assert!(election.may_join(now));
        assert!(election.begin(0.5, now));
        assert_eq!(election.phase(), ElectionPhase::Collecting);
        assert_eq!(election.decide_at(), Some(now + TIMEOUT));
        assert_eq!(election.min_election_time(), Some(now + COOLDOWN));
        assert!(!election.may_join(now));
        assert!(election.may_join(now + COOLDOWN));
    }

    #[test]
    fn begin_while_collecting_is_ignored() {
        let mut election = state();
        let now = Instant::now();

        assert!(election.begin(0.5, now));
        election.record_ballot(2, 0.1, false);
        assert!(!election.begin(0.9, now + Duration::from_millis(10)));
        // The running election keeps its ballots and deadline.
        assert_eq!(election.ballot_count(), 1);
        assert_eq!(election.decide_at(), Some(now + TIMEOUT));
    }

    #[test]
    fn min_election_time_never_decreases() {
        let mut election = state();
        let start = Instant::now();

        election.begin(0.0, start + Duration::from_secs(10));
        let first = election.min_election_time().unwrap();
        election.decide(Role::NonReplicating);

        // A second election beginning earlier must not pull the limit back.
        election.begin(0.0, start);
        let second = election.min_election_time().unwrap();
        assert!(second >= first);
    }

    #[test]
    fn highest_fitness_wins() {
        let mut election = state();
        let now = Instant::now();

        election.begin(0.9, now);
        election.record_ballot(1, 0.3, false);
        election.record_ballot(2, 0.5, false);
        assert!(election.decide(Role::NonReplicating));
        assert_eq!(election.phase(), ElectionPhase::Idle);
    }

    #[test]
    fn lower_fitness_loses() {
        let mut election = state();
        let now = Instant::now();

        election.begin(0.3, now);
        election.record_ballot(2, 0.5, false);
        election.record_ballot(3, 0.9, false);
        assert!(!election.decide(Role::NonReplicating));
    }

    #[test]
    fn incumbent_retains_role_on_tie() {
        let now = Instant::now();

        // The sitting holder ties with a challenger and keeps the role.
        let mut incumbent = state();
        incumbent.begin(0.5, now);
        incumbent.record_ballot(2, 0.5, false);
        assert!(incumbent.decide(Role::Replicating));

        // The challenger ties with the holder's ballot and does not win.
        let mut challenger = state();
        challenger.begin(0.5, now);
        challenger.record_ballot(1, 0.5, true);
        assert!(!challenger.decide(Role::NonReplicating));
    }

    #[test]
    fn ballots_after_decide_are_ignored() {
        let mut election = state();
        let now = Instant::now();

        election.begin(0.5, now);
        election.decide(Role::NonReplicating);
        assert!(!election.record_ballot(4, 0.9, false));
        assert_eq!(election.ballot_count(), 0);
    }

    #[test]
    fn no_ballots_means_self_election() {
        let mut election = state();
        election.begin(0.0, Instant::now());
        // Alone in the neighborhood: the node wins by default.
        assert!(election.decide(Role::NonReplicating));
    }
}
