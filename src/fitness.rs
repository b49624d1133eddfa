//! # Delivery Probability and Election Fitness
//!
//! Two flavors of "fitness" drive the scheme:
//!
//! - the **delivery probability** `P_ij`, recomputed continuously and used
//!   as the threshold for forwarding and carrying decisions
//!   (`P_ij = w_cdc * U_cdc + w_col * U_col`, short-circuited to 1.0 for a
//!   replica holder), and
//! - the **election fitness**, computed once at the start of each election
//!   and broadcast as this node's ballot.
//!
//! `U_cdc` is the change-degree metric: how quickly the neighborhood has
//! been churning over the last profile period. `U_col` is the colocation
//! metric: 1.0 exactly when a known replica holder is inside the h-hop
//! neighborhood.
//!
//! The election fitness is pluggable via [`ElectionFitness`]; the default
//! [`ReferenceFitness`] returns the paper's constant 0.0. The election
//! algorithm only needs two nodes to rarely tie, not any particular
//! formula, so richer metrics (free space, centrality) slot in without
//! engine changes.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::Role;

/// Clamp a weighted sum into the [0, 1] range usable as a threshold.
fn clamp_unit(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

/// Sliding window of neighborhood degree samples.
///
/// One sample is recorded per profile period just before the beacon goes
/// out. The change rate compares the oldest sample still inside the window
/// with the newest one.
#[derive(Debug)]
pub struct DegreeWindow {
    samples: VecDeque<(Instant, usize)>,
    window: Duration,
}

impl DegreeWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
        }
    }

    /// Record the current neighborhood degree.
    pub fn record(&mut self, degree: usize, now: Instant) {
        self.samples.push_back((now, degree));
        self.prune(now);
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&(at, _)) = self.samples.front() {
            // Keep one sample beyond the window edge so a fresh sample
            // always has something to be compared against.
            if now.duration_since(at) > self.window && self.samples.len() > 2 {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Normalized neighbor-count change rate in [0, 1].
    ///
    /// 0.0 for a static (or empty) neighborhood, approaching 1.0 when the
    /// neighborhood has turned over completely within the window.
    pub fn change_degree(&self) -> f64 {
        let (Some(&(_, oldest)), Some(&(_, newest))) =
            (self.samples.front(), self.samples.back())
        else {
            return 0.0;
        };
        let delta = oldest.abs_diff(newest) as f64;
        let base = oldest.max(newest).max(1) as f64;
        clamp_unit(delta / base)
    }
}

/// Computes the delivery probability from the configured weights.
#[derive(Debug)]
pub struct DeliveryEstimator {
    w_cdc: f64,
    w_col: f64,
    window: DegreeWindow,
}

impl DeliveryEstimator {
    pub fn new(w_cdc: f64, w_col: f64, window: Duration) -> Self {
        Self {
            w_cdc,
            w_col,
            window: DegreeWindow::new(window),
        }
    }

    /// Record the current degree ahead of a profile broadcast.
    pub fn record_degree(&mut self, degree: usize, now: Instant) {
        self.window.record(degree, now);
    }

    /// Current `P_ij` for this node.
    ///
    /// A replica holder always reports 1.0: it is the delivery target, not
    /// a courier. Everyone else reports the weighted sum clamped into
    /// [0, 1] so the value is directly usable as a broadcast threshold.
    pub fn probability(&self, role: Role, replica_in_neighborhood: bool) -> f64 {
        if role == Role::Replicating {
            return 1.0;
        }
        let u_cdc = self.window.change_degree();
        let u_col = if replica_in_neighborhood { 1.0 } else { 0.0 };
        clamp_unit(self.w_cdc * u_cdc + self.w_col * u_col)
    }
}

/// Inputs offered to the election fitness function.
#[derive(Clone, Copy, Debug, Default)]
pub struct FitnessContext {
    /// Empty replica-storage slots.
    pub free_storage: u32,
    /// Empty forwarding-buffer slots.
    pub free_buffer: u32,
    /// Live h-hop neighbors.
    pub neighbors: usize,
    /// Mean delivery probability advertised by those neighbors.
    pub mean_delivery: f64,
}

/// Election fitness function, supplied once at engine construction.
///
/// Implementations should be cheap and deterministic for a given context;
/// the value is computed exactly once per election and broadcast as this
/// node's ballot.
pub trait ElectionFitness: Send + Sync + 'static {
    fn fitness(&self, ctx: &FitnessContext) -> f64;
}

/// The default fitness from the paper: every node reports 0.0.
///
/// With uniform ballots an incumbent retains its role and the first node
/// to step up in a fresh neighborhood keeps it.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReferenceFitness;

impl ElectionFitness for ReferenceFitness {
    fn fitness(&self, _ctx: &FitnessContext) -> f64 {
        0.0
    }
}

/// Fitness fixed at construction. Useful for deployments that rank nodes
/// by an externally computed score, and for tests that need a
/// predetermined winner.
#[derive(Clone, Copy, Debug)]
pub struct ConstantFitness(pub f64);

impl ElectionFitness for ConstantFitness {
    fn fitness(&self, _ctx: &FitnessContext) -> f64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(6);

    #[test]
    fn static_neighborhood_has_zero_change_degree() {
        let mut window = DegreeWindow::new(WINDOW);
        let start = Instant::now();
        for step in 0..4 {
            window.record(5, start + Duration::from_secs(step));
        }
        assert_eq!(window.change_degree(), 0.0);
    }

    #[test]
    fn empty_window_has_zero_change_degree() {
        let window = DegreeWindow::new(WINDOW);
        assert_eq!(window.change_degree(), 0.0);
    }

    #[test]
    fn churn_raises_change_degree() {
        let mut window = DegreeWindow::new(WINDOW);
        let start = Instant::now();
        window.record(8, start);
        window.record(2, start + Duration::from_secs(3));

        let rate = window.change_degree();
        assert!((rate - 0.75).abs() < 1e-9, "expected 6/8, got {rate}");
    }

    #[test]
    fn old_samples_age_out() {
        let mut window = DegreeWindow::new(WINDOW);
        let start = Instant::now();
        window.record(10, start);
        window.record(10, start + Duration::from_secs(1));
        window.record(2, start + Duration::from_secs(20));
        window.record(2, start + Duration::from_secs(21));

        // Only the recent, stable samples remain inside the window.
        assert_eq!(window.change_degree(), 0.0);
    }

    #[test]
    fn replica_holder_reports_full_probability() {
        let estimator = DeliveryEstimator::new(0.5, 0.5, WINDOW);
        assert_eq!(estimator.probability(Role::Replicating, false), 1.0);
    }

    #[test]
    fn colocation_drives_probability() {
        let estimator = DeliveryEstimator::new(0.5, 0.5, WINDOW);
        assert_eq!(estimator.probability(Role::NonReplicating, false), 0.0);
        assert_eq!(estimator.probability(Role::NonReplicating, true), 0.5);
    }

    #[test]
    fn probability_is_clamped_to_unit_interval() {
        // Weights outside [0,1] are accepted but the result must stay a
        // usable threshold.
        let estimator = DeliveryEstimator::new(2.0, 3.0, WINDOW);
        let p = estimator.probability(Role::NonReplicating, true);
        assert_eq!(p, 1.0);
    }

    #[test]
    fn reference_fitness_is_zero() {
        let ctx = FitnessContext::default();
        assert_eq!(ReferenceFitness.fitness(&ctx), 0.0);
        assert_eq!(ConstantFitness(0.9).fitness(&ctx), 0.9);
    }
}
