//! A simplified tit-for-tat choke/unchoke scheduler.
//!
//! Each call to [`UnchokeManager::evaluate_peers`] randomly permutes the
//! interested peer set, keeps up to 4 of them "fixed" unchoked and one more
//! "optimistic" unchoked, and reports the delta against the previous round
//! so the caller knows exactly who to choke and who to unchoke. The
//! permutation's randomness is seeded so rotation fairness (design scenario
//! 4) is testable without flakiness.

use std::collections::HashSet;

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::PeerId;

/// The result of one [`UnchokeManager::evaluate_peers`] call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChokeDecision {
    pub to_choke: Vec<PeerId>,
    pub to_unchoke: Vec<PeerId>,
}

pub struct UnchokeManager {
    rng: StdRng,
    max_fixed: usize,
    max_optimistic: usize,
    fixed_unchoked: HashSet<PeerId>,
    optimistic_unchoked: HashSet<PeerId>,
}

impl UnchokeManager {
    /// Creates a manager seeded from the OS RNG, for production use.
    pub fn new(max_fixed: usize, max_optimistic: usize) -> Self {
        Self::with_rng(StdRng::from_entropy(), max_fixed, max_optimistic)
    }

    /// Creates a manager with a deterministic seed, so rotation fairness
    /// (design scenario 4) can be exercised reproducibly in tests.
    pub fn with_seed(seed: u64, max_fixed: usize, max_optimistic: usize) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed), max_fixed, max_optimistic)
    }

    fn with_rng(rng: StdRng, max_fixed: usize, max_optimistic: usize) -> Self {
        Self {
            rng,
            max_fixed,
            max_optimistic,
            fixed_unchoked: HashSet::new(),
            optimistic_unchoked: HashSet::new(),
        }
    }

    /// Returns true if `peer_id` is currently permitted to pull from us,
    /// i.e. is in the fixed or optimistic unchoked set as of the last
    /// `evaluate_peers` call.
    pub fn is_unchoked(&self, peer_id: &str) -> bool {
        self.fixed_unchoked.contains(peer_id) || self.optimistic_unchoked.contains(peer_id)
    }

    /// Recomputes the unchoked sets from a freshly permuted view of
    /// `interested`, and returns the delta against the previous round.
    ///
    /// `interested` should contain the peers currently connected to us who
    /// lack at least one block we hold; duplicates are tolerated but
    /// wasteful, as the permutation treats each entry independently.
    pub fn evaluate_peers(&mut self, interested: &[PeerId]) -> ChokeDecision {
        let mut shuffled: Vec<PeerId> = interested.to_vec();
        shuffled.shuffle(&mut self.rng);

        let new_fixed: HashSet<PeerId> =
            shuffled.iter().take(self.max_fixed).cloned().collect();
        let new_optimistic: HashSet<PeerId> = shuffled
            .iter()
            .skip(self.max_fixed)
            .take(self.max_optimistic)
            .cloned()
            .collect();

        let old_unchoked: HashSet<PeerId> = self
            .fixed_unchoked
            .union(&self.optimistic_unchoked)
            .cloned()
            .collect();
        let new_unchoked: HashSet<PeerId> =
            new_fixed.union(&new_optimistic).cloned().collect();

        let to_unchoke: Vec<PeerId> =
            new_unchoked.difference(&old_unchoked).cloned().collect();
        let to_choke: Vec<PeerId> =
            old_unchoked.difference(&new_unchoked).cloned().collect();

        self.fixed_unchoked = new_fixed;
        self.optimistic_unchoked = new_optimistic;

        ChokeDecision {
            to_choke,
            to_unchoke,
        }
    }

    #[cfg(test)]
    fn unchoked_union(&self) -> HashSet<PeerId> {
        self.fixed_unchoked
            .union(&self.optimistic_unchoked)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn peer(n: usize) -> PeerId {
        format!("peer-{}", n)
    }

    #[test]
    fn empty_interested_set_produces_empty_decision_and_clears_state() {
        let mut mgr = UnchokeManager::with_seed(1, 4, 1);
        let decision = mgr.evaluate_peers(&[peer(0), peer(1)]);
        assert!(!decision.to_unchoke.is_empty());

        let decision = mgr.evaluate_peers(&[]);
        assert!(decision.to_unchoke.is_empty());
        assert_eq!(decision.to_choke.len(), 2);
        assert!(mgr.unchoked_union().is_empty());
    }

    #[test]
    fn unchoked_sets_never_exceed_their_caps_and_are_disjoint() {
        let mut mgr = UnchokeManager::with_seed(7, 4, 1);
        let interested: Vec<PeerId> = (0..10).map(peer).collect();
        for _ in 0..50 {
            mgr.evaluate_peers(&interested);
            assert!(mgr.fixed_unchoked.len() <= 4);
            assert!(mgr.optimistic_unchoked.len() <= 1);
            assert!(mgr.fixed_unchoked.is_disjoint(&mgr.optimistic_unchoked));
        }
    }

    #[test]
    fn decision_delta_matches_old_and_new_unchoked_union() {
        let mut mgr = UnchokeManager::with_seed(42, 4, 1);
        let interested: Vec<PeerId> = (0..8).map(peer).collect();

        let old_union = mgr.unchoked_union();
        let decision = mgr.evaluate_peers(&interested);
        let expected_new: HashSet<PeerId> = old_union
            .union(&decision.to_unchoke.iter().cloned().collect())
            .cloned()
            .collect::<HashSet<_>>()
            .difference(&decision.to_choke.iter().cloned().collect())
            .cloned()
            .collect();
        assert_eq!(expected_new, mgr.unchoked_union());

        let to_choke: HashSet<_> = decision.to_choke.iter().collect();
        let to_unchoke: HashSet<_> = decision.to_unchoke.iter().collect();
        assert!(to_choke.is_disjoint(&to_unchoke));
    }

    #[test]
    fn rotation_gives_every_interested_peer_a_turn_over_many_cycles() {
        // scenario 4: one peer with 10 interested remotes, over 100 cycles
        // each is unchoked at least once, verified under a seeded RNG.
        let mut mgr = UnchokeManager::with_seed(1234, 4, 1);
        let interested: Vec<PeerId> = (0..10).map(peer).collect();

        let mut ever_unchoked: HashSet<PeerId> = HashSet::new();
        for _ in 0..100 {
            let decision = mgr.evaluate_peers(&interested);
            ever_unchoked.extend(decision.to_unchoke);
            ever_unchoked.extend(mgr.unchoked_union());
        }

        for p in &interested {
            assert!(
                ever_unchoked.contains(p),
                "{} was never unchoked over 100 cycles",
                p
            );
        }
    }
}
