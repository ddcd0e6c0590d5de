//! 2-of-3 redundancy voting.
//!
//! One voting law serves both call sites: triplicated sensor readings and
//! triplicated outputs of `needs_redundancy` tasks. A triple is accepted
//! when all three members agree within tolerance, repaired when exactly one
//! member has drifted (the agreeing pair outvotes it), and rejected when no
//! pair agrees.
//!
//! # Example
//!
//! ```
//! use vigil_kernel::redundancy::{RedundantTriple, VotingOutcome, vote};
//!
//! let mut triple = RedundantTriple::new(50.0, 50.2, 49.9, 0.3);
//! match vote(&mut triple, 0.3) {
//!     VotingOutcome::Accepted(consensus) => assert!((consensus - 50.0).abs() < 0.2),
//!     other => panic!("unexpected outcome {other:?}"),
//! }
//! ```

use std::time::Instant;

use tracing::warn;

// ────────────────────────────────────────────────────────────────────────────
// Types
// ────────────────────────────────────────────────────────────────────────────

/// Which member of a [`RedundantTriple`] an outcome refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TripleSlot {
    Primary,
    Secondary,
    Reference,
}

/// Three same-typed redundant values plus voting metadata.
#[derive(Debug, Clone)]
pub struct RedundantTriple {
    pub primary: f64,
    pub secondary: f64,
    pub reference: f64,
    /// When the values were last refreshed.
    pub timestamp: Instant,
    /// Cleared by a rejected vote; set by accepted/repaired votes.
    pub valid: bool,
    /// Tolerance of the most recent vote; [`consensus_value`] reuses it.
    pub tolerance: f64,
}

impl RedundantTriple {
    pub fn new(primary: f64, secondary: f64, reference: f64, tolerance: f64) -> Self {
        Self {
            primary,
            secondary,
            reference,
            timestamp: Instant::now(),
            valid: true,
            tolerance,
        }
    }

    /// Overwrite all three values and stamp the refresh time.
    pub fn refresh(&mut self, primary: f64, secondary: f64, reference: f64) {
        self.primary = primary;
        self.secondary = secondary;
        self.reference = reference;
        self.timestamp = Instant::now();
    }

    fn get(&self, slot: TripleSlot) -> f64 {
        match slot {
            TripleSlot::Primary => self.primary,
            TripleSlot::Secondary => self.secondary,
            TripleSlot::Reference => self.reference,
        }
    }

    fn set(&mut self, slot: TripleSlot, value: f64) {
        match slot {
            TripleSlot::Primary => self.primary = value,
            TripleSlot::Secondary => self.secondary = value,
            TripleSlot::Reference => self.reference = value,
        }
    }
}

/// Result of one voting pass over a [`RedundantTriple`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VotingOutcome {
    /// All three members agree; the consensus is their mean.
    Accepted(f64),
    /// One member had drifted and was rewritten from the agreeing pair.
    Repaired {
        consensus: f64,
        corrected: TripleSlot,
    },
    /// No pair agrees. `suspect` is a best-effort guess at the faulty
    /// member (the one furthest from the other two); it is logged, not
    /// guaranteed correct.
    Rejected { suspect: TripleSlot },
}

// ────────────────────────────────────────────────────────────────────────────
// Voting
// ────────────────────────────────────────────────────────────────────────────

/// The three member pairs, in evaluation order, each with the slot that is
/// *not* part of the pair.
const PAIRS: [(TripleSlot, TripleSlot, TripleSlot); 3] = [
    (TripleSlot::Primary, TripleSlot::Secondary, TripleSlot::Reference),
    (TripleSlot::Secondary, TripleSlot::Reference, TripleSlot::Primary),
    (TripleSlot::Primary, TripleSlot::Reference, TripleSlot::Secondary),
];

/// A pairwise difference exactly at the tolerance counts as agreement. The
/// relative slack absorbs f64 representation error at the boundary (e.g.
/// `50.2 - 49.9` is slightly above `0.3`), so a healthy member is never
/// "repaired" over rounding noise.
fn agrees(a: f64, b: f64, tolerance: f64) -> bool {
    (a - b).abs() <= tolerance + tolerance * 1e-9
}

/// Run the 2-of-3 vote over `triple`, mutating it on repair or rejection.
///
/// - All pairwise differences within `tolerance` → [`VotingOutcome::Accepted`]
///   with the mean of the three.
/// - At least one pair within `tolerance` → the odd member is rewritten to
///   the agreeing pair's mean, which becomes the consensus
///   ([`VotingOutcome::Repaired`]); `valid` stays set.
/// - No pair within `tolerance` → [`VotingOutcome::Rejected`]; `valid` is
///   cleared and the values are left untouched for diagnosis.
pub fn vote(triple: &mut RedundantTriple, tolerance: f64) -> VotingOutcome {
    triple.tolerance = tolerance;
    let all_agree = PAIRS
        .iter()
        .all(|&(a, b, _)| agrees(triple.get(a), triple.get(b), tolerance));
    if all_agree {
        triple.valid = true;
        return VotingOutcome::Accepted((triple.primary + triple.secondary + triple.reference) / 3.0);
    }

    // Pairs are tried in fixed order; the first agreeing pair wins the vote
    // and outvotes the excluded member.
    for &(a, b, odd) in &PAIRS {
        if agrees(triple.get(a), triple.get(b), tolerance) {
            let consensus = (triple.get(a) + triple.get(b)) / 2.0;
            triple.set(odd, consensus);
            triple.valid = true;
            return VotingOutcome::Repaired {
                consensus,
                corrected: odd,
            };
        }
    }

    let suspect = probable_fault(triple);
    triple.valid = false;
    warn!(?suspect, "redundant triple rejected: no pair within tolerance");
    VotingOutcome::Rejected { suspect }
}

/// The consensus the vote would produce, without mutating the triple.
///
/// Uses the triple's own stored tolerance. `None` when the vote would
/// reject.
pub fn consensus_value(triple: &RedundantTriple) -> Option<f64> {
    let mut scratch = triple.clone();
    match vote(&mut scratch, triple.tolerance) {
        VotingOutcome::Accepted(v) => Some(v),
        VotingOutcome::Repaired { consensus, .. } => Some(consensus),
        VotingOutcome::Rejected { .. } => None,
    }
}

/// Best-effort fault attribution when every pair disagrees: the member with
/// the largest summed distance to the other two sits in the two widest
/// disagreeing pairs.
fn probable_fault(triple: &RedundantTriple) -> TripleSlot {
    let spread = |slot: TripleSlot| -> f64 {
        PAIRS
            .iter()
            .filter(|&&(a, b, _)| a == slot || b == slot)
            .map(|&(a, b, _)| (triple.get(a) - triple.get(b)).abs())
            .sum()
    };
    let mut worst = TripleSlot::Primary;
    for slot in [TripleSlot::Secondary, TripleSlot::Reference] {
        if spread(slot) > spread(worst) {
            worst = slot;
        }
    }
    worst
}
