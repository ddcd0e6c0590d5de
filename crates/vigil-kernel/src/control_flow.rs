//! [`ControlFlowMonitor`] – execution-flow checkpoint verification.
//!
//! A supervised flow registers the checkpoint order it is designed to pass
//! through ([`ControlFlowMonitor::register_sequence`]); the running task
//! then reports each checkpoint as a side effect of normal execution
//! ([`ControlFlowMonitor::checkpoint_reached`]). The safety-monitor thread
//! calls [`ControlFlowMonitor::verify`] to confirm that what was observed
//! is a prefix of what was registered; any deviation is a violation that
//! routes to the recovery engine.
//!
//! # Example
//!
//! ```
//! use vigil_kernel::ControlFlowMonitor;
//!
//! let mut cfm = ControlFlowMonitor::new(8, 16);
//! let seq = cfm.register_sequence(vec![0x1, 0x2, 0x4]).unwrap();
//!
//! cfm.checkpoint_reached(seq, 0x1).unwrap();
//! cfm.checkpoint_reached(seq, 0x2).unwrap();
//! assert!(cfm.verify(seq).unwrap());
//!
//! cfm.checkpoint_reached(seq, 0x8).unwrap(); // off the rails
//! assert!(!cfm.verify(seq).unwrap());
//! ```

use tracing::{debug, warn};
use vigil_types::VigilError;

// ────────────────────────────────────────────────────────────────────────────
// Types
// ────────────────────────────────────────────────────────────────────────────

/// Handle to a registered checkpoint sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SequenceId(pub(crate) usize);

impl SequenceId {
    pub fn index(self) -> usize {
        self.0
    }
}

struct Sequence {
    expected: Vec<u32>,
    observed: Vec<u32>,
    /// Set when the observed buffer overran or verification mismatched;
    /// cleared only by [`ControlFlowMonitor::reset`].
    violated: bool,
    /// Checkpoint id at the most recent violation, for diagnostics.
    last_offender: Option<u32>,
    violations: u32,
}

/// Records and validates checkpoint sequences for every supervised flow.
pub struct ControlFlowMonitor {
    sequences: Vec<Sequence>,
    max_sequences: usize,
    max_checkpoints: usize,
    total_violations: u32,
}

impl ControlFlowMonitor {
    /// Create a monitor holding at most `max_sequences` flows of at most
    /// `max_checkpoints` checkpoints each.
    pub fn new(max_sequences: usize, max_checkpoints: usize) -> Self {
        Self {
            sequences: Vec::with_capacity(max_sequences),
            max_sequences,
            max_checkpoints,
            total_violations: 0,
        }
    }

    /// Register the expected checkpoint order for one flow.
    ///
    /// # Errors
    ///
    /// [`VigilError::CapacityExceeded`] once all sequence slots are consumed
    /// or `expected` is longer than the checkpoint buffer.
    pub fn register_sequence(&mut self, expected: Vec<u32>) -> Result<SequenceId, VigilError> {
        if self.sequences.len() >= self.max_sequences {
            return Err(VigilError::CapacityExceeded {
                what: "control-flow sequences",
                capacity: self.max_sequences,
            });
        }
        if expected.len() > self.max_checkpoints {
            return Err(VigilError::CapacityExceeded {
                what: "checkpoints per sequence",
                capacity: self.max_checkpoints,
            });
        }
        let id = SequenceId(self.sequences.len());
        debug!(sequence = id.0, len = expected.len(), "registered control-flow sequence");
        self.sequences.push(Sequence {
            expected,
            observed: Vec::with_capacity(self.max_checkpoints),
            violated: false,
            last_offender: None,
            violations: 0,
        });
        Ok(id)
    }

    /// Record that the flow passed checkpoint `id`.
    ///
    /// A full observed buffer makes the call a no-op, but the overrun is
    /// itself a violation: the flow ran longer than it was designed to.
    pub fn checkpoint_reached(&mut self, seq: SequenceId, id: u32) -> Result<(), VigilError> {
        let max = self.max_checkpoints;
        let s = self.sequence_mut(seq)?;
        if s.observed.len() >= max {
            s.violated = true;
            s.last_offender = Some(id);
            s.violations += 1;
            self.total_violations += 1;
            warn!(
                sequence = seq.0,
                checkpoint = id,
                "checkpoint buffer overrun; flow ran past its designed length"
            );
            return Ok(());
        }
        s.observed.push(id);
        Ok(())
    }

    /// Verify the observed checkpoints against the expected order.
    ///
    /// Compares element-by-element up to the number of filled slots, so a
    /// partially executed flow that is still on its expected path verifies
    /// clean. Returns `false` (and logs the offending checkpoint) on any
    /// mismatch or on a previously recorded buffer overrun.
    pub fn verify(&mut self, seq: SequenceId) -> Result<bool, VigilError> {
        let s = self.sequence_mut(seq)?;
        if s.violated {
            return Ok(false);
        }
        for (i, &observed) in s.observed.iter().enumerate() {
            let expected = s.expected.get(i).copied();
            if expected != Some(observed) {
                s.violated = true;
                s.last_offender = Some(observed);
                s.violations += 1;
                self.total_violations += 1;
                warn!(
                    sequence = seq.0,
                    position = i,
                    checkpoint = observed,
                    expected = ?expected,
                    "control-flow deviation"
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Verify every sequence, returning the ids that failed.
    pub fn verify_all(&mut self) -> Vec<SequenceId> {
        (0..self.sequences.len())
            .map(SequenceId)
            .filter(|&id| {
                // Ids produced from the live range are always valid.
                !self.verify(id).unwrap_or(false)
            })
            .collect()
    }

    /// Clear the observed buffer and violation latch, re-arming the flow.
    /// The expected sequence and the lifetime violation counter survive.
    pub fn reset(&mut self, seq: SequenceId) -> Result<(), VigilError> {
        let s = self.sequence_mut(seq)?;
        s.observed.clear();
        s.violated = false;
        s.last_offender = None;
        Ok(())
    }

    /// Reset every sequence; the recovery engine's corrective action for
    /// control-flow violations.
    pub fn reset_all(&mut self) {
        for s in &mut self.sequences {
            s.observed.clear();
            s.violated = false;
            s.last_offender = None;
        }
    }

    /// Lifetime violation count for one sequence.
    pub fn violations(&self, seq: SequenceId) -> Result<u32, VigilError> {
        Ok(self.sequence(seq)?.violations)
    }

    /// Checkpoint id recorded at the most recent violation of `seq`.
    pub fn last_offender(&self, seq: SequenceId) -> Result<Option<u32>, VigilError> {
        Ok(self.sequence(seq)?.last_offender)
    }

    /// Lifetime violation count across all sequences.
    pub fn total_violations(&self) -> u32 {
        self.total_violations
    }

    fn sequence(&self, seq: SequenceId) -> Result<&Sequence, VigilError> {
        self.sequences
            .get(seq.0)
            .ok_or(VigilError::UnknownSequence(seq.0))
    }

    fn sequence_mut(&mut self, seq: SequenceId) -> Result<&mut Sequence, VigilError> {
        self.sequences
            .get_mut(seq.0)
            .ok_or(VigilError::UnknownSequence(seq.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> ControlFlowMonitor {
        ControlFlowMonitor::new(4, 5)
    }

    #[test]
    fn in_order_checkpoints_verify_clean() {
        let mut cfm = monitor();
        let seq = cfm.register_sequence(vec![0x1, 0x2, 0x4, 0x8]).unwrap();
        for id in [0x1, 0x2, 0x4, 0x8] {
            cfm.checkpoint_reached(seq, id).unwrap();
        }
        assert!(cfm.verify(seq).unwrap());
        assert_eq!(cfm.violations(seq).unwrap(), 0);
    }

    #[test]
    fn partial_prefix_verifies_clean() {
        let mut cfm = monitor();
        let seq = cfm.register_sequence(vec![0x1, 0x2, 0x4, 0x8]).unwrap();
        cfm.checkpoint_reached(seq, 0x1).unwrap();
        cfm.checkpoint_reached(seq, 0x2).unwrap();
        assert!(cfm.verify(seq).unwrap());
    }

    #[test]
    fn deviation_fails_and_records_offender() {
        let mut cfm = monitor();
        let seq = cfm.register_sequence(vec![0x1, 0x2, 0x4]).unwrap();
        cfm.checkpoint_reached(seq, 0x1).unwrap();
        cfm.checkpoint_reached(seq, 0x4).unwrap(); // skipped 0x2
        assert!(!cfm.verify(seq).unwrap());
        assert_eq!(cfm.last_offender(seq).unwrap(), Some(0x4));
        assert_eq!(cfm.violations(seq).unwrap(), 1);
    }

    #[test]
    fn checkpoint_past_expected_length_fails() {
        let mut cfm = monitor();
        let seq = cfm.register_sequence(vec![0x1]).unwrap();
        cfm.checkpoint_reached(seq, 0x1).unwrap();
        cfm.checkpoint_reached(seq, 0x2).unwrap(); // beyond expected
        assert!(!cfm.verify(seq).unwrap());
    }

    #[test]
    fn buffer_overrun_is_a_violation() {
        let mut cfm = ControlFlowMonitor::new(2, 2);
        let seq = cfm.register_sequence(vec![0x1, 0x2]).unwrap();
        cfm.checkpoint_reached(seq, 0x1).unwrap();
        cfm.checkpoint_reached(seq, 0x2).unwrap();
        // Buffer full: the append is dropped but the overrun is recorded.
        cfm.checkpoint_reached(seq, 0x3).unwrap();
        assert!(!cfm.verify(seq).unwrap());
        assert_eq!(cfm.violations(seq).unwrap(), 1);
    }

    #[test]
    fn violation_latches_until_reset() {
        let mut cfm = monitor();
        let seq = cfm.register_sequence(vec![0x1, 0x2]).unwrap();
        cfm.checkpoint_reached(seq, 0x2).unwrap();
        assert!(!cfm.verify(seq).unwrap());
        // Still failing on re-verify; no silent self-heal.
        assert!(!cfm.verify(seq).unwrap());

        cfm.reset(seq).unwrap();
        assert!(cfm.verify(seq).unwrap());
        // Lifetime counter survives the reset.
        assert_eq!(cfm.violations(seq).unwrap(), 1);
    }

    #[test]
    fn sequence_capacity_enforced() {
        let mut cfm = ControlFlowMonitor::new(1, 4);
        cfm.register_sequence(vec![0x1]).unwrap();
        assert!(matches!(
            cfm.register_sequence(vec![0x1]),
            Err(VigilError::CapacityExceeded { .. })
        ));
    }

    #[test]
    fn checkpoint_capacity_enforced() {
        let mut cfm = ControlFlowMonitor::new(4, 2);
        assert!(matches!(
            cfm.register_sequence(vec![0x1, 0x2, 0x4]),
            Err(VigilError::CapacityExceeded { .. })
        ));
    }

    #[test]
    fn verify_all_reports_only_failing_sequences() {
        let mut cfm = monitor();
        let good = cfm.register_sequence(vec![0x1, 0x2]).unwrap();
        let bad = cfm.register_sequence(vec![0x1, 0x2]).unwrap();
        cfm.checkpoint_reached(good, 0x1).unwrap();
        cfm.checkpoint_reached(bad, 0x2).unwrap();

        let failing = cfm.verify_all();
        assert_eq!(failing, vec![bad]);
    }

    #[test]
    fn reset_all_rearms_every_sequence() {
        let mut cfm = monitor();
        let a = cfm.register_sequence(vec![0x1]).unwrap();
        let b = cfm.register_sequence(vec![0x1]).unwrap();
        cfm.checkpoint_reached(a, 0x9).unwrap();
        cfm.checkpoint_reached(b, 0x9).unwrap();
        assert_eq!(cfm.verify_all().len(), 2);

        cfm.reset_all();
        assert!(cfm.verify_all().is_empty());
    }

    #[test]
    fn unknown_sequence_is_an_error() {
        let mut cfm = monitor();
        assert!(matches!(
            cfm.checkpoint_reached(SequenceId(7), 0x1),
            Err(VigilError::UnknownSequence(7))
        ));
    }
}
