//! Execution options: when a process runs cycles and how.

use std::collections::VecDeque;
use std::time::{Duration, SystemTime};

/// The sequence of cycles a process runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExecutionSequence {
    /// Live ticking that never ends. Cycles run on market-data changes and manual triggers,
    /// and at least every `max_cycle_period`.
    Infinite,
    /// One cycle per instant, in order, back to back. The process finishes after the last.
    Arbitrary(VecDeque<SystemTime>),
    /// Cycles run only when inputs change or a cycle is triggered manually.
    OnInputChange,
}

impl ExecutionSequence {
    /// Next valuation time to run.
    ///
    /// `Some(None)` means "now" (live sequences), `None` means the sequence is exhausted.
    pub(crate) fn next(&mut self) -> Option<Option<SystemTime>> {
        match self {
            ExecutionSequence::Infinite | ExecutionSequence::OnInputChange => Some(None),
            ExecutionSequence::Arbitrary(instants) => instants.pop_front().map(Some),
        }
    }

    /// Returns true when no further cycles will be produced.
    pub fn is_empty(&self) -> bool {
        match self {
            ExecutionSequence::Infinite | ExecutionSequence::OnInputChange => false,
            ExecutionSequence::Arbitrary(instants) => instants.is_empty(),
        }
    }

    /// Returns true for live sequences that wait for triggers between cycles.
    pub fn is_live(&self) -> bool {
        !matches!(self, ExecutionSequence::Arbitrary(_))
    }
}

/// Behavioural flags of a process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ExecutionFlags {
    /// Compile the view and notify clients, but never execute cycles.
    pub compile_only: bool,
    /// Wait (bounded by the configured timeout) until every market-data requirement has a
    /// value before running a cycle.
    pub await_market_data: bool,
    /// Do not run the first live cycle until a trigger or market-data change arrives.
    pub wait_for_initial_trigger: bool,
}

/// How a process executes its view.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecutionOptions {
    /// Cycle sequence.
    pub sequence: ExecutionSequence,
    /// Flags.
    pub flags: ExecutionFlags,
    /// Minimum time between the starts of two live cycles.
    pub min_cycle_period: Duration,
    /// Maximum time between two live cycles of an [`ExecutionSequence::Infinite`] sequence.
    pub max_cycle_period: Duration,
    /// After this many consecutive delta cycles the next cycle recomputes everything.
    pub max_successive_delta_cycles: Option<u32>,
}

impl ExecutionOptions {
    fn with_sequence(sequence: ExecutionSequence) -> Self {
        Self {
            sequence,
            flags: ExecutionFlags::default(),
            min_cycle_period: Duration::ZERO,
            max_cycle_period: Duration::from_secs(30),
            max_successive_delta_cycles: None,
        }
    }

    /// Live ticking forever.
    pub fn infinite() -> Self {
        Self::with_sequence(ExecutionSequence::Infinite)
    }

    /// One cycle per instant.
    pub fn arbitrary(instants: impl IntoIterator<Item = SystemTime>) -> Self {
        Self::with_sequence(ExecutionSequence::Arbitrary(instants.into_iter().collect()))
    }

    /// Cycle on input change only.
    pub fn on_input_change() -> Self {
        Self::with_sequence(ExecutionSequence::OnInputChange)
    }

    /// Compile only, never execute.
    pub fn compile_only(mut self) -> Self {
        self.flags.compile_only = true;
        self
    }

    /// Wait for market data before each cycle.
    pub fn await_market_data(mut self) -> Self {
        self.flags.await_market_data = true;
        self
    }

    /// Wait for a trigger before the first live cycle.
    pub fn wait_for_initial_trigger(mut self) -> Self {
        self.flags.wait_for_initial_trigger = true;
        self
    }

    /// Set the minimum live cycle period.
    pub fn with_min_cycle_period(mut self, period: Duration) -> Self {
        self.min_cycle_period = period;
        self
    }

    /// Set the maximum live cycle period.
    pub fn with_max_cycle_period(mut self, period: Duration) -> Self {
        self.max_cycle_period = period;
        self
    }

    /// Force a full cycle after `count` delta cycles.
    pub fn with_max_successive_delta_cycles(mut self, count: u32) -> Self {
        self.max_successive_delta_cycles = Some(count);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arbitrary_sequence_drains_in_order() {
        let t1 = SystemTime::UNIX_EPOCH + Duration::from_secs(1);
        let t2 = SystemTime::UNIX_EPOCH + Duration::from_secs(2);
        let mut options = ExecutionOptions::arbitrary([t1, t2]);
        assert!(!options.sequence.is_live());
        assert_eq!(options.sequence.next(), Some(Some(t1)));
        assert!(!options.sequence.is_empty());
        assert_eq!(options.sequence.next(), Some(Some(t2)));
        assert!(options.sequence.is_empty());
        assert_eq!(options.sequence.next(), None);
    }

    #[test]
    fn test_live_sequences_never_end() {
        let mut options = ExecutionOptions::infinite();
        assert_eq!(options.sequence.next(), Some(None));
        assert!(!options.sequence.is_empty());
        assert!(ExecutionOptions::on_input_change().sequence.is_live());
    }

    #[test]
    fn test_options_identify_shared_processes() {
        let a = ExecutionOptions::infinite().compile_only();
        let b = ExecutionOptions::infinite().compile_only();
        assert_eq!(a, b);
        assert_ne!(a, ExecutionOptions::infinite());
    }
}
