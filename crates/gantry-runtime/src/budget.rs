//! Resource budget shared across a chain of nested calls.
//!
//! A child call starts from a [`Budget::fork`] of its parent, so it sees the
//! same ceilings and everything consumed so far. When the child returns, the
//! parent [`Budget::absorb`]s the child's counters. Consumption only moves
//! forward; no hop in a call chain can reset it.

use crate::error::{RuntimeError, RuntimeResult};

/// Deepest call chain the engine runs, whatever `max_frames` says. Script
/// calls recurse on the native stack, so a frame ceiling of 0 still stops
/// here.
pub const MAX_CALL_DEPTH: u32 = 256;

/// Stack size for threads that run plugin code, enough for
/// [`MAX_CALL_DEPTH`] cross-plugin hops in an unoptimized build.
pub const CALL_STACK_SIZE: usize = 64 * 1024 * 1024;

/// Step, allocation and call depth accounting. A ceiling of 0 means unlimited,
/// except for call depth which never exceeds [`MAX_CALL_DEPTH`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Budget {
    /// Maximum executed instructions.
    pub max_steps: u64,
    /// Maximum array and string creations.
    pub max_allocations: u64,
    /// Maximum call depth, capped at [`MAX_CALL_DEPTH`].
    pub max_frames: u32,
    /// Instructions executed so far.
    pub steps: u64,
    /// Allocations made so far.
    pub allocations: u64,
    /// Current call depth.
    pub frames: u32,
}

impl Budget {
    /// Create a budget with the given ceilings and nothing consumed.
    pub fn new(max_steps: u64, max_allocations: u64, max_frames: u32) -> Self {
        Self {
            max_steps,
            max_allocations,
            max_frames,
            ..Default::default()
        }
    }

    /// A budget with no ceilings.
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Same ceilings, nothing consumed.
    pub fn limits(&self) -> Budget {
        Budget::new(self.max_steps, self.max_allocations, self.max_frames)
    }

    /// Budget for a nested call: ceilings and consumption carry over.
    pub fn fork(&self) -> Budget {
        self.clone()
    }

    /// Fold a finished child's consumption back into this budget.
    pub fn absorb(&mut self, child: &Budget) {
        self.steps = self.steps.max(child.steps);
        self.allocations = self.allocations.max(child.allocations);
    }

    /// Account for `n` executed instructions.
    pub fn add_steps(&mut self, n: u64) -> RuntimeResult<()> {
        self.steps = self.steps.saturating_add(n);
        if self.max_steps > 0 && self.steps > self.max_steps {
            return Err(RuntimeError::StepLimitExceeded {
                limit: self.max_steps,
            });
        }
        Ok(())
    }

    /// Account for one executed instruction.
    pub fn step(&mut self) -> RuntimeResult<()> {
        self.add_steps(1)
    }

    /// Account for one array or string creation.
    pub fn allocate(&mut self) -> RuntimeResult<()> {
        self.allocations = self.allocations.saturating_add(1);
        if self.max_allocations > 0 && self.allocations > self.max_allocations {
            return Err(RuntimeError::AllocationLimitExceeded {
                limit: self.max_allocations,
            });
        }
        Ok(())
    }

    /// Call depth actually enforced.
    pub fn frame_limit(&self) -> u32 {
        match self.max_frames {
            0 => MAX_CALL_DEPTH,
            n => n.min(MAX_CALL_DEPTH),
        }
    }

    pub fn enter_frame(&mut self) -> RuntimeResult<()> {
        let limit = self.frame_limit();
        if self.frames >= limit {
            return Err(RuntimeError::FrameLimitExceeded { limit });
        }
        self.frames += 1;
        Ok(())
    }

    pub fn exit_frame(&mut self) {
        self.frames = self.frames.saturating_sub(1);
    }

    /// Steps left before the ceiling, or `None` when unlimited.
    pub fn remaining_steps(&self) -> Option<u64> {
        (self.max_steps > 0).then(|| self.max_steps.saturating_sub(self.steps))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_means_unlimited() {
        let mut budget = Budget::unlimited();
        for _ in 0..10_000 {
            budget.step().unwrap();
            budget.allocate().unwrap();
        }
        assert_eq!(budget.steps, 10_000);
        assert!(budget.remaining_steps().is_none());
    }

    #[test]
    fn test_step_ceiling() {
        let mut budget = Budget::new(3, 0, 0);
        budget.step().unwrap();
        budget.step().unwrap();
        budget.step().unwrap();
        assert!(matches!(
            budget.step(),
            Err(RuntimeError::StepLimitExceeded { limit: 3 })
        ));
    }

    #[test]
    fn test_allocation_ceiling() {
        let mut budget = Budget::new(0, 1, 0);
        budget.allocate().unwrap();
        assert!(budget.allocate().is_err());
    }

    #[test]
    fn test_frame_ceiling() {
        let mut budget = Budget::new(0, 0, 2);
        budget.enter_frame().unwrap();
        budget.enter_frame().unwrap();
        assert!(budget.enter_frame().is_err());
        budget.exit_frame();
        budget.enter_frame().unwrap();
    }

    #[test]
    fn test_call_depth_is_capped() {
        let mut budget = Budget::unlimited();
        assert_eq!(budget.frame_limit(), MAX_CALL_DEPTH);
        for _ in 0..MAX_CALL_DEPTH {
            budget.enter_frame().unwrap();
        }
        assert!(matches!(
            budget.enter_frame(),
            Err(RuntimeError::FrameLimitExceeded { limit: MAX_CALL_DEPTH })
        ));

        assert_eq!(Budget::new(0, 0, u32::MAX).frame_limit(), MAX_CALL_DEPTH);
        assert_eq!(Budget::new(0, 0, 12).frame_limit(), 12);
    }

    #[test]
    fn test_fork_and_absorb_share_one_counter() {
        let mut parent = Budget::new(100, 0, 0);
        parent.add_steps(40).unwrap();

        let mut child = parent.fork();
        assert_eq!(child.steps, 40);
        child.add_steps(50).unwrap();
        assert!(child.add_steps(20).is_err());

        parent.absorb(&child);
        assert_eq!(parent.steps, 110);
        assert_eq!(parent.remaining_steps(), Some(0));
    }

    #[test]
    fn test_absorb_never_moves_backwards() {
        let mut parent = Budget::new(0, 0, 0);
        parent.add_steps(10).unwrap();
        parent.absorb(&Budget::unlimited());
        assert_eq!(parent.steps, 10);
    }

    #[test]
    fn test_limits_resets_consumption() {
        let mut budget = Budget::new(5, 6, 7);
        budget.step().unwrap();
        let fresh = budget.limits();
        assert_eq!(fresh.steps, 0);
        assert_eq!(fresh.max_allocations, 6);
    }
}
