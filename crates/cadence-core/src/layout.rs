//! Minibatch layout: how parallel sequences and time steps map onto columns.
//!
//! A minibatch holds `S` parallel sequences of `T` time steps each. Values of
//! minibatch-shaped nodes are matrices with `S * T` columns, stored time-major:
//! the `S` columns of step `t` are contiguous, starting at column `t * S`. This
//! lets a sequential (per-step) pass hand each node one contiguous column block.
//!
//! Per-frame [`FrameFlags`] mark sequence boundaries and gap frames (padding
//! where a shorter sequence has already ended). The layout is read-only for the
//! execution engine; it is supplied by whoever feeds the minibatch.

use core::ops::Range;

/// Per-frame packing flags.
///
/// # Example
///
/// ```rust
/// use cadence_core::FrameFlags;
///
/// let flags = FrameFlags::SEQUENCE_START.union(FrameFlags::SEQUENCE_END);
/// assert!(flags.contains(FrameFlags::SEQUENCE_START));
/// assert!(!flags.contains(FrameFlags::GAP));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// First frame of a sequence. Past-looking delays do not read across it.
    pub const SEQUENCE_START: Self = Self(1 << 0);
    /// Last frame of a sequence. Future-looking delays do not read across it.
    pub const SEQUENCE_END: Self = Self(1 << 1);
    /// Padding frame that carries no data; masked to zero in sequential passes.
    pub const GAP: Self = Self(1 << 2);

    /// Returns `true` if all bits in `other` are set in `self`.
    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns the union of two flag sets.
    #[inline]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns `true` if no flag is set.
    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// The extent a node computes over in one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRange {
    /// Every frame of the minibatch at once (PAR mode).
    All,
    /// The `S` frames of a single time step (SEQ mode).
    Step(usize),
}

impl FrameRange {
    /// Returns the time step for a per-step range.
    pub fn step(self) -> Option<usize> {
        match self {
            Self::All => None,
            Self::Step(t) => Some(t),
        }
    }
}

/// Shape of the current minibatch.
#[derive(Debug, Clone, PartialEq)]
pub struct MinibatchLayout {
    sequences: usize,
    steps: usize,
    /// Indexed by `t * sequences + s`, like the value columns.
    flags: Vec<FrameFlags>,
}

impl MinibatchLayout {
    /// Creates a layout of `sequences` parallel sequences over `steps` time steps,
    /// with no flags set.
    pub fn new(sequences: usize, steps: usize) -> Self {
        Self {
            sequences,
            steps,
            flags: vec![FrameFlags::NONE; sequences * steps],
        }
    }

    /// Returns the number of parallel sequences.
    pub fn num_parallel_sequences(&self) -> usize {
        self.sequences
    }

    /// Returns the number of time steps.
    pub fn num_time_steps(&self) -> usize {
        self.steps
    }

    /// Returns the total number of frames (columns of a minibatch value).
    pub fn num_frames(&self) -> usize {
        self.sequences * self.steps
    }

    /// Returns the column index of sequence `s` at step `t`.
    #[inline]
    pub fn frame_index(&self, s: usize, t: usize) -> usize {
        t * self.sequences + s
    }

    /// Adds `flags` to the frame of sequence `s` at step `t`.
    ///
    /// # Panics
    ///
    /// Panics if `s` or `t` is outside the layout.
    pub fn set_flags(&mut self, s: usize, t: usize, flags: FrameFlags) {
        assert!(s < self.sequences && t < self.steps, "frame ({s}, {t}) outside layout");
        let idx = self.frame_index(s, t);
        self.flags[idx] = self.flags[idx].union(flags);
    }

    /// Returns the flags of sequence `s` at step `t` (none outside the layout).
    pub fn flags(&self, s: usize, t: usize) -> FrameFlags {
        if s >= self.sequences || t >= self.steps {
            return FrameFlags::NONE;
        }
        self.flags[self.frame_index(s, t)]
    }

    /// Returns `true` if the frame is padding.
    pub fn is_gap(&self, s: usize, t: usize) -> bool {
        self.flags(s, t).contains(FrameFlags::GAP)
    }

    /// Returns `true` if a sequence starts at this frame.
    pub fn is_sequence_start(&self, s: usize, t: usize) -> bool {
        self.flags(s, t).contains(FrameFlags::SEQUENCE_START)
    }

    /// Returns `true` if a sequence ends at this frame.
    pub fn is_sequence_end(&self, s: usize, t: usize) -> bool {
        self.flags(s, t).contains(FrameFlags::SEQUENCE_END)
    }

    /// Returns `true` if any frame is a gap.
    pub fn has_gaps(&self) -> bool {
        self.flags.iter().any(|f| f.contains(FrameFlags::GAP))
    }

    /// Returns the column range covered by `range`.
    pub fn columns(&self, range: FrameRange) -> Range<usize> {
        match range {
            FrameRange::All => 0..self.num_frames(),
            FrameRange::Step(t) => t * self.sequences..(t + 1) * self.sequences,
        }
    }

    /// Returns the time steps covered by `range`.
    pub fn steps_in(&self, range: FrameRange) -> Range<usize> {
        match range {
            FrameRange::All => 0..self.steps,
            FrameRange::Step(t) => t..t + 1,
        }
    }
}

impl Default for MinibatchLayout {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_time_major() {
        let layout = MinibatchLayout::new(3, 4);
        assert_eq!(layout.num_frames(), 12);
        assert_eq!(layout.frame_index(0, 0), 0);
        assert_eq!(layout.frame_index(2, 0), 2);
        assert_eq!(layout.frame_index(0, 1), 3);
        assert_eq!(layout.columns(FrameRange::Step(2)), 6..9);
        assert_eq!(layout.columns(FrameRange::All), 0..12);
    }

    #[test]
    fn flags_accumulate() {
        let mut layout = MinibatchLayout::new(2, 3);
        layout.set_flags(1, 2, FrameFlags::SEQUENCE_END);
        layout.set_flags(1, 2, FrameFlags::GAP);
        assert!(layout.is_sequence_end(1, 2));
        assert!(layout.is_gap(1, 2));
        assert!(!layout.is_gap(0, 2));
        assert!(layout.has_gaps());
    }

    #[test]
    fn flags_outside_layout_are_empty() {
        let layout = MinibatchLayout::new(2, 2);
        assert!(layout.flags(5, 0).is_empty());
        assert!(layout.flags(0, 5).is_empty());
    }

    #[test]
    #[should_panic]
    fn set_flags_outside_layout_panics() {
        let mut layout = MinibatchLayout::new(1, 1);
        layout.set_flags(0, 1, FrameFlags::GAP);
    }

    #[test]
    fn steps_in_range() {
        let layout = MinibatchLayout::new(2, 5);
        assert_eq!(layout.steps_in(FrameRange::All), 0..5);
        assert_eq!(layout.steps_in(FrameRange::Step(3)), 3..4);
        assert_eq!(FrameRange::Step(3).step(), Some(3));
        assert_eq!(FrameRange::All.step(), None);
    }
}
