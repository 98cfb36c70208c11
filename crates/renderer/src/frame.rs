//! Frame slot indexing and per-frame resources.
//!
//! A [`FrameIndex`] names one of the [`MAX_FRAMES_IN_FLIGHT`] frame slots. While a frame
//! is being recorded, [`FrameManager::frame_index`](crate::FrameManager::frame_index) hands
//! out the slot the GPU is not using, so per-frame updates keyed by it never touch memory a
//! frame in flight reads. [`FrameIndex::all`] lists the slots for setup code.

use std::ops::{Index, IndexMut};

use ash::vk;

use frameline_rhi::command::CommandBuffer;

use crate::MAX_FRAMES_IN_FLIGHT;

/// Index of a frame slot, in `0..MAX_FRAMES_IN_FLIGHT`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FrameIndex(usize);

impl FrameIndex {
    pub(crate) fn new(slot: usize) -> Self {
        debug_assert!(slot < MAX_FRAMES_IN_FLIGHT);
        Self(slot)
    }

    /// The slot as a plain index.
    #[inline]
    pub fn get(self) -> usize {
        self.0
    }

    /// Every frame slot in order, for setting up per-frame resources.
    pub fn all() -> impl Iterator<Item = FrameIndex> {
        (0..MAX_FRAMES_IN_FLIGHT).map(Self)
    }
}

/// One `T` per frame slot.
#[derive(Debug, Clone)]
pub struct PerFrame<T> {
    items: Vec<T>,
}

impl<T> PerFrame<T> {
    /// Builds each slot's value with `f(slot)`, stopping at the first error.
    pub fn try_new<E>(mut f: impl FnMut(usize) -> Result<T, E>) -> Result<Self, E> {
        let items = (0..MAX_FRAMES_IN_FLIGHT)
            .map(&mut f)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { items })
    }

    /// Wraps one value per slot.
    ///
    /// # Panics
    ///
    /// Panics if `items` does not hold exactly [`MAX_FRAMES_IN_FLIGHT`] values.
    pub fn from_vec(items: Vec<T>) -> Self {
        assert_eq!(
            items.len(),
            MAX_FRAMES_IN_FLIGHT,
            "expected one value per frame slot"
        );
        Self { items }
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }
}

impl<T> Index<FrameIndex> for PerFrame<T> {
    type Output = T;

    fn index(&self, frame: FrameIndex) -> &T {
        &self.items[frame.0]
    }
}

impl<T> IndexMut<FrameIndex> for PerFrame<T> {
    fn index_mut(&mut self, frame: FrameIndex) -> &mut T {
        &mut self.items[frame.0]
    }
}

/// What a render system needs to record its part of a frame.
#[derive(Debug)]
pub struct FrameInfo<'a> {
    pub frame_index: FrameIndex,
    /// Seconds since the previous frame.
    pub frame_time: f32,
    pub command_buffer: &'a CommandBuffer,
    /// Set bound at index 0, holding the frame's global uniforms.
    pub global_descriptor_set: vk::DescriptorSet,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_frame_builds_one_value_per_slot() {
        let frames = PerFrame::try_new(|slot| Ok::<_, ()>(slot * 10)).unwrap();
        assert_eq!(frames.as_slice().len(), MAX_FRAMES_IN_FLIGHT);
        assert_eq!(frames[FrameIndex::new(1)], 10);
    }

    #[test]
    fn test_all_lists_every_slot() {
        let slots: Vec<_> = FrameIndex::all().map(FrameIndex::get).collect();
        assert_eq!(slots, (0..MAX_FRAMES_IN_FLIGHT).collect::<Vec<_>>());
    }

    #[test]
    fn test_per_frame_stops_at_first_error() {
        let mut calls = 0;
        let result = PerFrame::<usize>::try_new(|slot| {
            calls += 1;
            if slot == 0 { Err("boom") } else { Ok(slot) }
        });
        assert_eq!(result.unwrap_err(), "boom");
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_per_frame_index_mut() {
        let mut frames = PerFrame::from_vec(vec![0u32; MAX_FRAMES_IN_FLIGHT]);
        frames[FrameIndex::new(0)] = 7;
        assert_eq!(frames.iter().copied().collect::<Vec<_>>(), vec![7, 0]);
    }

    #[test]
    #[should_panic(expected = "one value per frame slot")]
    fn test_per_frame_rejects_wrong_length() {
        let _ = PerFrame::from_vec(vec![0u8; MAX_FRAMES_IN_FLIGHT + 1]);
    }
}
