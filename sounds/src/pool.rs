//! Streaming buffer pool.
//!
//! A fixed array of PCM slots addressed by [`SlotId`], with a free list of slot
//! indices. Slots are acquired by a voice before decoding into them and go back
//! to the free list once the hardware reports the buffer consumed. The pool never
//! grows, which bounds streaming memory at `slot count × slot size` no matter how
//! many sounds are requested.

use crate::error::{Result, SoundsError};

/// Index of a slot in a [`BufferPool`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SlotId(u32);

impl SlotId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SlotId({})", self.0)
    }
}

#[derive(Debug)]
pub struct BufferPool {
    storage: Vec<Box<[f32]>>,
    free: Vec<SlotId>,
    in_flight: Vec<bool>,
}

impl BufferPool {
    /// Allocates `slot_count` slots of `slot_samples` samples each, all free.
    pub fn new(slot_count: usize, slot_samples: usize) -> Self {
        let storage = (0..slot_count)
            .map(|_| vec![0.0f32; slot_samples].into_boxed_slice())
            .collect();
        // Reversed so that slot 0 is handed out first.
        let free = (0..slot_count as u32).rev().map(SlotId).collect();

        Self {
            storage,
            free,
            in_flight: vec![false; slot_count],
        }
    }

    /// Takes a free slot, or `None` when every slot is in flight.
    pub fn acquire(&mut self) -> Option<SlotId> {
        let slot = self.free.pop()?;
        self.in_flight[slot.index()] = true;
        Some(slot)
    }

    /// Returns a slot to the free list.
    ///
    /// Releasing a slot that is already free is a caller bug: it fails with
    /// `DoubleRelease` in debug builds and is ignored (with a warning) in release
    /// builds, leaving the free list intact either way.
    pub fn release(&mut self, slot: SlotId) -> Result<()> {
        let Some(in_flight) = self.in_flight.get_mut(slot.index()) else {
            return Err(SoundsError::InvalidSlot(slot.0));
        };

        if !*in_flight {
            if cfg!(debug_assertions) {
                return Err(SoundsError::DoubleRelease(slot.0));
            }
            log::warn!("Ignoring double release of {}", slot);
            return Ok(());
        }

        *in_flight = false;
        self.free.push(slot);
        Ok(())
    }

    pub fn samples(&self, slot: SlotId) -> &[f32] {
        &self.storage[slot.index()]
    }

    pub fn samples_mut(&mut self, slot: SlotId) -> &mut [f32] {
        &mut self.storage[slot.index()]
    }

    pub fn is_in_flight(&self, slot: SlotId) -> bool {
        self.in_flight.get(slot.index()).copied().unwrap_or(false)
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.capacity() - self.free.len()
    }

    /// Number of `f32` samples each slot holds.
    pub fn slot_samples(&self) -> usize {
        self.storage.first().map_or(0, |slot| slot.len())
    }
}
