//! A fixed number of reusable frame slots, plus an index of the occupied slots ordered by
//! timestamp so that "oldest frame" queries stay cheap.

use crate::frame_buffer::{FrameBuffer, FrameState};
use crate::seq;

/// Refers to a slot checked out of the pool.  The generation guards against using a handle after
/// its slot has been released and reused for another frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameHandle {
    slot: usize,
    generation: u64,
}

struct Slot {
    frame: FrameBuffer,
    generation: u64,
}

/// What `recycle_until_key_frame()` managed to free.
#[derive(Debug, PartialEq)]
pub(crate) struct Recycled {
    pub released: usize,
    /// The undecoded key frame recycling stopped in front of, if any
    pub key_frame: Option<FrameHandle>,
}

/// Every slot holds a key frame awaiting decode (or is checked out for decoding)
#[derive(Debug, PartialEq)]
pub(crate) struct PoolExhausted;

pub(crate) struct FramePool {
    slots: Vec<Slot>,
    free: Vec<usize>,
    /// occupied slots, oldest timestamp first
    order: Vec<usize>,
}
impl FramePool {
    pub fn new(capacity: usize) -> FramePool {
        assert!(capacity > 0);
        FramePool {
            slots: (0..capacity)
                .map(|_| Slot {
                    frame: FrameBuffer::default(),
                    generation: 0,
                })
                .collect(),
            // popped from the back, so hand out slot 0 first
            free: (0..capacity).rev().collect(),
            order: Vec::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.order.len()
    }

    fn handle(&self, slot: usize) -> FrameHandle {
        FrameHandle {
            slot,
            generation: self.slots[slot].generation,
        }
    }

    fn valid(&self, handle: FrameHandle) -> bool {
        self.slots
            .get(handle.slot)
            .map_or(false, |s| s.generation == handle.generation)
    }

    pub fn get(&self, handle: FrameHandle) -> Option<&FrameBuffer> {
        if self.valid(handle) {
            Some(&self.slots[handle.slot].frame)
        } else {
            None
        }
    }

    pub fn get_mut(&mut self, handle: FrameHandle) -> Option<&mut FrameBuffer> {
        if self.valid(handle) {
            Some(&mut self.slots[handle.slot].frame)
        } else {
            None
        }
    }

    /// Occupied frames, oldest timestamp first
    pub fn iter(&self) -> impl Iterator<Item = (FrameHandle, &FrameBuffer)> + '_ {
        self.order
            .iter()
            .map(move |&slot| (self.handle(slot), &self.slots[slot].frame))
    }

    pub fn handles(&self) -> Vec<FrameHandle> {
        self.order.iter().map(|&slot| self.handle(slot)).collect()
    }

    pub fn oldest(&self) -> Option<FrameHandle> {
        self.order.first().map(|&slot| self.handle(slot))
    }

    pub fn find(&self, timestamp: u32) -> Option<FrameHandle> {
        // newest frames are the most likely match
        self.order
            .iter()
            .rev()
            .find(|&&slot| self.slots[slot].frame.timestamp() == timestamp)
            .map(|&slot| self.handle(slot))
    }

    /// Returns the frame owning `timestamp`, claiming a free slot for it if there is none,
    /// recycling old frames if there is no free slot.
    pub fn get_frame(
        &mut self,
        timestamp: u32,
    ) -> Result<(FrameHandle, Option<Recycled>), PoolExhausted> {
        if let Some(handle) = self.find(timestamp) {
            return Ok((handle, None));
        }
        if let Some(handle) = self.claim(timestamp) {
            return Ok((handle, None));
        }
        let recycled = self.recycle_until_key_frame()?;
        match self.claim(timestamp) {
            Some(handle) => Ok((handle, Some(recycled))),
            None => Err(PoolExhausted),
        }
    }

    fn claim(&mut self, timestamp: u32) -> Option<FrameHandle> {
        let slot = self.free.pop()?;
        self.slots[slot].frame.claim(timestamp);
        let pos = self
            .order
            .iter()
            .rposition(|&s| {
                !seq::is_newer_timestamp(self.slots[s].frame.timestamp(), timestamp)
            })
            .map_or(0, |p| p + 1);
        self.order.insert(pos, slot);
        Some(self.handle(slot))
    }

    /// Returns the slot to the free list.  Returns `false` if the handle was stale.
    pub fn release(&mut self, handle: FrameHandle) -> bool {
        if !self.valid(handle) {
            return false;
        }
        let slot = &mut self.slots[handle.slot];
        slot.frame.reset();
        slot.generation += 1;
        self.order.retain(|&s| s != handle.slot);
        self.free.push(handle.slot);
        true
    }

    /// Frees slots oldest-first, preferring to drop delta frames: recycling stops in front of
    /// the first undecoded key frame once at least one slot has been freed.  Slots checked out
    /// for decoding are never touched.
    pub fn recycle_until_key_frame(&mut self) -> Result<Recycled, PoolExhausted> {
        let mut released = 0;
        let mut key_frame = None;
        for handle in self.handles() {
            let frame = &self.slots[handle.slot].frame;
            if frame.state() == FrameState::Decoding {
                continue;
            }
            if frame.is_key_frame() {
                if released > 0 {
                    key_frame = Some(handle);
                    break;
                }
                continue;
            }
            log::debug!(
                "recycling frame ts={} state={:?} low_seq={:?}",
                frame.timestamp(),
                frame.state(),
                frame.low_seq()
            );
            self.release(handle);
            released += 1;
        }
        if released == 0 {
            Err(PoolExhausted)
        } else {
            Ok(Recycled {
                released,
                key_frame,
            })
        }
    }

    /// Frees every slot, including any checked out for decoding.  Outstanding handles become
    /// stale.
    pub fn release_all(&mut self) {
        for handle in self.handles() {
            self.release(handle);
        }
    }
}
