// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Coded picture buffer slot ledger.
//!
//! The encode engine reconstructs every frame into one shared CPB allocation,
//! addressed by slot. The ledger keeps the slots in most-recently-used order:
//! new pictures always land in the tail slot and move toward the head once
//! they become references. Slots have fixed identities; only their order and
//! picture metadata change.

use std::collections::VecDeque;

use log::warn;

use crate::align;
use crate::PictureType;
use crate::Resolution;

/// Per-slot geometry of the shared CPB allocation.
#[derive(Copy, Clone, Debug)]
pub struct FrameFootprint {
    /// Luma row pitch in bytes.
    pub pitch: u32,
    /// Padded rows per luma plane.
    pub vpitch: u32,
}

impl FrameFootprint {
    pub fn new(resolution: Resolution) -> Self {
        Self {
            pitch: align(resolution.width, 128),
            vpitch: align(resolution.height, 16),
        }
    }

    /// Bytes of one slot: luma plane plus half-height chroma.
    pub fn frame_size(&self) -> u32 {
        self.pitch * (self.vpitch + self.vpitch / 2)
    }
}

/// One coded-picture-buffer slot.
#[derive(Clone, Debug)]
pub struct CpbSlot {
    /// Fixed identity, assigned at creation and never reused.
    pub index: u32,
    pub picture_type: PictureType,
    pub frame_num: u32,
    pub pic_order_cnt: u32,
}

/// Ordered slot list. The front of the order is the "head" (most recently
/// promoted references), the back is the "tail" (the picture currently being
/// reconstructed).
pub struct CpbLedger {
    slots: Vec<CpbSlot>,
    order: VecDeque<usize>,
    footprint: FrameFootprint,
}

impl CpbLedger {
    pub fn new(cpb_num: usize, footprint: FrameFootprint) -> Self {
        let mut ledger = Self {
            slots: (0..cpb_num)
                .map(|index| CpbSlot {
                    index: index as u32,
                    picture_type: PictureType::Skip,
                    frame_num: 0,
                    pic_order_cnt: 0,
                })
                .collect(),
            order: VecDeque::with_capacity(cpb_num),
            footprint,
        };
        ledger.reset();
        ledger
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Reinitializes the list to index order with all slots unused. Called on
    /// every IDR picture.
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.picture_type = PictureType::Skip;
            slot.frame_num = 0;
            slot.pic_order_cnt = 0;
        }
        self.order.clear();
        self.order.extend(0..self.slots.len());
    }

    /// Moves the slots holding the L0 (and, for B pictures, L1) references to
    /// the head, L0 ending up nearest. A no-op for intra pictures.
    pub fn promote_for(
        &mut self,
        picture_type: PictureType,
        l0_frame_num: u32,
        l1_frame_num: u32,
    ) {
        if !picture_type.is_inter() {
            return;
        }

        let mut l0 = None;
        let mut l1 = None;
        for &slot_idx in &self.order {
            let slot = &self.slots[slot_idx];
            if slot.frame_num == l0_frame_num && l0.is_none() {
                l0 = Some(slot_idx);
            }
            if picture_type == PictureType::B && slot.frame_num == l1_frame_num && l1.is_none() {
                l1 = Some(slot_idx);
            }
            // Stop scanning as soon as everything needed is found.
            match picture_type {
                PictureType::P if l0.is_some() => break,
                PictureType::B if l0.is_some() && l1.is_some() => break,
                _ => (),
            }
        }

        if let Some(slot_idx) = l1 {
            self.move_to_head(slot_idx);
        }
        if let Some(slot_idx) = l0 {
            self.move_to_head(slot_idx);
        }
    }

    /// The slot receiving the picture currently being reconstructed.
    pub fn current(&self) -> &CpbSlot {
        &self.slots[*self.order.back().expect("ledger is never empty")]
    }

    /// Most recently promoted reference.
    pub fn l0(&self) -> &CpbSlot {
        &self.slots[self.order[0]]
    }

    /// Second most recently promoted reference.
    pub fn l1(&self) -> &CpbSlot {
        &self.slots[self.order[1]]
    }

    /// Records the just-encoded picture in the tail slot. Reference pictures
    /// move to the head so the next frame can select them; non-references stay
    /// at the tail and are overwritten by the next frame.
    pub fn commit(
        &mut self,
        picture_type: PictureType,
        frame_num: u32,
        pic_order_cnt: u32,
        is_reference: bool,
    ) {
        let tail = *self.order.back().expect("ledger is never empty");
        let slot = &mut self.slots[tail];
        slot.picture_type = picture_type;
        slot.frame_num = frame_num;
        slot.pic_order_cnt = pic_order_cnt;

        if is_reference {
            self.order.pop_back();
            self.order.push_front(tail);
        }
    }

    /// Byte offsets of a slot's luma and chroma planes inside the CPB
    /// allocation. Pure function of the slot identity and frame geometry.
    pub fn frame_offset(&self, slot: &CpbSlot) -> (u32, u32) {
        let luma = slot.index * self.footprint.frame_size();
        let chroma = luma + self.footprint.pitch * self.footprint.vpitch;
        (luma, chroma)
    }

    /// Resolves `requested` (a reference `frame_num`) for the picture numbered
    /// `frame_number`.
    ///
    /// A miss must not fail the encode: an out-of-range reference can hang the
    /// engine, so the fallback clamps into the window of recent frames.
    pub fn ref_pic_idx(&self, frame_number: u32, requested: u32) -> u32 {
        let known = self
            .order
            .iter()
            .any(|&slot_idx| self.slots[slot_idx].frame_num == requested);
        if known {
            return requested;
        }

        let window = self.slots.len() as u32;
        let fallback = frame_number.saturating_sub(window).max(1) - 1;
        warn!(
            "reference frame_num {} not in ledger, substituting {}",
            requested, fallback
        );
        fallback
    }

    fn move_to_head(&mut self, slot_idx: usize) {
        if let Some(pos) = self.order.iter().position(|&idx| idx == slot_idx) {
            self.order.remove(pos);
            self.order.push_front(slot_idx);
        }
    }

    #[cfg(test)]
    fn order_indices(&self) -> Vec<u32> {
        self.order
            .iter()
            .map(|&slot_idx| self.slots[slot_idx].index)
            .collect()
    }
}
