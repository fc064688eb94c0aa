// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Opaque stream handles for firmware session tracking.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

/// Session key carried in every protocol message.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub u32);

/// Hands out process-unique stream handles.
///
/// The handle combines the bit-reversed process id with a monotonically
/// incrementing counter. Handles are unique within one process lifetime only;
/// two processes sharing a GPU may collide and the firmware tolerates that.
///
/// One allocator is expected per driver context; the counter is owned here
/// rather than in module-level state so instances stay independent.
#[derive(Default)]
pub struct StreamHandleAllocator {
    counter: AtomicU32,
}

impl StreamHandleAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> StreamHandle {
        let serial = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        StreamHandle(std::process::id().reverse_bits() ^ serial)
    }
}
