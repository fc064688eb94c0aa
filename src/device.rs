// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interfaces to the surrounding driver stack.
//!
//! The codec engines do not allocate GPU memory or talk to the kernel
//! themselves; they record work through the traits below. The embedding driver
//! provides real implementations, while [`dummy`] provides recording doubles so
//! the state machines can be exercised in isolation.

pub mod dummy;

use std::rc::Rc;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("out of device memory")]
    OutOfMemory,
    #[error("fence wait timed out")]
    Timeout,
    #[error("buffer has already been destroyed")]
    Destroyed,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type DeviceResult<T> = Result<T, DeviceError>;

/// Placement domain of an allocation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemoryDomain {
    /// Device-local memory, fastest for the engine to access.
    Device,
    /// Host-visible memory the CPU writes messages and bitstream data into.
    Staging,
}

/// How the engine will access a buffer referenced by a submission.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

/// Flags passed through to the command stream flush.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FlushFlags {
    /// Allow the submission to complete asynchronously; completion is observed
    /// through the returned [`Fence`].
    pub asynchronous: bool,
}

/// Identifier of a buffer reference within the current command buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RelocationId(pub u32);

/// Completion token returned by a flush.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fence(pub u64);

/// CPU-visible view of a mapped resource. Unmaps when dropped.
pub trait MappedRegion {
    fn as_slice(&self) -> &[u8];
    fn as_mut_slice(&mut self) -> &mut [u8];
}

/// A reference-counted GPU allocation with a stable virtual address.
pub trait GpuResource {
    fn size(&self) -> usize;
    fn virtual_address(&self) -> u64;

    /// Maps the resource for CPU access.
    fn map(&self) -> DeviceResult<Box<dyn MappedRegion + '_>>;
}

/// Allocation service provided by the embedding driver.
pub trait ResourceBackend {
    /// Creates a resource of at least `size` bytes in `domain`. The contents
    /// are undefined until written; callers that hand the resource to the
    /// engine must clear it first.
    fn create_resource(
        &self,
        size: usize,
        domain: MemoryDomain,
    ) -> DeviceResult<Rc<dyn GpuResource>>;
}

/// Command recording and submission service.
///
/// Within one codec instance submissions are observed by the engine in
/// recording order; this is relied upon for the rotating buffer sets.
pub trait CommandStream {
    /// References `resource` from the current command buffer and returns its
    /// relocation slot.
    fn add_buffer(
        &mut self,
        resource: &Rc<dyn GpuResource>,
        access: Access,
        domain: MemoryDomain,
    ) -> RelocationId;

    /// Records a register write.
    fn set_reg(&mut self, reg: u32, value: u32);

    /// Appends a raw command dword. Used by the encode engine, whose firmware
    /// consumes packets from the ring rather than from message buffers.
    fn emit(&mut self, dword: u32);

    fn emit_slice(&mut self, dwords: &[u32]) {
        for &dword in dwords {
            self.emit(dword);
        }
    }

    /// Number of dwords recorded since the last flush.
    fn num_emitted(&self) -> usize;

    /// Submits all recorded work. May block until the ring has room.
    fn flush(&mut self, flags: FlushFlags) -> DeviceResult<Fence>;

    /// Waits for `fence` with a timeout in nanoseconds.
    fn wait(&self, fence: &Fence, timeout_ns: u64) -> DeviceResult<()>;
}
