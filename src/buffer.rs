// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Fixed-purpose engine buffers.
//!
//! Message, feedback, bitstream, reference-picture and session-context storage
//! all go through [`EngineBuffer`]. Creation zero-fills before first use: the
//! engine treats whatever it finds in a reference-picture store as valid frame
//! data, so it must never observe allocator garbage.

use log::debug;
use thiserror::Error;

use std::rc::Rc;

use crate::device::DeviceError;
use crate::device::GpuResource;
use crate::device::MemoryDomain;
use crate::device::ResourceBackend;

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("out of device memory")]
    OutOfMemory,
    #[error("buffer has already been destroyed")]
    Destroyed,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type BufferResult<T> = Result<T, BufferError>;

impl From<DeviceError> for BufferError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::OutOfMemory => BufferError::OutOfMemory,
            other => BufferError::Other(other.into()),
        }
    }
}

/// An engine-owned GPU buffer with a known placement domain.
///
/// The resource handle is replaced wholesale on resize; holders of the old
/// [`Rc`] keep a valid (stale) allocation until they drop it.
pub struct EngineBuffer {
    res: Option<Rc<dyn GpuResource>>,
    domain: MemoryDomain,
}

impl EngineBuffer {
    /// Allocates and zero-fills a buffer of `size` bytes.
    ///
    /// The clear is synchronous: the buffer is not handed back until its
    /// contents are defined.
    pub fn create(
        backend: &dyn ResourceBackend,
        size: usize,
        domain: MemoryDomain,
    ) -> BufferResult<Self> {
        let res = backend.create_resource(size, domain)?;
        res.map()?.as_mut_slice().fill(0);

        Ok(Self {
            res: Some(res),
            domain,
        })
    }

    /// Current capacity in bytes. Zero once destroyed.
    pub fn size(&self) -> usize {
        self.res.as_ref().map(|res| res.size()).unwrap_or(0)
    }

    pub fn resource(&self) -> BufferResult<&Rc<dyn GpuResource>> {
        self.res.as_ref().ok_or(BufferError::Destroyed)
    }

    /// Grows the buffer to at least `new_size` bytes, preserving existing
    /// contents and zero-filling the tail.
    ///
    /// A request within the current capacity is a no-op. On allocation failure
    /// the existing buffer is left untouched so the caller never loses its only
    /// live allocation.
    pub fn resize(&mut self, backend: &dyn ResourceBackend, new_size: usize) -> BufferResult<()> {
        let old = self.res.as_ref().ok_or(BufferError::Destroyed)?;
        let old_size = old.size();
        if new_size <= old_size {
            return Ok(());
        }

        debug!("resizing engine buffer {} -> {} bytes", old_size, new_size);

        let new = backend.create_resource(new_size, self.domain)?;
        {
            let old_map = old.map()?;
            let mut new_map = new.map()?;
            let dst = new_map.as_mut_slice();
            dst[..old_size].copy_from_slice(old_map.as_slice());
            dst[old_size..].fill(0);
        }

        self.res = Some(new);
        Ok(())
    }

    /// Releases the backing resource. Safe to call more than once.
    pub fn destroy(&mut self) {
        self.res = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::dummy::DummyBackend;

    #[test]
    fn create_zero_fills() {
        let backend = DummyBackend::new();
        let buf = EngineBuffer::create(&*backend, 64, MemoryDomain::Device).unwrap();

        let res = buf.resource().unwrap();
        let map = res.map().unwrap();
        assert!(map.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn resize_preserves_contents() {
        let backend = DummyBackend::new();
        let mut buf = EngineBuffer::create(&*backend, 100, MemoryDomain::Staging).unwrap();

        {
            let res = buf.resource().unwrap();
            let mut map = res.map().unwrap();
            for (i, b) in map.as_mut_slice().iter_mut().enumerate() {
                *b = i as u8;
            }
        }

        buf.resize(&*backend, 300).unwrap();
        assert_eq!(buf.size(), 300);

        let res = buf.resource().unwrap();
        let map = res.map().unwrap();
        for (i, &b) in map.as_slice()[..100].iter().enumerate() {
            assert_eq!(b, i as u8);
        }
        assert!(map.as_slice()[100..].iter().all(|&b| b == 0));
    }

    #[test]
    fn resize_within_capacity_is_noop() {
        let backend = DummyBackend::new();
        let mut buf = EngineBuffer::create(&*backend, 128, MemoryDomain::Staging).unwrap();
        let va = buf.resource().unwrap().virtual_address();

        buf.resize(&*backend, 64).unwrap();
        assert_eq!(buf.size(), 128);
        assert_eq!(buf.resource().unwrap().virtual_address(), va);
    }

    #[test]
    fn failed_resize_keeps_old_buffer() {
        let backend = DummyBackend::with_budget(256);
        let mut buf = EngineBuffer::create(&*backend, 128, MemoryDomain::Staging).unwrap();

        {
            let res = buf.resource().unwrap();
            res.map().unwrap().as_mut_slice()[0] = 0x5a;
        }

        // Only 128 bytes of budget left; growing to 1024 must fail cleanly.
        assert!(matches!(
            buf.resize(&*backend, 1024),
            Err(BufferError::OutOfMemory)
        ));
        assert_eq!(buf.size(), 128);
        let res = buf.resource().unwrap();
        assert_eq!(res.map().unwrap().as_slice()[0], 0x5a);
    }

    #[test]
    fn destroy_is_idempotent() {
        let backend = DummyBackend::new();
        let mut buf = EngineBuffer::create(&*backend, 16, MemoryDomain::Device).unwrap();
        buf.destroy();
        buf.destroy();
        assert_eq!(buf.size(), 0);
        assert!(matches!(buf.resource(), Err(BufferError::Destroyed)));
    }
}
