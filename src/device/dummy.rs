// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Recording doubles for the device traits so the engines can be tested
//! without hardware.

use std::cell::Cell;
use std::cell::RefCell;
use std::cell::RefMut;
use std::rc::Rc;

use crate::device::Access;
use crate::device::CommandStream;
use crate::device::DeviceError;
use crate::device::DeviceResult;
use crate::device::Fence;
use crate::device::FlushFlags;
use crate::device::GpuResource;
use crate::device::MappedRegion;
use crate::device::MemoryDomain;
use crate::device::RelocationId;

/// One recorded command stream operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamOp {
    AddBuffer {
        va: u64,
        size: usize,
        access: Access,
        domain: MemoryDomain,
    },
    SetReg {
        reg: u32,
        value: u32,
    },
    Emit(u32),
    Flush,
}

/// CPU-backed resource. The backing vector doubles as "device memory" so tests
/// can read back what the engines wrote.
pub struct DummyResource {
    storage: RefCell<Vec<u8>>,
    va: u64,
}

struct DummyMapping<'a>(RefMut<'a, Vec<u8>>);

impl MappedRegion for DummyMapping<'_> {
    fn as_slice(&self) -> &[u8] {
        &self.0
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl GpuResource for DummyResource {
    fn size(&self) -> usize {
        self.storage.borrow().len()
    }

    fn virtual_address(&self) -> u64 {
        self.va
    }

    fn map(&self) -> DeviceResult<Box<dyn MappedRegion + '_>> {
        Ok(Box::new(DummyMapping(self.storage.borrow_mut())))
    }
}

/// Allocator double. An optional byte budget lets tests provoke
/// out-of-memory failures deterministically.
pub struct DummyBackend {
    next_va: Cell<u64>,
    budget: Cell<Option<usize>>,
}

impl DummyBackend {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            next_va: Cell::new(0x10_0000),
            budget: Cell::new(None),
        })
    }

    pub fn with_budget(budget: usize) -> Rc<Self> {
        let backend = Self::new();
        backend.budget.set(Some(budget));
        backend
    }

    pub fn set_budget(&self, budget: Option<usize>) {
        self.budget.set(budget);
    }
}

impl super::ResourceBackend for DummyBackend {
    fn create_resource(
        &self,
        size: usize,
        _domain: MemoryDomain,
    ) -> DeviceResult<Rc<dyn GpuResource>> {
        if let Some(budget) = self.budget.get() {
            if size > budget {
                return Err(DeviceError::OutOfMemory);
            }
            self.budget.set(Some(budget - size));
        }

        let va = self.next_va.get();
        self.next_va.set(va + crate::align(size as u32, 4096) as u64);

        Ok(Rc::new(DummyResource {
            storage: RefCell::new(vec![0xab; size]),
            va,
        }))
    }
}

/// Shared recording of everything a [`DummyStream`] saw, inspectable by tests
/// after the stream has been moved into an engine.
pub type StreamLog = Rc<RefCell<Vec<StreamOp>>>;

pub struct DummyStream {
    log: StreamLog,
    emitted: usize,
    relocations: u32,
    fences: u64,
    timeout: bool,
}

impl DummyStream {
    pub fn new() -> (Self, StreamLog) {
        let log: StreamLog = Rc::new(RefCell::new(Vec::new()));
        (
            Self {
                log: Rc::clone(&log),
                emitted: 0,
                relocations: 0,
                fences: 0,
                timeout: false,
            },
            log,
        )
    }

    /// Makes every subsequent `wait` report a timeout.
    pub fn fail_waits(&mut self) {
        self.timeout = true;
    }
}

impl CommandStream for DummyStream {
    fn add_buffer(
        &mut self,
        resource: &Rc<dyn GpuResource>,
        access: Access,
        domain: MemoryDomain,
    ) -> RelocationId {
        self.log.borrow_mut().push(StreamOp::AddBuffer {
            va: resource.virtual_address(),
            size: resource.size(),
            access,
            domain,
        });
        let id = RelocationId(self.relocations);
        self.relocations += 1;
        id
    }

    fn set_reg(&mut self, reg: u32, value: u32) {
        self.log.borrow_mut().push(StreamOp::SetReg { reg, value });
        self.emitted += 2;
    }

    fn emit(&mut self, dword: u32) {
        self.log.borrow_mut().push(StreamOp::Emit(dword));
        self.emitted += 1;
    }

    fn num_emitted(&self) -> usize {
        self.emitted
    }

    fn flush(&mut self, _flags: FlushFlags) -> DeviceResult<Fence> {
        self.log.borrow_mut().push(StreamOp::Flush);
        self.emitted = 0;
        self.fences += 1;
        Ok(Fence(self.fences))
    }

    fn wait(&self, _fence: &Fence, _timeout_ns: u64) -> DeviceResult<()> {
        if self.timeout {
            Err(DeviceError::Timeout)
        } else {
            Ok(())
        }
    }
}

/// Collects the dwords emitted between the last two `Flush` markers, including
/// trailing unflushed dwords when no flush followed them.
pub fn emitted_dwords(log: &StreamLog) -> Vec<u32> {
    log.borrow()
        .iter()
        .filter_map(|op| match op {
            StreamOp::Emit(dword) => Some(*dword),
            _ => None,
        })
        .collect()
}
