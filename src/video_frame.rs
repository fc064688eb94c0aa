// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Planar video surfaces as consumed by the engines.
//!
//! Surface allocation and plane layout math live in the embedding stack; the
//! engines only read the metadata to fill protocol fields (pitches, tiling
//! configuration, plane addresses) and to tag a surface with the frame that
//! last targeted it.

use std::rc::Rc;

use crate::device::GpuResource;
use crate::session::StreamHandle;
use crate::Resolution;

/// Tiling layout of one plane.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TileMode {
    Linear,
    Tiled1D,
    Tiled2D,
}

/// Per-plane layout metadata, filled in by the surface allocator.
#[derive(Copy, Clone, Debug)]
pub struct PlaneLayout {
    /// Row pitch in bytes.
    pub pitch: u32,
    /// Byte offset of the plane within its resource.
    pub offset: u64,
    pub tile_mode: TileMode,
    /// Bank geometry, only meaningful for 2D tiling.
    pub bank_width: u32,
    pub bank_height: u32,
    pub num_banks: u32,
    pub macro_tile_aspect: u32,
}

impl PlaneLayout {
    /// Packs the bank geometry into the tile-config bitfield the firmware
    /// expects alongside each destination surface.
    pub fn tile_config_word(&self) -> u32 {
        let mode = match self.tile_mode {
            TileMode::Linear => 0,
            TileMode::Tiled1D => 1,
            TileMode::Tiled2D => 2,
        };
        mode | (self.bank_width.trailing_zeros() << 3)
            | (self.bank_height.trailing_zeros() << 6)
            | (self.macro_tile_aspect.trailing_zeros() << 9)
            | (self.num_banks.trailing_zeros() << 12)
    }
}

/// A decode target or encode source picture.
///
/// The association tag records which session/frame last wrote the surface.
/// It is deliberately last-writer-wins: a caller reusing one surface across
/// sessions simply overwrites the tag, there is no reference counting.
pub trait VideoSurface {
    fn resolution(&self) -> Resolution;
    fn interlaced(&self) -> bool;

    fn num_planes(&self) -> usize;
    fn plane_resource(&self, plane: usize) -> &Rc<dyn GpuResource>;
    fn plane_layout(&self, plane: usize) -> PlaneLayout;

    fn associated_frame(&self) -> Option<(StreamHandle, u32)>;
    fn associate_frame(&self, session: StreamHandle, frame: u32);
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::device::dummy::DummyBackend;
    use crate::device::MemoryDomain;
    use crate::device::ResourceBackend;

    /// NV12 surface backed by dummy resources.
    pub(crate) struct FakeSurface {
        resolution: Resolution,
        planes: Vec<(Rc<dyn GpuResource>, PlaneLayout)>,
        assoc: Cell<Option<(StreamHandle, u32)>>,
    }

    impl FakeSurface {
        pub(crate) fn nv12(backend: &DummyBackend, resolution: Resolution) -> Self {
            let pitch = crate::align(resolution.width, 256);
            let luma_size = (pitch * resolution.height) as usize;
            let layout = |offset| PlaneLayout {
                pitch,
                offset,
                tile_mode: TileMode::Linear,
                bank_width: 1,
                bank_height: 1,
                num_banks: 8,
                macro_tile_aspect: 1,
            };

            let planes = vec![
                (
                    backend
                        .create_resource(luma_size, MemoryDomain::Device)
                        .unwrap(),
                    layout(0),
                ),
                (
                    backend
                        .create_resource(luma_size / 2, MemoryDomain::Device)
                        .unwrap(),
                    layout(0),
                ),
            ];

            Self {
                resolution,
                planes,
                assoc: Cell::new(None),
            }
        }
    }

    impl VideoSurface for FakeSurface {
        fn resolution(&self) -> Resolution {
            self.resolution
        }

        fn interlaced(&self) -> bool {
            false
        }

        fn num_planes(&self) -> usize {
            self.planes.len()
        }

        fn plane_resource(&self, plane: usize) -> &Rc<dyn GpuResource> {
            &self.planes[plane].0
        }

        fn plane_layout(&self, plane: usize) -> PlaneLayout {
            self.planes[plane].1
        }

        fn associated_frame(&self) -> Option<(StreamHandle, u32)> {
            self.assoc.get()
        }

        fn associate_frame(&self, session: StreamHandle, frame: u32) {
            self.assoc.set(Some((session, frame)));
        }
    }

    #[test]
    fn association_is_last_writer_wins() {
        let backend = DummyBackend::new();
        let surface = FakeSurface::nv12(&backend, Resolution::from((64, 64)));

        surface.associate_frame(StreamHandle(1), 3);
        surface.associate_frame(StreamHandle(2), 7);
        assert_eq!(surface.associated_frame(), Some((StreamHandle(2), 7)));
    }
}
