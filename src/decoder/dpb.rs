// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference picture store sizing.
//!
//! The engine addresses the DPB with offsets it computes from the same
//! geometry, so these formulas must round up exactly as the firmware expects;
//! an undersized store corrupts adjacent allocations.

use crate::align;
use crate::protocol::StreamType;
use crate::Resolution;

/// The MPEG-2 engine always assumes this many reference frames, whatever the
/// caller requests.
pub const NUM_MPEG2_REFS: u32 = 6;
/// Upper bound on H.264 reference frames the engine tracks.
pub const NUM_H264_REFS: u32 = 17;
/// Minimum reference frames the VC-1 firmware assumes.
pub const NUM_VC1_REFS: u32 = 5;

/// Aligned footprint of a single decoded frame (luma + chroma).
pub fn image_size(resolution: Resolution) -> u32 {
    let aligned = resolution.mb_aligned();
    let mut size = align(aligned.width, 32) * aligned.height;
    size += size / 2;
    align(size, 1024)
}

/// H.264 max decoded picture buffer size per level, in macroblocks.
fn h264_level_dpb_mbs(level: u32) -> u32 {
    match level {
        30 => 8100,
        31 => 18000,
        32 => 20480,
        41 => 32768,
        42 => 34816,
        50 => 110400,
        _ => 184320,
    }
}

/// Computes the size of the reference picture store for one session.
///
/// `max_references` is the caller's request; the picture currently being
/// reconstructed is accounted for here. Pure and computed once at open time;
/// a geometry change requires a new session.
pub fn dpb_size(
    stream_type: StreamType,
    resolution: Resolution,
    level: u32,
    max_references: u32,
) -> u32 {
    // One more for the currently decoded picture.
    let mut max_references = max_references + 1;

    let image_size = image_size(resolution);
    let width_in_mb = resolution.width_in_mbs();
    let height_in_mb = align(resolution.height_in_mbs(), 2);

    match stream_type {
        StreamType::H264 | StreamType::H264Perf => {
            let fs_in_mb = width_in_mb * height_in_mb;
            let num_dpb_buffer = h264_level_dpb_mbs(level) / fs_in_mb + 1;
            max_references = max_references.max(num_dpb_buffer.min(NUM_H264_REFS));

            let mut size = image_size * max_references;
            if stream_type != StreamType::H264Perf {
                // Per-reference macroblock context plus the IT surface.
                size += max_references * align(width_in_mb * height_in_mb * 192, 256);
                size += align(width_in_mb * height_in_mb * 32, 256);
            }
            size
        }

        StreamType::Vc1 => {
            // The firmware assumes a minimum number of references.
            max_references = max_references.max(NUM_VC1_REFS);

            let mut size = image_size * max_references;
            // Macroblock context buffer.
            size += width_in_mb * height_in_mb * 128;
            // IT surface buffer.
            size += width_in_mb * 64;
            // Deblocking surface buffer.
            size += width_in_mb * 128;
            // Bit-plane buffer.
            size += align(width_in_mb.max(height_in_mb) * 7 * 16, 64);
            size
        }

        StreamType::Mpeg2 => image_size * NUM_MPEG2_REFS,

        StreamType::Mpeg4 => {
            let mut size = image_size * max_references;
            // Codebook and IT surface buffers.
            size += width_in_mb * height_in_mb * 64;
            size += align(width_in_mb * height_in_mb * 32, 64);
            size.max(30 * 1024 * 1024)
        }

        // No inter-frame prediction.
        StreamType::MotionJpeg => 0,
    }
}
