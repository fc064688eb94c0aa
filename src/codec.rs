// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-codec picture descriptors and their translation into the fixed-layout
//! parameter blocks the firmware reads out of the decode message.

pub mod h264;
pub mod mjpeg;
pub mod mpeg2;
pub mod mpeg4;
pub mod vc1;

use std::io;
use std::io::Write;

/// Caller-supplied picture parameters for one frame. Read-only for the
/// duration of one begin/feed/end cycle.
pub enum PictureDesc {
    H264(h264::H264PictureDesc),
    Vc1(vc1::Vc1PictureDesc),
    Mpeg2(mpeg2::Mpeg2PictureDesc),
    Mpeg4(mpeg4::Mpeg4PictureDesc),
    MotionJpeg(mjpeg::MjpegPictureDesc),
}

/// Codec parameter union embedded in the decode message. Always encoded as
/// [`CodecParams::ENCODED_SIZE`] bytes, zero-padded past the variant's fields.
#[derive(Clone)]
pub enum CodecParams {
    H264(Box<h264::H264DecodeParams>),
    Vc1(Box<vc1::Vc1DecodeParams>),
    Mpeg2(Box<mpeg2::Mpeg2DecodeParams>),
    Mpeg4(Box<mpeg4::Mpeg4DecodeParams>),
    /// Motion-JPEG carries everything in the synthesized bitstream.
    MotionJpeg,
}

impl std::fmt::Debug for CodecParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CodecParams::H264(_) => "H264",
            CodecParams::Vc1(_) => "Vc1",
            CodecParams::Mpeg2(_) => "Mpeg2",
            CodecParams::Mpeg4(_) => "Mpeg4",
            CodecParams::MotionJpeg => "MotionJpeg",
        };
        f.write_str(name)
    }
}

impl CodecParams {
    /// Size of the union region in the decode message.
    pub const ENCODED_SIZE: usize = 512;

    pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        let written = match self {
            CodecParams::H264(params) => {
                params.write_to(w)?;
                h264::H264DecodeParams::ENCODED_SIZE
            }
            CodecParams::Vc1(params) => {
                params.write_to(w)?;
                vc1::Vc1DecodeParams::ENCODED_SIZE
            }
            CodecParams::Mpeg2(params) => {
                params.write_to(w)?;
                mpeg2::Mpeg2DecodeParams::ENCODED_SIZE
            }
            CodecParams::Mpeg4(params) => {
                params.write_to(w)?;
                mpeg4::Mpeg4DecodeParams::ENCODED_SIZE
            }
            CodecParams::MotionJpeg => 0,
        };
        crate::protocol::write_zeros(w, Self::ENCODED_SIZE - written)
    }
}
