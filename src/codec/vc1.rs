// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VC-1 picture parameters and their firmware encoding.

use std::io;
use std::io::Write;

use byteorder::LittleEndian;
use byteorder::WriteBytesExt;

const PROFILE_SIMPLE: u32 = 0;
const PROFILE_MAIN: u32 = 1;
const PROFILE_ADVANCED: u32 = 2;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Vc1Profile {
    #[default]
    Simple,
    Main,
    Advanced,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PicStructure {
    #[default]
    Frame,
    TopField,
    BottomField,
}

/// Caller-supplied per-frame picture description.
///
/// The sequence- and entry-point-layer flags are only meaningful for the
/// advanced profile; simple/main leave them at their defaults.
#[derive(Clone, Debug, Default)]
pub struct Vc1PictureDesc {
    pub profile: Vc1Profile,
    pub level: u32,
    pub pic_structure: PicStructure,

    pub postproc_flag: bool,
    pub pulldown: bool,
    pub interlace: bool,
    pub tfcntr_flag: bool,
    pub finterp_flag: bool,
    pub psf: bool,

    pub range_mapy_flag: bool,
    pub range_mapy: u8,
    pub range_mapuv_flag: bool,
    pub range_mapuv: u8,
    pub multires: bool,
    pub max_b_frames: u8,
    pub overlap: bool,
    pub quantizer: u8,
    pub panscan_flag: bool,
    pub refdist_flag: bool,
    pub loop_filter: bool,
    pub fastuvmc: bool,
    pub extended_mv: bool,
    pub dquant: u8,
    pub vstransform: bool,
}

/// Fixed-layout VC-1 parameter block inside the decode message.
#[derive(Clone, Debug, Default)]
pub struct Vc1DecodeParams {
    pub profile: u32,
    pub level: u32,
    pub sps_info_flags: u32,
    pub pps_info_flags: u32,
    pub pic_structure: u32,
    pub chroma_format: u32,
}

impl Vc1DecodeParams {
    pub const ENCODED_SIZE: usize = 24;

    pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.profile)?;
        w.write_u32::<LittleEndian>(self.level)?;
        w.write_u32::<LittleEndian>(self.sps_info_flags)?;
        w.write_u32::<LittleEndian>(self.pps_info_flags)?;
        w.write_u32::<LittleEndian>(self.pic_structure)?;
        w.write_u32::<LittleEndian>(self.chroma_format)
    }
}

/// Translates a picture description into the firmware parameter block.
pub fn decode_params(desc: &Vc1PictureDesc) -> Vc1DecodeParams {
    let mut sps_info_flags = 0;
    sps_info_flags |= (desc.postproc_flag as u32) << 7;
    sps_info_flags |= (desc.pulldown as u32) << 6;
    sps_info_flags |= (desc.interlace as u32) << 5;
    sps_info_flags |= (desc.tfcntr_flag as u32) << 4;
    sps_info_flags |= (desc.finterp_flag as u32) << 3;
    sps_info_flags |= (desc.psf as u32) << 1;

    let mut pps_info_flags = 0;
    pps_info_flags |= (desc.range_mapy_flag as u32) << 31;
    pps_info_flags |= ((desc.range_mapy & 0x7) as u32) << 28;
    pps_info_flags |= (desc.range_mapuv_flag as u32) << 27;
    pps_info_flags |= ((desc.range_mapuv & 0x7) as u32) << 24;
    pps_info_flags |= (desc.multires as u32) << 21;
    pps_info_flags |= ((desc.max_b_frames & 0x7) as u32) << 16;
    pps_info_flags |= (desc.overlap as u32) << 11;
    pps_info_flags |= ((desc.quantizer & 0x3) as u32) << 9;
    pps_info_flags |= (desc.panscan_flag as u32) << 7;
    pps_info_flags |= (desc.refdist_flag as u32) << 6;
    pps_info_flags |= (desc.loop_filter as u32) << 5;
    pps_info_flags |= (desc.fastuvmc as u32) << 4;
    pps_info_flags |= (desc.extended_mv as u32) << 3;
    pps_info_flags |= ((desc.dquant & 0x3) as u32) << 1;
    pps_info_flags |= desc.vstransform as u32;

    Vc1DecodeParams {
        profile: match desc.profile {
            Vc1Profile::Simple => PROFILE_SIMPLE,
            Vc1Profile::Main => PROFILE_MAIN,
            Vc1Profile::Advanced => PROFILE_ADVANCED,
        },
        level: desc.level,
        sps_info_flags,
        pps_info_flags,
        pic_structure: match desc.pic_structure {
            PicStructure::Frame => 3,
            PicStructure::TopField => 1,
            PicStructure::BottomField => 2,
        },
        // The engine only decodes 4:2:0 VC-1.
        chroma_format: 1,
    }
}
