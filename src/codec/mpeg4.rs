// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! MPEG-4 part 2 picture parameters and their firmware encoding.

use std::io;
use std::io::Write;

use byteorder::LittleEndian;
use byteorder::WriteBytesExt;

use crate::Resolution;

/// Caller-supplied per-frame picture description.
#[derive(Clone, Debug)]
pub struct Mpeg4PictureDesc {
    pub ref_pic_idx: [u32; 2],
    pub profile_and_level_indication: u32,
    pub video_object_layer_verid: u32,
    pub video_object_layer_shape: u32,
    pub vol_resolution: Resolution,
    pub vop_time_increment_resolution: u32,

    pub short_video_header: bool,
    pub interlaced: bool,
    pub quarter_sample: bool,
    pub complexity_estimation_disable: bool,
    pub resync_marker_disable: bool,
    pub newpred_enable: bool,
    pub reduced_resolution_vop_enable: bool,
    pub scalability: bool,
    pub is_object_layer_identifier: bool,
    pub fixed_vop_rate: bool,

    pub quant_type: u8,
    pub intra_matrix: Option<[u8; 64]>,
    pub non_intra_matrix: Option<[u8; 64]>,
}

impl Default for Mpeg4PictureDesc {
    fn default() -> Self {
        Self {
            ref_pic_idx: [0; 2],
            profile_and_level_indication: 0,
            video_object_layer_verid: 1,
            video_object_layer_shape: 0,
            vol_resolution: Resolution::default(),
            vop_time_increment_resolution: 0,
            short_video_header: false,
            interlaced: false,
            quarter_sample: false,
            complexity_estimation_disable: true,
            resync_marker_disable: false,
            newpred_enable: false,
            reduced_resolution_vop_enable: false,
            scalability: false,
            is_object_layer_identifier: false,
            fixed_vop_rate: false,
            quant_type: 0,
            intra_matrix: None,
            non_intra_matrix: None,
        }
    }
}

/// Fixed-layout MPEG-4 parameter block inside the decode message.
#[derive(Clone, Debug)]
pub struct Mpeg4DecodeParams {
    pub decoded_pic_idx: u32,
    pub ref_pic_idx: [u32; 2],
    pub variant_type: u32,
    pub profile_and_level_indication: u32,
    pub video_object_layer_verid: u32,
    pub video_object_layer_shape: u32,
    pub video_object_layer_width: u32,
    pub video_object_layer_height: u32,
    pub vop_time_increment_resolution: u32,
    pub flags: u32,
    pub quant_type: u8,
    pub intra_quant_mat: [u8; 64],
    pub nonintra_quant_mat: [u8; 64],
}

impl Default for Mpeg4DecodeParams {
    fn default() -> Self {
        Self {
            decoded_pic_idx: 0,
            ref_pic_idx: [0; 2],
            variant_type: 0,
            profile_and_level_indication: 0,
            video_object_layer_verid: 0,
            video_object_layer_shape: 0,
            video_object_layer_width: 0,
            video_object_layer_height: 0,
            vop_time_increment_resolution: 0,
            flags: 0,
            quant_type: 0,
            intra_quant_mat: [0; 64],
            nonintra_quant_mat: [0; 64],
        }
    }
}

impl Mpeg4DecodeParams {
    pub const ENCODED_SIZE: usize = 176;

    pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.decoded_pic_idx)?;
        w.write_u32::<LittleEndian>(self.ref_pic_idx[0])?;
        w.write_u32::<LittleEndian>(self.ref_pic_idx[1])?;
        w.write_u32::<LittleEndian>(self.variant_type)?;
        w.write_u32::<LittleEndian>(self.profile_and_level_indication)?;
        w.write_u32::<LittleEndian>(self.video_object_layer_verid)?;
        w.write_u32::<LittleEndian>(self.video_object_layer_shape)?;
        w.write_u32::<LittleEndian>(self.video_object_layer_width)?;
        w.write_u32::<LittleEndian>(self.video_object_layer_height)?;
        w.write_u32::<LittleEndian>(self.vop_time_increment_resolution)?;
        w.write_u32::<LittleEndian>(self.flags)?;
        w.write_u8(self.quant_type)?;
        w.write_all(&[0; 3])?;
        w.write_all(&self.intra_quant_mat)?;
        w.write_all(&self.nonintra_quant_mat)
    }
}

/// Translates a picture description into the firmware parameter block.
pub fn decode_params(desc: &Mpeg4PictureDesc, decoded_pic_idx: u32) -> Mpeg4DecodeParams {
    let mut flags = 0;
    flags |= (desc.short_video_header as u32) << 0;
    flags |= (desc.interlaced as u32) << 2;
    flags |= (desc.intra_matrix.is_some() as u32) << 3;
    flags |= (desc.non_intra_matrix.is_some() as u32) << 4;
    flags |= (desc.quarter_sample as u32) << 5;
    flags |= (desc.complexity_estimation_disable as u32) << 6;
    flags |= (desc.resync_marker_disable as u32) << 7;
    flags |= (desc.newpred_enable as u32) << 10;
    flags |= (desc.reduced_resolution_vop_enable as u32) << 11;
    flags |= (desc.scalability as u32) << 12;
    flags |= (desc.is_object_layer_identifier as u32) << 13;
    flags |= (desc.fixed_vop_rate as u32) << 14;

    Mpeg4DecodeParams {
        decoded_pic_idx,
        ref_pic_idx: desc.ref_pic_idx,
        variant_type: 0,
        profile_and_level_indication: desc.profile_and_level_indication,
        video_object_layer_verid: desc.video_object_layer_verid,
        video_object_layer_shape: desc.video_object_layer_shape,
        video_object_layer_width: desc.vol_resolution.width,
        video_object_layer_height: desc.vol_resolution.height,
        vop_time_increment_resolution: desc.vop_time_increment_resolution,
        flags,
        quant_type: desc.quant_type,
        intra_quant_mat: desc.intra_matrix.unwrap_or([0; 64]),
        nonintra_quant_mat: desc.non_intra_matrix.unwrap_or([0; 64]),
    }
}
