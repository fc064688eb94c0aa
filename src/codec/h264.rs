// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.264 picture parameters and their firmware encoding.

use std::io;
use std::io::Write;

use byteorder::LittleEndian;
use byteorder::WriteBytesExt;

/// Wire values for the firmware's H.264 profile field.
const PROFILE_BASELINE: u32 = 0;
const PROFILE_MAIN: u32 = 1;
const PROFILE_HIGH: u32 = 2;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum H264Profile {
    #[default]
    Baseline,
    Main,
    High,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ChromaFormat {
    Monochrome,
    #[default]
    Yuv420,
    Yuv422,
    Yuv444,
}

impl ChromaFormat {
    fn to_wire(self) -> u8 {
        match self {
            ChromaFormat::Monochrome => 0,
            ChromaFormat::Yuv420 => 1,
            ChromaFormat::Yuv422 => 2,
            ChromaFormat::Yuv444 => 3,
        }
    }
}

/// Sequence parameter set fields the engine consumes.
#[derive(Clone, Debug, Default)]
pub struct H264SpsInfo {
    pub direct_8x8_inference_flag: bool,
    pub mb_adaptive_frame_field_flag: bool,
    pub frame_mbs_only_flag: bool,
    pub delta_pic_order_always_zero_flag: bool,
    pub chroma_format: ChromaFormat,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub log2_max_frame_num_minus4: u8,
    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
}

/// Picture parameter set fields the engine consumes.
#[derive(Clone, Debug)]
pub struct H264PpsInfo {
    pub transform_8x8_mode_flag: bool,
    pub redundant_pic_cnt_present_flag: bool,
    pub constrained_intra_pred_flag: bool,
    pub deblocking_filter_control_present_flag: bool,
    pub weighted_bipred_idc: u8,
    pub weighted_pred_flag: bool,
    pub bottom_field_pic_order_in_frame_present_flag: bool,
    pub entropy_coding_mode_flag: bool,
    pub num_slice_groups_minus1: u8,
    pub slice_group_map_type: u8,
    pub slice_group_change_rate_minus1: u32,
    pub pic_init_qp_minus26: i8,
    pub chroma_qp_index_offset: i8,
    pub second_chroma_qp_index_offset: i8,
    pub scaling_list_4x4: [[u8; 16]; 6],
    pub scaling_list_8x8: [[u8; 64]; 2],
}

impl Default for H264PpsInfo {
    fn default() -> Self {
        Self {
            transform_8x8_mode_flag: false,
            redundant_pic_cnt_present_flag: false,
            constrained_intra_pred_flag: false,
            deblocking_filter_control_present_flag: false,
            weighted_bipred_idc: 0,
            weighted_pred_flag: false,
            bottom_field_pic_order_in_frame_present_flag: false,
            entropy_coding_mode_flag: false,
            num_slice_groups_minus1: 0,
            slice_group_map_type: 0,
            slice_group_change_rate_minus1: 0,
            pic_init_qp_minus26: 0,
            chroma_qp_index_offset: 0,
            second_chroma_qp_index_offset: 0,
            // Flat scaling lists.
            scaling_list_4x4: [[16; 16]; 6],
            scaling_list_8x8: [[16; 64]; 2],
        }
    }
}

/// Caller-supplied per-frame picture description.
#[derive(Clone, Debug)]
pub struct H264PictureDesc {
    pub profile: H264Profile,
    pub level_idc: u8,
    pub sps: H264SpsInfo,
    pub pps: H264PpsInfo,
    pub num_ref_frames: u8,
    pub num_ref_idx_l0_active_minus1: u8,
    pub num_ref_idx_l1_active_minus1: u8,
    pub frame_num: u32,
    pub field_order_cnt: [i32; 2],
    /// `frame_num` of each reference surface, parallel to `ref_frame_list`.
    pub frame_num_list: [u32; 16],
    pub field_order_cnt_list: [[i32; 2]; 16],
    /// DPB indices of the reference surfaces; 0xff marks an unused entry.
    pub ref_frame_list: [u8; 16],
}

impl Default for H264PictureDesc {
    fn default() -> Self {
        Self {
            profile: H264Profile::default(),
            level_idc: 31,
            sps: Default::default(),
            pps: Default::default(),
            num_ref_frames: 1,
            num_ref_idx_l0_active_minus1: 0,
            num_ref_idx_l1_active_minus1: 0,
            frame_num: 0,
            field_order_cnt: [0; 2],
            frame_num_list: [0; 16],
            field_order_cnt_list: [[0; 2]; 16],
            ref_frame_list: [0xff; 16],
        }
    }
}

/// Fixed-layout H.264 parameter block inside the decode message.
#[derive(Clone, Debug)]
pub struct H264DecodeParams {
    pub profile: u32,
    pub level: u32,
    pub sps_info_flags: u32,
    pub pps_info_flags: u32,
    pub chroma_format: u8,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub log2_max_frame_num_minus4: u8,
    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub num_ref_frames: u8,
    pub pic_init_qp_minus26: i8,
    pub chroma_qp_index_offset: i8,
    pub second_chroma_qp_index_offset: i8,
    pub num_slice_groups_minus1: u8,
    pub slice_group_map_type: u8,
    pub num_ref_idx_l0_active_minus1: u8,
    pub num_ref_idx_l1_active_minus1: u8,
    pub slice_group_change_rate_minus1: u32,
    pub scaling_list_4x4: [[u8; 16]; 6],
    pub scaling_list_8x8: [[u8; 64]; 2],
    pub frame_num: u32,
    pub frame_num_list: [u32; 16],
    pub curr_field_order_cnt: [i32; 2],
    pub field_order_cnt_list: [[i32; 2]; 16],
    pub decoded_pic_idx: u32,
    pub curr_pic_ref_frame_num: u32,
    pub ref_frame_list: [u8; 16],
}

impl Default for H264DecodeParams {
    fn default() -> Self {
        Self {
            profile: PROFILE_BASELINE,
            level: 0,
            sps_info_flags: 0,
            pps_info_flags: 0,
            chroma_format: 0,
            bit_depth_luma_minus8: 0,
            bit_depth_chroma_minus8: 0,
            log2_max_frame_num_minus4: 0,
            pic_order_cnt_type: 0,
            log2_max_pic_order_cnt_lsb_minus4: 0,
            num_ref_frames: 0,
            pic_init_qp_minus26: 0,
            chroma_qp_index_offset: 0,
            second_chroma_qp_index_offset: 0,
            num_slice_groups_minus1: 0,
            slice_group_map_type: 0,
            num_ref_idx_l0_active_minus1: 0,
            num_ref_idx_l1_active_minus1: 0,
            slice_group_change_rate_minus1: 0,
            scaling_list_4x4: [[0; 16]; 6],
            scaling_list_8x8: [[0; 64]; 2],
            frame_num: 0,
            frame_num_list: [0; 16],
            curr_field_order_cnt: [0; 2],
            field_order_cnt_list: [[0; 2]; 16],
            decoded_pic_idx: 0,
            curr_pic_ref_frame_num: 0,
            ref_frame_list: [0xff; 16],
        }
    }
}

impl H264DecodeParams {
    pub const ENCODED_SIZE: usize = 488;

    pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.profile)?;
        w.write_u32::<LittleEndian>(self.level)?;
        w.write_u32::<LittleEndian>(self.sps_info_flags)?;
        w.write_u32::<LittleEndian>(self.pps_info_flags)?;
        w.write_u8(self.chroma_format)?;
        w.write_u8(self.bit_depth_luma_minus8)?;
        w.write_u8(self.bit_depth_chroma_minus8)?;
        w.write_u8(self.log2_max_frame_num_minus4)?;
        w.write_u8(self.pic_order_cnt_type)?;
        w.write_u8(self.log2_max_pic_order_cnt_lsb_minus4)?;
        w.write_u8(self.num_ref_frames)?;
        w.write_u8(0)?;
        w.write_i8(self.pic_init_qp_minus26)?;
        w.write_i8(self.chroma_qp_index_offset)?;
        w.write_i8(self.second_chroma_qp_index_offset)?;
        w.write_u8(self.num_slice_groups_minus1)?;
        w.write_u8(self.slice_group_map_type)?;
        w.write_u8(self.num_ref_idx_l0_active_minus1)?;
        w.write_u8(self.num_ref_idx_l1_active_minus1)?;
        w.write_u8(0)?;
        w.write_u32::<LittleEndian>(self.slice_group_change_rate_minus1)?;
        for list in &self.scaling_list_4x4 {
            w.write_all(list)?;
        }
        for list in &self.scaling_list_8x8 {
            w.write_all(list)?;
        }
        w.write_u32::<LittleEndian>(self.frame_num)?;
        for &num in &self.frame_num_list {
            w.write_u32::<LittleEndian>(num)?;
        }
        for &poc in &self.curr_field_order_cnt {
            w.write_i32::<LittleEndian>(poc)?;
        }
        for pair in &self.field_order_cnt_list {
            w.write_i32::<LittleEndian>(pair[0])?;
            w.write_i32::<LittleEndian>(pair[1])?;
        }
        w.write_u32::<LittleEndian>(self.decoded_pic_idx)?;
        w.write_u32::<LittleEndian>(self.curr_pic_ref_frame_num)?;
        w.write_all(&self.ref_frame_list)
    }
}

/// Translates a picture description into the firmware parameter block.
///
/// `decoded_pic_idx` is the DPB index assigned to the picture being
/// reconstructed.
pub fn decode_params(desc: &H264PictureDesc, decoded_pic_idx: u32) -> H264DecodeParams {
    let mut sps_info_flags = 0;
    sps_info_flags |= (desc.sps.direct_8x8_inference_flag as u32) << 0;
    sps_info_flags |= (desc.sps.mb_adaptive_frame_field_flag as u32) << 1;
    sps_info_flags |= (desc.sps.frame_mbs_only_flag as u32) << 2;
    sps_info_flags |= (desc.sps.delta_pic_order_always_zero_flag as u32) << 3;

    let mut pps_info_flags = 0;
    pps_info_flags |= (desc.pps.transform_8x8_mode_flag as u32) << 0;
    pps_info_flags |= (desc.pps.redundant_pic_cnt_present_flag as u32) << 1;
    pps_info_flags |= (desc.pps.constrained_intra_pred_flag as u32) << 2;
    pps_info_flags |= (desc.pps.deblocking_filter_control_present_flag as u32) << 3;
    pps_info_flags |= (desc.pps.weighted_bipred_idc as u32) << 4;
    pps_info_flags |= (desc.pps.weighted_pred_flag as u32) << 6;
    pps_info_flags |= (desc.pps.bottom_field_pic_order_in_frame_present_flag as u32) << 7;
    pps_info_flags |= (desc.pps.entropy_coding_mode_flag as u32) << 8;

    let curr_pic_ref_frame_num = desc
        .ref_frame_list
        .iter()
        .filter(|&&idx| idx != 0xff)
        .count() as u32;

    H264DecodeParams {
        profile: match desc.profile {
            H264Profile::Baseline => PROFILE_BASELINE,
            H264Profile::Main => PROFILE_MAIN,
            H264Profile::High => PROFILE_HIGH,
        },
        level: desc.level_idc as u32,
        sps_info_flags,
        pps_info_flags,
        chroma_format: desc.sps.chroma_format.to_wire(),
        bit_depth_luma_minus8: desc.sps.bit_depth_luma_minus8,
        bit_depth_chroma_minus8: desc.sps.bit_depth_chroma_minus8,
        log2_max_frame_num_minus4: desc.sps.log2_max_frame_num_minus4,
        pic_order_cnt_type: desc.sps.pic_order_cnt_type,
        log2_max_pic_order_cnt_lsb_minus4: desc.sps.log2_max_pic_order_cnt_lsb_minus4,
        num_ref_frames: desc.num_ref_frames,
        pic_init_qp_minus26: desc.pps.pic_init_qp_minus26,
        chroma_qp_index_offset: desc.pps.chroma_qp_index_offset,
        second_chroma_qp_index_offset: desc.pps.second_chroma_qp_index_offset,
        num_slice_groups_minus1: desc.pps.num_slice_groups_minus1,
        slice_group_map_type: desc.pps.slice_group_map_type,
        num_ref_idx_l0_active_minus1: desc.num_ref_idx_l0_active_minus1,
        num_ref_idx_l1_active_minus1: desc.num_ref_idx_l1_active_minus1,
        slice_group_change_rate_minus1: desc.pps.slice_group_change_rate_minus1,
        scaling_list_4x4: desc.pps.scaling_list_4x4,
        scaling_list_8x8: desc.pps.scaling_list_8x8,
        frame_num: desc.frame_num,
        frame_num_list: desc.frame_num_list,
        curr_field_order_cnt: desc.field_order_cnt,
        field_order_cnt_list: desc.field_order_cnt_list,
        decoded_pic_idx,
        curr_pic_ref_frame_num,
        ref_frame_list: desc.ref_frame_list,
    }
}

/// Bytes of IT scaling data submitted alongside an H.264 frame.
pub const IT_TABLE_SIZE: usize = 96 + 128;

/// Copies the scaling matrices into the IT scaling region, which the engine
/// reads separately from the message.
pub fn write_it_scaling(params: &H264DecodeParams, it: &mut [u8]) {
    for (i, list) in params.scaling_list_4x4.iter().enumerate() {
        it[i * 16..(i + 1) * 16].copy_from_slice(list);
    }
    for (i, list) in params.scaling_list_8x8.iter().enumerate() {
        it[96 + i * 64..96 + (i + 1) * 64].copy_from_slice(list);
    }
}
