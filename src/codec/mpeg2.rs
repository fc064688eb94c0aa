// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! MPEG-1/MPEG-2 picture parameters and their firmware encoding.
//!
//! MPEG-1 content is decoded by the MPEG-2 engine path; the translator maps
//! its fixed coding parameters onto the same block.

use std::io;
use std::io::Write;

use byteorder::LittleEndian;
use byteorder::WriteBytesExt;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Mpeg2PictureCoding {
    #[default]
    Intra,
    Predictive,
    Bidirectional,
}

impl Mpeg2PictureCoding {
    fn to_wire(self) -> u8 {
        match self {
            Mpeg2PictureCoding::Intra => 1,
            Mpeg2PictureCoding::Predictive => 2,
            Mpeg2PictureCoding::Bidirectional => 3,
        }
    }
}

/// Caller-supplied per-frame picture description.
#[derive(Clone, Debug)]
pub struct Mpeg2PictureDesc {
    pub picture_coding_type: Mpeg2PictureCoding,
    /// Forward/backward reference surface indices within the DPB.
    pub ref_pic_idx: [u32; 2],
    /// Quantiser matrices from the sequence headers; `None` keeps the
    /// previously loaded matrix.
    pub intra_matrix: Option<[u8; 64]>,
    pub non_intra_matrix: Option<[u8; 64]>,
    pub profile_and_level_indication: u8,
    pub f_code: [[u8; 2]; 2],
    pub intra_dc_precision: u8,
    pub pic_structure: u8,
    pub top_field_first: bool,
    pub frame_pred_frame_dct: bool,
    pub concealment_motion_vectors: bool,
    pub q_scale_type: bool,
    pub intra_vlc_format: bool,
    pub alternate_scan: bool,
}

impl Default for Mpeg2PictureDesc {
    fn default() -> Self {
        Self {
            picture_coding_type: Default::default(),
            ref_pic_idx: [0; 2],
            intra_matrix: None,
            non_intra_matrix: None,
            profile_and_level_indication: 0,
            f_code: [[15; 2]; 2],
            intra_dc_precision: 0,
            pic_structure: 3,
            top_field_first: false,
            frame_pred_frame_dct: true,
            concealment_motion_vectors: false,
            q_scale_type: false,
            intra_vlc_format: false,
            alternate_scan: false,
        }
    }
}

/// Fixed-layout MPEG-2 parameter block inside the decode message.
#[derive(Clone, Debug)]
pub struct Mpeg2DecodeParams {
    pub decoded_pic_idx: u32,
    pub ref_pic_idx: [u32; 2],
    pub load_intra_quantiser_matrix: u8,
    pub load_nonintra_quantiser_matrix: u8,
    pub intra_quantiser_matrix: [u8; 64],
    pub nonintra_quantiser_matrix: [u8; 64],
    pub profile_and_level_indication: u8,
    pub chroma_format: u8,
    pub pic_coding_type: u8,
    pub f_code: [[u8; 2]; 2],
    pub intra_dc_precision: u8,
    pub pic_structure: u8,
    pub top_field_first: u8,
    pub frame_pred_frame_dct: u8,
    pub concealment_motion_vectors: u8,
    pub q_scale_type: u8,
    pub intra_vlc_format: u8,
    pub alternate_scan: u8,
}

impl Default for Mpeg2DecodeParams {
    fn default() -> Self {
        Self {
            decoded_pic_idx: 0,
            ref_pic_idx: [0; 2],
            load_intra_quantiser_matrix: 0,
            load_nonintra_quantiser_matrix: 0,
            intra_quantiser_matrix: [0; 64],
            nonintra_quantiser_matrix: [0; 64],
            profile_and_level_indication: 0,
            chroma_format: 1,
            pic_coding_type: 0,
            f_code: [[0; 2]; 2],
            intra_dc_precision: 0,
            pic_structure: 0,
            top_field_first: 0,
            frame_pred_frame_dct: 0,
            concealment_motion_vectors: 0,
            q_scale_type: 0,
            intra_vlc_format: 0,
            alternate_scan: 0,
        }
    }
}

impl Mpeg2DecodeParams {
    pub const ENCODED_SIZE: usize = 164;

    pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.decoded_pic_idx)?;
        w.write_u32::<LittleEndian>(self.ref_pic_idx[0])?;
        w.write_u32::<LittleEndian>(self.ref_pic_idx[1])?;
        w.write_u8(self.load_intra_quantiser_matrix)?;
        w.write_u8(self.load_nonintra_quantiser_matrix)?;
        w.write_all(&[0; 2])?;
        w.write_all(&self.intra_quantiser_matrix)?;
        w.write_all(&self.nonintra_quantiser_matrix)?;
        w.write_u8(self.profile_and_level_indication)?;
        w.write_u8(self.chroma_format)?;
        w.write_all(&[0; 2])?;
        w.write_u8(self.pic_coding_type)?;
        w.write_u8(self.f_code[0][0])?;
        w.write_u8(self.f_code[0][1])?;
        w.write_u8(self.f_code[1][0])?;
        w.write_u8(self.f_code[1][1])?;
        w.write_u8(self.intra_dc_precision)?;
        w.write_u8(self.pic_structure)?;
        w.write_u8(self.top_field_first)?;
        w.write_u8(self.frame_pred_frame_dct)?;
        w.write_u8(self.concealment_motion_vectors)?;
        w.write_u8(self.q_scale_type)?;
        w.write_u8(self.intra_vlc_format)?;
        w.write_u8(self.alternate_scan)?;
        w.write_all(&[0; 3])
    }
}

/// Translates a picture description into the firmware parameter block.
pub fn decode_params(desc: &Mpeg2PictureDesc, decoded_pic_idx: u32) -> Mpeg2DecodeParams {
    Mpeg2DecodeParams {
        decoded_pic_idx,
        ref_pic_idx: desc.ref_pic_idx,
        load_intra_quantiser_matrix: desc.intra_matrix.is_some() as u8,
        load_nonintra_quantiser_matrix: desc.non_intra_matrix.is_some() as u8,
        intra_quantiser_matrix: desc.intra_matrix.unwrap_or([0; 64]),
        nonintra_quantiser_matrix: desc.non_intra_matrix.unwrap_or([0; 64]),
        profile_and_level_indication: desc.profile_and_level_indication,
        chroma_format: 1,
        pic_coding_type: desc.picture_coding_type.to_wire(),
        f_code: desc.f_code,
        intra_dc_precision: desc.intra_dc_precision,
        pic_structure: desc.pic_structure,
        top_field_first: desc.top_field_first as u8,
        frame_pred_frame_dct: desc.frame_pred_frame_dct as u8,
        concealment_motion_vectors: desc.concealment_motion_vectors as u8,
        q_scale_type: desc.q_scale_type as u8,
        intra_vlc_format: desc.intra_vlc_format as u8,
        alternate_scan: desc.alternate_scan as u8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_size_matches_layout() {
        let mut buf = Vec::new();
        Mpeg2DecodeParams::default().write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), Mpeg2DecodeParams::ENCODED_SIZE);
    }

    #[test]
    fn quantiser_matrix_load_flags() {
        let desc = Mpeg2PictureDesc {
            intra_matrix: Some([8; 64]),
            non_intra_matrix: None,
            ..Default::default()
        };

        let params = decode_params(&desc, 2);
        assert_eq!(params.load_intra_quantiser_matrix, 1);
        assert_eq!(params.load_nonintra_quantiser_matrix, 0);
        assert_eq!(params.intra_quantiser_matrix[0], 8);
        assert_eq!(params.decoded_pic_idx, 2);
    }

    #[test]
    fn coding_type_wire_values() {
        for (coding, wire) in [
            (Mpeg2PictureCoding::Intra, 1),
            (Mpeg2PictureCoding::Predictive, 2),
            (Mpeg2PictureCoding::Bidirectional, 3),
        ] {
            let desc = Mpeg2PictureDesc {
                picture_coding_type: coding,
                ..Default::default()
            };
            assert_eq!(decode_params(&desc, 0).pic_coding_type, wire);
        }
    }
}
