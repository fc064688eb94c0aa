// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Motion-JPEG support.
//!
//! The engine consumes complete JPEG images, but callers typically hand over
//! only the entropy-coded scan data plus parsed table state. The decoder
//! therefore synthesizes a minimal container header (SOI, tables, frame and
//! scan headers) ahead of the caller's data and closes the image with an EOI
//! marker at end of frame. JPEG markers are big-endian.

use std::io;
use std::io::Write;

use byteorder::BigEndian;
use byteorder::WriteBytesExt;

use crate::Resolution;

const MARKER_SOI: u16 = 0xffd8;
const MARKER_DQT: u16 = 0xffdb;
const MARKER_DHT: u16 = 0xffc4;
const MARKER_DRI: u16 = 0xffdd;
const MARKER_SOF0: u16 = 0xffc0;
const MARKER_SOS: u16 = 0xffda;
const MARKER_EOI: u16 = 0xffd9;

#[derive(Clone, Debug)]
pub struct MjpegQuantTable {
    /// Destination id (0..=3).
    pub id: u8,
    /// Values in zig-zag order.
    pub values: [u8; 64],
}

#[derive(Clone, Debug)]
pub struct MjpegHuffmanTable {
    /// 0 for DC, 1 for AC.
    pub class: u8,
    /// Destination id (0..=1 for baseline).
    pub id: u8,
    /// Number of codes per bit length.
    pub bits: [u8; 16],
    pub values: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct MjpegComponent {
    pub id: u8,
    pub h_sampling: u8,
    pub v_sampling: u8,
    pub quant_table: u8,
    pub dc_table: u8,
    pub ac_table: u8,
}

/// Caller-supplied per-frame picture description.
#[derive(Clone, Debug, Default)]
pub struct MjpegPictureDesc {
    pub resolution: Resolution,
    pub components: Vec<MjpegComponent>,
    pub quant_tables: Vec<MjpegQuantTable>,
    pub huffman_tables: Vec<MjpegHuffmanTable>,
    /// 0 disables restart markers.
    pub restart_interval: u16,
}

/// Writes the synthesized image header that precedes the caller's
/// entropy-coded data in the bitstream buffer.
pub fn write_frame_header(w: &mut impl Write, desc: &MjpegPictureDesc) -> io::Result<()> {
    w.write_u16::<BigEndian>(MARKER_SOI)?;

    for table in &desc.quant_tables {
        w.write_u16::<BigEndian>(MARKER_DQT)?;
        w.write_u16::<BigEndian>(2 + 1 + 64)?;
        // 8-bit precision, destination in the low nibble.
        w.write_u8(table.id & 0x0f)?;
        w.write_all(&table.values)?;
    }

    for table in &desc.huffman_tables {
        w.write_u16::<BigEndian>(MARKER_DHT)?;
        w.write_u16::<BigEndian>(2 + 1 + 16 + table.values.len() as u16)?;
        w.write_u8((table.class << 4) | (table.id & 0x0f))?;
        w.write_all(&table.bits)?;
        w.write_all(&table.values)?;
    }

    if desc.restart_interval != 0 {
        w.write_u16::<BigEndian>(MARKER_DRI)?;
        w.write_u16::<BigEndian>(4)?;
        w.write_u16::<BigEndian>(desc.restart_interval)?;
    }

    w.write_u16::<BigEndian>(MARKER_SOF0)?;
    w.write_u16::<BigEndian>(8 + 3 * desc.components.len() as u16)?;
    w.write_u8(8)?;
    w.write_u16::<BigEndian>(desc.resolution.height as u16)?;
    w.write_u16::<BigEndian>(desc.resolution.width as u16)?;
    w.write_u8(desc.components.len() as u8)?;
    for component in &desc.components {
        w.write_u8(component.id)?;
        w.write_u8((component.h_sampling << 4) | (component.v_sampling & 0x0f))?;
        w.write_u8(component.quant_table)?;
    }

    w.write_u16::<BigEndian>(MARKER_SOS)?;
    w.write_u16::<BigEndian>(6 + 2 * desc.components.len() as u16)?;
    w.write_u8(desc.components.len() as u8)?;
    for component in &desc.components {
        w.write_u8(component.id)?;
        w.write_u8((component.dc_table << 4) | (component.ac_table & 0x0f))?;
    }
    // Full spectral selection, no successive approximation.
    w.write_u8(0x00)?;
    w.write_u8(0x3f)?;
    w.write_u8(0x00)
}

/// Closes the image; appended after the caller's scan data at end of frame.
pub fn write_end_of_image(w: &mut impl Write) -> io::Result<()> {
    w.write_u16::<BigEndian>(MARKER_EOI)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yuv420_desc() -> MjpegPictureDesc {
        MjpegPictureDesc {
            resolution: Resolution::from((640, 480)),
            components: vec![
                MjpegComponent {
                    id: 1,
                    h_sampling: 2,
                    v_sampling: 2,
                    quant_table: 0,
                    dc_table: 0,
                    ac_table: 0,
                },
                MjpegComponent {
                    id: 2,
                    h_sampling: 1,
                    v_sampling: 1,
                    quant_table: 1,
                    dc_table: 1,
                    ac_table: 1,
                },
                MjpegComponent {
                    id: 3,
                    h_sampling: 1,
                    v_sampling: 1,
                    quant_table: 1,
                    dc_table: 1,
                    ac_table: 1,
                },
            ],
            quant_tables: vec![MjpegQuantTable {
                id: 0,
                values: [16; 64],
            }],
            huffman_tables: vec![MjpegHuffmanTable {
                class: 0,
                id: 0,
                bits: [0; 16],
                values: Vec::new(),
            }],
            restart_interval: 0,
        }
    }

    #[test]
    fn header_starts_with_soi_and_ends_with_sos() {
        let mut buf = Vec::new();
        write_frame_header(&mut buf, &yuv420_desc()).unwrap();

        assert_eq!(&buf[0..2], &[0xff, 0xd8]);
        // SOS payload: len(2) + ncomp(1) + 2*3 + 3 trailer bytes.
        let sos_len = 2 + 1 + 6 + 3;
        let sos_start = buf.len() - sos_len - 2;
        assert_eq!(&buf[sos_start..sos_start + 2], &[0xff, 0xda]);
        assert_eq!(buf[buf.len() - 2], 0x3f);
    }

    #[test]
    fn frame_header_carries_dimensions() {
        let mut buf = Vec::new();
        write_frame_header(&mut buf, &yuv420_desc()).unwrap();

        let sof = buf
            .windows(2)
            .position(|w| w == [0xff, 0xc0])
            .expect("SOF0 missing");
        // marker(2) + len(2) + precision(1), then height and width.
        assert_eq!(&buf[sof + 5..sof + 7], &480u16.to_be_bytes());
        assert_eq!(&buf[sof + 7..sof + 9], &640u16.to_be_bytes());
    }

    #[test]
    fn restart_interval_emitted_when_set() {
        let mut desc = yuv420_desc();
        desc.restart_interval = 32;

        let mut buf = Vec::new();
        write_frame_header(&mut buf, &desc).unwrap();
        let dri = buf
            .windows(2)
            .position(|w| w == [0xff, 0xdd])
            .expect("DRI missing");
        assert_eq!(&buf[dri + 4..dri + 6], &32u16.to_be_bytes());
    }

    #[test]
    fn end_of_image_marker() {
        let mut buf = Vec::new();
        write_end_of_image(&mut buf).unwrap();
        assert_eq!(buf, vec![0xff, 0xd9]);
    }
}
