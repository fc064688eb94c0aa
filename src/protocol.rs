// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Firmware wire format for the decode engine.
//!
//! Every message is a fixed little-endian record: a 16-byte header followed by
//! a body selected by the message type. Field order and sizes are dictated by
//! the firmware; the layout tests below pin them. Callers never see these
//! records directly, the decoder translates from the picture descriptors in
//! [`crate::codec`].

use std::io;
use std::io::Write;

use byteorder::LittleEndian;
use byteorder::WriteBytesExt;

use crate::codec::CodecParams;

/// Byte offset of the feedback region inside a message/feedback buffer.
pub const FB_BUFFER_OFFSET: usize = 4096;
/// Size of the feedback region.
pub const FB_BUFFER_SIZE: usize = 2048;
/// Size of the inverse-transform scaling table region that follows the
/// feedback region for codecs carrying scaling matrices.
pub const IT_SCALING_TABLE_SIZE: usize = 992;
/// Size of the per-session firmware context buffer.
pub const SESSION_CONTEXT_SIZE: usize = 128 * 1024;
/// Bitstream submissions are zero-padded to this alignment.
pub const BITSTREAM_PAD: u32 = 128;

/// Engine mailbox registers.
pub const REG_VCPU_CMD: u32 = 0x3bc3;
pub const REG_VCPU_DATA0: u32 = 0x3bc4;
pub const REG_VCPU_DATA1: u32 = 0x3bc5;
pub const REG_ENGINE_CNTL: u32 = 0x3bc6;

/// Message type carried in the header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    Create = 0,
    Decode = 1,
    Destroy = 2,
}

/// Firmware codec selector.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum StreamType {
    H264 = 0,
    Vc1 = 1,
    Mpeg2 = 3,
    Mpeg4 = 4,
    /// Reduced-context H.264 path on hardware that supports it.
    H264Perf = 7,
    MotionJpeg = 8,
}

impl StreamType {
    /// Whether this stream type submits an IT scaling table region.
    pub fn has_it_scaling(self) -> bool {
        matches!(self, StreamType::H264 | StreamType::H264Perf)
    }
}

/// Buffer kind tags used when handing buffers to the engine.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum BufferCommand {
    Message = 0x0000,
    Dpb = 0x0001,
    DecodingTarget = 0x0002,
    Feedback = 0x0003,
    SessionContext = 0x0005,
    Bitstream = 0x0100,
    ItScalingTable = 0x0204,
}

/// Common message header.
#[derive(Clone, Debug)]
pub struct MessageHeader {
    pub size: u32,
    pub message_type: MessageType,
    pub stream_handle: u32,
    pub status_report_number: u32,
}

impl MessageHeader {
    pub const ENCODED_SIZE: usize = 16;

    pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.size)?;
        w.write_u32::<LittleEndian>(self.message_type as u32)?;
        w.write_u32::<LittleEndian>(self.stream_handle)?;
        w.write_u32::<LittleEndian>(self.status_report_number)
    }
}

/// Body of a session-create message.
#[derive(Clone, Debug)]
pub struct CreateMessage {
    pub stream_type: StreamType,
    pub session_flags: u32,
    pub width_in_samples: u32,
    pub height_in_samples: u32,
    pub dpb_size: u32,
}

impl CreateMessage {
    pub const ENCODED_SIZE: usize = 20;

    pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.stream_type as u32)?;
        w.write_u32::<LittleEndian>(self.session_flags)?;
        w.write_u32::<LittleEndian>(self.width_in_samples)?;
        w.write_u32::<LittleEndian>(self.height_in_samples)?;
        w.write_u32::<LittleEndian>(self.dpb_size)
    }
}

/// Destination-surface tiling descriptor, derived from the target's plane
/// layout.
#[derive(Clone, Debug, Default)]
pub struct TargetDescriptor {
    pub pitch: u32,
    pub uv_pitch: u32,
    pub tiling_mode: u32,
    pub array_mode: u32,
    pub field_mode: u32,
    pub surf_tile_config: u32,
    pub uv_surf_tile_config: u32,
    pub luma_top_offset: u32,
    pub luma_bottom_offset: u32,
    pub chroma_top_offset: u32,
    pub chroma_bottom_offset: u32,
}

/// Body of a per-frame decode message.
#[derive(Clone, Debug)]
pub struct DecodeMessage {
    pub stream_type: StreamType,
    pub decode_flags: u32,
    pub width_in_samples: u32,
    pub height_in_samples: u32,
    pub dpb_size: u32,
    /// Bytes of bitstream data, before padding.
    pub bsd_size: u32,
    pub target: TargetDescriptor,
    pub codec: CodecParams,
}

impl DecodeMessage {
    /// Fixed fields up to the codec parameter union.
    const FIXED_SIZE: usize = 80;
    pub const ENCODED_SIZE: usize = Self::FIXED_SIZE + CodecParams::ENCODED_SIZE;

    pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.stream_type as u32)?;
        w.write_u32::<LittleEndian>(self.decode_flags)?;
        w.write_u32::<LittleEndian>(self.width_in_samples)?;
        w.write_u32::<LittleEndian>(self.height_in_samples)?;
        w.write_u32::<LittleEndian>(self.dpb_size)?;
        w.write_u32::<LittleEndian>(self.bsd_size)?;
        w.write_u32::<LittleEndian>(self.target.pitch)?;
        w.write_u32::<LittleEndian>(self.target.uv_pitch)?;
        w.write_u32::<LittleEndian>(self.target.tiling_mode)?;
        w.write_u32::<LittleEndian>(self.target.array_mode)?;
        w.write_u32::<LittleEndian>(self.target.field_mode)?;
        w.write_u32::<LittleEndian>(self.target.surf_tile_config)?;
        w.write_u32::<LittleEndian>(self.target.uv_surf_tile_config)?;
        w.write_u32::<LittleEndian>(self.target.luma_top_offset)?;
        w.write_u32::<LittleEndian>(self.target.luma_bottom_offset)?;
        w.write_u32::<LittleEndian>(self.target.chroma_top_offset)?;
        w.write_u32::<LittleEndian>(self.target.chroma_bottom_offset)?;
        // reserved
        w.write_u32::<LittleEndian>(0)?;
        w.write_u32::<LittleEndian>(0)?;
        w.write_u32::<LittleEndian>(0)?;
        self.codec.write_to(w)
    }
}

/// Writes a full message (header + body) into `buf`, returning the encoded
/// size. `buf` is the message region of a rotating message/feedback buffer.
pub fn write_message(
    buf: &mut [u8],
    stream_handle: u32,
    status_report_number: u32,
    body: &MessageBody,
) -> io::Result<usize> {
    let (message_type, body_size) = match body {
        MessageBody::Create(_) => (MessageType::Create, CreateMessage::ENCODED_SIZE),
        MessageBody::Decode(_) => (MessageType::Decode, DecodeMessage::ENCODED_SIZE),
        MessageBody::Destroy => (MessageType::Destroy, 0),
    };
    let total = MessageHeader::ENCODED_SIZE + body_size;

    let mut cursor = io::Cursor::new(buf);
    MessageHeader {
        size: total as u32,
        message_type,
        stream_handle,
        status_report_number,
    }
    .write_to(&mut cursor)?;

    match body {
        MessageBody::Create(create) => create.write_to(&mut cursor)?,
        MessageBody::Decode(decode) => decode.write_to(&mut cursor)?,
        MessageBody::Destroy => (),
    }

    Ok(total)
}

pub enum MessageBody {
    Create(CreateMessage),
    Decode(Box<DecodeMessage>),
    Destroy,
}

/// Pre-initializes the feedback region: the firmware expects its size in the
/// first dword and writes status/size/error words behind it.
pub fn init_feedback(fb: &mut [u8]) -> io::Result<()> {
    let mut cursor = io::Cursor::new(fb);
    cursor.write_u32::<LittleEndian>(FB_BUFFER_SIZE as u32)
}

/// Pads `w` with zero bytes.
pub fn write_zeros(w: &mut impl Write, len: usize) -> io::Result<()> {
    const ZEROS: [u8; 64] = [0; 64];
    let mut remaining = len;
    while remaining > 0 {
        let chunk = remaining.min(ZEROS.len());
        w.write_all(&ZEROS[..chunk])?;
        remaining -= chunk;
    }
    Ok(())
}
