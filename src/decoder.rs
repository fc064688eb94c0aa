// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decode engine state machine.
//!
//! A [`Decoder`] owns four rotating message/bitstream buffer sets so the CPU
//! can prepare frame N+1 while the engine still consumes frame N, one
//! reference picture store sized at open time, and a session context buffer.
//! Callers drive it through `begin_frame` → `decode_bitstream`(×N) →
//! `end_frame` per picture; each completed frame advances the rotation cursor
//! by exactly one.

pub mod dpb;

use std::io;
use std::rc::Rc;

use log::debug;
use log::warn;
use thiserror::Error;

use crate::buffer::BufferError;
use crate::buffer::EngineBuffer;
use crate::codec::h264;
use crate::codec::mjpeg;
use crate::codec::mpeg2;
use crate::codec::mpeg4;
use crate::codec::vc1;
use crate::codec::CodecParams;
use crate::codec::PictureDesc;
use crate::device::Access;
use crate::device::CommandStream;
use crate::device::DeviceError;
use crate::device::Fence;
use crate::device::FlushFlags;
use crate::device::GpuResource;
use crate::device::MemoryDomain;
use crate::device::ResourceBackend;
use crate::protocol;
use crate::protocol::BufferCommand;
use crate::protocol::CreateMessage;
use crate::protocol::DecodeMessage;
use crate::protocol::MessageBody;
use crate::protocol::StreamType;
use crate::protocol::TargetDescriptor;
use crate::session::StreamHandle;
use crate::session::StreamHandleAllocator;
use crate::video_frame::TileMode;
use crate::video_frame::VideoSurface;
use crate::CodecFormat;
use crate::Profile;
use crate::Resolution;

/// Number of rotating buffer sets; bounds how far recording may run ahead of
/// the engine.
pub const NUM_BUFFERS: usize = 4;

#[derive(Debug, Error)]
pub enum OpenError {
    #[error("codec/profile combination is not supported by this engine")]
    Unsupported,
    #[error("this format must be decoded by the software fallback path on this hardware")]
    SoftwareFallbackRequired,
    #[error("out of device memory")]
    OutOfMemory,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type OpenResult<T> = Result<T, OpenError>;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("out of device memory")]
    OutOfMemory,
    #[error("fence wait timed out")]
    DeviceTimeout,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type DecodeResult<T> = Result<T, DecodeError>;

impl From<BufferError> for OpenError {
    fn from(err: BufferError) -> Self {
        match err {
            BufferError::OutOfMemory => OpenError::OutOfMemory,
            other => OpenError::Other(other.into()),
        }
    }
}

impl From<BufferError> for DecodeError {
    fn from(err: BufferError) -> Self {
        match err {
            BufferError::OutOfMemory => DecodeError::OutOfMemory,
            other => DecodeError::Other(other.into()),
        }
    }
}

impl From<DeviceError> for DecodeError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::OutOfMemory => DecodeError::OutOfMemory,
            DeviceError::Timeout => DecodeError::DeviceTimeout,
            other => DecodeError::Other(other.into()),
        }
    }
}

impl From<io::Error> for DecodeError {
    fn from(err: io::Error) -> Self {
        DecodeError::Other(err.into())
    }
}

/// Hardware capabilities relevant to session setup.
#[derive(Clone, Debug)]
pub struct DecoderCaps {
    /// The reduced-context H.264 decode path is available.
    pub h264_performance: bool,
    /// MPEG-1/2 runs on the engine; legacy parts leave it to a software
    /// decoder.
    pub hardware_mpeg12: bool,
    /// A motion-JPEG engine is present.
    pub motion_jpeg: bool,
}

impl Default for DecoderCaps {
    fn default() -> Self {
        Self {
            h264_performance: false,
            hardware_mpeg12: true,
            motion_jpeg: true,
        }
    }
}

/// Session parameters fixed at open time.
#[derive(Clone, Debug)]
pub struct DecoderConfig {
    pub profile: Profile,
    pub level: u32,
    pub resolution: Resolution,
    pub interlaced: bool,
    pub max_references: u32,
}

struct BufferSet {
    /// Combined message/feedback/IT-scaling allocation.
    msg_fb: EngineBuffer,
    bitstream: EngineBuffer,
}

/// Decode engine session.
pub struct Decoder {
    backend: Rc<dyn ResourceBackend>,
    cs: Box<dyn CommandStream>,

    config: DecoderConfig,
    stream_type: StreamType,
    stream_handle: StreamHandle,
    dpb_size: u32,

    buffers: Vec<BufferSet>,
    cur_buffer: usize,
    dpb: Option<EngineBuffer>,
    session_ctx: EngineBuffer,

    frame_number: u32,
    /// Write offset into the current bitstream buffer; `None` outside a
    /// begin/end pair.
    bs_written: Option<usize>,
    target: Option<Rc<dyn VideoSurface>>,
    last_fence: Option<Fence>,
}

impl Decoder {
    /// Creates a decode session and announces it to the engine.
    ///
    /// Fails with [`OpenError::SoftwareFallbackRequired`] for MPEG-1/2 on
    /// hardware without that engine path; the media pipeline substitutes its
    /// software decoder in that case.
    pub fn open(
        backend: Rc<dyn ResourceBackend>,
        cs: Box<dyn CommandStream>,
        handles: &StreamHandleAllocator,
        config: DecoderConfig,
        caps: DecoderCaps,
    ) -> OpenResult<Self> {
        let stream_type = match config.profile.format() {
            CodecFormat::H264 => {
                if caps.h264_performance {
                    StreamType::H264Perf
                } else {
                    StreamType::H264
                }
            }
            CodecFormat::Vc1 => StreamType::Vc1,
            CodecFormat::Mpeg2 => {
                if !caps.hardware_mpeg12 {
                    return Err(OpenError::SoftwareFallbackRequired);
                }
                StreamType::Mpeg2
            }
            CodecFormat::Mpeg4 => StreamType::Mpeg4,
            CodecFormat::MotionJpeg => {
                if !caps.motion_jpeg {
                    return Err(OpenError::Unsupported);
                }
                StreamType::MotionJpeg
            }
        };

        let dpb_size = dpb::dpb_size(
            stream_type,
            config.resolution,
            config.level,
            config.max_references,
        );

        let mut msg_fb_size = protocol::FB_BUFFER_OFFSET + protocol::FB_BUFFER_SIZE;
        if stream_type.has_it_scaling() {
            msg_fb_size += protocol::IT_SCALING_TABLE_SIZE;
        }
        let bs_size =
            (config.resolution.width * config.resolution.height * (512 / (16 * 16))).max(4096)
                as usize;

        let mut buffers = Vec::with_capacity(NUM_BUFFERS);
        for _ in 0..NUM_BUFFERS {
            buffers.push(BufferSet {
                msg_fb: EngineBuffer::create(&*backend, msg_fb_size, MemoryDomain::Staging)?,
                bitstream: EngineBuffer::create(&*backend, bs_size, MemoryDomain::Staging)?,
            });
        }

        let dpb = if dpb_size > 0 {
            Some(EngineBuffer::create(
                &*backend,
                dpb_size as usize,
                MemoryDomain::Device,
            )?)
        } else {
            None
        };
        let session_ctx = EngineBuffer::create(
            &*backend,
            protocol::SESSION_CONTEXT_SIZE,
            MemoryDomain::Device,
        )?;

        let mut dec = Self {
            backend,
            cs,
            stream_handle: handles.next(),
            stream_type,
            dpb_size,
            config,
            buffers,
            cur_buffer: 0,
            dpb,
            session_ctx,
            frame_number: 0,
            bs_written: None,
            target: None,
            last_fence: None,
        };

        dec.send_create().map_err(|err| match err {
            DecodeError::OutOfMemory => OpenError::OutOfMemory,
            DecodeError::DeviceTimeout => OpenError::Other(anyhow::anyhow!("timeout at open")),
            DecodeError::Other(other) => OpenError::Other(other),
        })?;

        debug!(
            "opened {:?} session {:08x}, dpb {} bytes",
            stream_type, dec.stream_handle.0, dpb_size
        );
        Ok(dec)
    }

    /// Starts a new frame targeting `target`.
    ///
    /// The target is tagged with this session's frame number; re-using a
    /// surface across sessions simply retags it.
    pub fn begin_frame(
        &mut self,
        target: Rc<dyn VideoSurface>,
        desc: &PictureDesc,
    ) -> DecodeResult<()> {
        self.frame_number += 1;
        if self.stream_type != StreamType::H264Perf {
            target.associate_frame(self.stream_handle, self.frame_number);
        }

        self.bs_written = Some(0);
        self.target = Some(target);

        // Motion-JPEG bitstreams get a synthesized image header ahead of the
        // caller's entropy-coded data.
        if let (StreamType::MotionJpeg, PictureDesc::MotionJpeg(desc)) = (self.stream_type, desc) {
            let mut header = Vec::new();
            mjpeg::write_frame_header(&mut header, desc)?;
            self.append_bitstream(&[&header])?;
        }

        Ok(())
    }

    /// Appends compressed data fragments to the current frame's bitstream.
    ///
    /// Grows the bitstream buffer transparently when the fragments exceed its
    /// capacity. Without a preceding `begin_frame` this is a no-op.
    pub fn decode_bitstream(&mut self, fragments: &[&[u8]]) -> DecodeResult<()> {
        if self.bs_written.is_none() {
            return Ok(());
        }
        self.append_bitstream(fragments)
    }

    fn append_bitstream(&mut self, fragments: &[&[u8]]) -> DecodeResult<()> {
        let Some(mut offset) = self.bs_written else {
            return Ok(());
        };

        let needed: usize = fragments.iter().map(|fragment| fragment.len()).sum();
        let total = offset + needed;

        let set = &mut self.buffers[self.cur_buffer];
        if total > set.bitstream.size() {
            debug!(
                "bitstream buffer too small ({} < {}), growing",
                set.bitstream.size(),
                total
            );
            set.bitstream.resize(&*self.backend, total)?;
        }

        {
            let res = set.bitstream.resource()?;
            let mut map = res.map()?;
            let slice = map.as_mut_slice();
            for fragment in fragments {
                slice[offset..offset + fragment.len()].copy_from_slice(fragment);
                offset += fragment.len();
            }
        }

        self.bs_written = Some(offset);
        Ok(())
    }

    /// Finishes the current frame: pads the bitstream, writes the decode
    /// message and submits the frame's buffers as one unit.
    ///
    /// Without a paired `begin_frame` this is a no-op.
    pub fn end_frame(&mut self, desc: &PictureDesc) -> DecodeResult<()> {
        if self.bs_written.is_none() || self.target.is_none() {
            return Ok(());
        }

        if self.stream_type == StreamType::MotionJpeg {
            let mut eoi = Vec::new();
            mjpeg::write_end_of_image(&mut eoi)?;
            self.append_bitstream(&[&eoi])?;
        }

        let Some(written) = self.bs_written else {
            return Ok(());
        };
        let Some(target) = self.target.clone() else {
            return Ok(());
        };

        // Zero-pad up to the engine's bitstream alignment.
        let padded = crate::align(written as u32, protocol::BITSTREAM_PAD) as usize;
        {
            let set = &mut self.buffers[self.cur_buffer];
            if padded > set.bitstream.size() {
                set.bitstream.resize(&*self.backend, padded)?;
            }
            let res = set.bitstream.resource()?;
            let mut map = res.map()?;
            map.as_mut_slice()[written..padded].fill(0);
        }

        let decoded_pic_idx = target
            .associated_frame()
            .map(|(_, frame)| frame)
            .unwrap_or(self.frame_number);
        let Some(codec) = self.codec_params(desc, decoded_pic_idx) else {
            warn!(
                "picture description does not match {:?} session, dropping frame",
                self.stream_type
            );
            self.bs_written = None;
            self.target = None;
            return Ok(());
        };

        let body = MessageBody::Decode(Box::new(DecodeMessage {
            stream_type: self.stream_type,
            decode_flags: 0,
            width_in_samples: self.config.resolution.width,
            height_in_samples: self.config.resolution.height,
            dpb_size: self.dpb_size,
            bsd_size: written as u32,
            target: self.target_descriptor(&*target),
            codec,
        }));

        {
            let set = &self.buffers[self.cur_buffer];
            let res = set.msg_fb.resource()?;
            let mut map = res.map()?;
            let slice = map.as_mut_slice();
            protocol::write_message(
                &mut slice[..protocol::FB_BUFFER_OFFSET],
                self.stream_handle.0,
                self.frame_number,
                &body,
            )?;
            protocol::init_feedback(
                &mut slice
                    [protocol::FB_BUFFER_OFFSET..protocol::FB_BUFFER_OFFSET + protocol::FB_BUFFER_SIZE],
            )?;

            if let MessageBody::Decode(msg) = &body {
                if let CodecParams::H264(params) = &msg.codec {
                    let it_start = protocol::FB_BUFFER_OFFSET + protocol::FB_BUFFER_SIZE;
                    h264::write_it_scaling(
                        params,
                        &mut slice[it_start..it_start + h264::IT_TABLE_SIZE],
                    );
                }
            }
        }

        self.submit_frame(&target)?;

        self.next_buffer();
        self.bs_written = None;
        self.target = None;
        Ok(())
    }

    /// Submits any recorded work without waiting for it.
    pub fn flush(&mut self) -> DecodeResult<()> {
        let fence = self.cs.flush(FlushFlags { asynchronous: true })?;
        self.last_fence = Some(fence);
        Ok(())
    }

    /// Waits for the most recent submission with `timeout_ns`.
    pub fn get_decoder_fence(&self, timeout_ns: u64) -> DecodeResult<()> {
        if let Some(fence) = &self.last_fence {
            self.cs.wait(fence, timeout_ns)?;
        }
        Ok(())
    }

    /// Tears the session down, notifying the engine first.
    pub fn close(mut self) -> DecodeResult<()> {
        self.send_destroy()?;

        for set in &mut self.buffers {
            set.msg_fb.destroy();
            set.bitstream.destroy();
        }
        if let Some(dpb) = &mut self.dpb {
            dpb.destroy();
        }
        self.session_ctx.destroy();
        Ok(())
    }

    fn codec_params(&self, desc: &PictureDesc, decoded_pic_idx: u32) -> Option<CodecParams> {
        match (self.stream_type, desc) {
            (StreamType::H264 | StreamType::H264Perf, PictureDesc::H264(desc)) => {
                // The engine indexes the DPB by frame_num for H.264.
                Some(CodecParams::H264(Box::new(h264::decode_params(
                    desc,
                    desc.frame_num,
                ))))
            }
            (StreamType::Vc1, PictureDesc::Vc1(desc)) => {
                Some(CodecParams::Vc1(Box::new(vc1::decode_params(desc))))
            }
            (StreamType::Mpeg2, PictureDesc::Mpeg2(desc)) => Some(CodecParams::Mpeg2(Box::new(
                mpeg2::decode_params(desc, decoded_pic_idx),
            ))),
            (StreamType::Mpeg4, PictureDesc::Mpeg4(desc)) => Some(CodecParams::Mpeg4(Box::new(
                mpeg4::decode_params(desc, decoded_pic_idx),
            ))),
            (StreamType::MotionJpeg, PictureDesc::MotionJpeg(_)) => Some(CodecParams::MotionJpeg),
            _ => None,
        }
    }

    fn target_descriptor(&self, target: &dyn VideoSurface) -> TargetDescriptor {
        let luma = target.plane_layout(0);
        let chroma = if target.num_planes() > 1 {
            target.plane_layout(1)
        } else {
            luma
        };

        let tiling_mode = match luma.tile_mode {
            TileMode::Linear => 0,
            TileMode::Tiled1D => 1,
            TileMode::Tiled2D => 2,
        };

        let luma_top = luma.offset as u32;
        let chroma_top = chroma.offset as u32;
        // Interlaced targets store the bottom field one line down.
        let (luma_bottom, chroma_bottom) = if target.interlaced() {
            (luma_top + luma.pitch, chroma_top + chroma.pitch)
        } else {
            (luma_top, chroma_top)
        };

        TargetDescriptor {
            pitch: luma.pitch,
            uv_pitch: chroma.pitch,
            tiling_mode,
            array_mode: 0,
            field_mode: target.interlaced() as u32,
            surf_tile_config: luma.tile_config_word(),
            uv_surf_tile_config: chroma.tile_config_word(),
            luma_top_offset: luma_top,
            luma_bottom_offset: luma_bottom,
            chroma_top_offset: chroma_top,
            chroma_bottom_offset: chroma_bottom,
        }
    }

    /// Hands one buffer to the engine: a relocation plus its address and kind
    /// through the mailbox registers.
    fn send_cmd(
        &mut self,
        cmd: BufferCommand,
        res: &Rc<dyn GpuResource>,
        offset: u64,
        access: Access,
        domain: MemoryDomain,
    ) {
        self.cs.add_buffer(res, access, domain);
        let addr = res.virtual_address() + offset;
        self.cs.set_reg(protocol::REG_VCPU_DATA0, addr as u32);
        self.cs.set_reg(protocol::REG_VCPU_DATA1, (addr >> 32) as u32);
        self.cs.set_reg(protocol::REG_VCPU_CMD, (cmd as u32) << 1);
    }

    /// Sends the session context and message buffer for the current set.
    fn send_msg_buf(&mut self) -> DecodeResult<()> {
        let ctx_res = Rc::clone(self.session_ctx.resource()?);
        let msg_res = Rc::clone(self.buffers[self.cur_buffer].msg_fb.resource()?);

        self.send_cmd(
            BufferCommand::SessionContext,
            &ctx_res,
            0,
            Access::ReadWrite,
            MemoryDomain::Device,
        );
        self.send_cmd(
            BufferCommand::Message,
            &msg_res,
            0,
            Access::Read,
            MemoryDomain::Staging,
        );
        Ok(())
    }

    fn submit_frame(&mut self, target: &Rc<dyn VideoSurface>) -> DecodeResult<()> {
        self.send_msg_buf()?;

        if let Some(dpb) = &self.dpb {
            let dpb_res = Rc::clone(dpb.resource()?);
            self.send_cmd(
                BufferCommand::Dpb,
                &dpb_res,
                0,
                Access::ReadWrite,
                MemoryDomain::Device,
            );
        }

        let bs_res = Rc::clone(self.buffers[self.cur_buffer].bitstream.resource()?);
        self.send_cmd(
            BufferCommand::Bitstream,
            &bs_res,
            0,
            Access::Read,
            MemoryDomain::Staging,
        );

        for plane in 0..target.num_planes() {
            let res = Rc::clone(target.plane_resource(plane));
            self.send_cmd(
                BufferCommand::DecodingTarget,
                &res,
                0,
                Access::Write,
                MemoryDomain::Device,
            );
        }

        let msg_res = Rc::clone(self.buffers[self.cur_buffer].msg_fb.resource()?);
        self.send_cmd(
            BufferCommand::Feedback,
            &msg_res,
            protocol::FB_BUFFER_OFFSET as u64,
            Access::Write,
            MemoryDomain::Staging,
        );
        if self.stream_type.has_it_scaling() {
            self.send_cmd(
                BufferCommand::ItScalingTable,
                &msg_res,
                (protocol::FB_BUFFER_OFFSET + protocol::FB_BUFFER_SIZE) as u64,
                Access::Read,
                MemoryDomain::Staging,
            );
        }

        self.cs.set_reg(protocol::REG_ENGINE_CNTL, 1);
        let fence = self.cs.flush(FlushFlags { asynchronous: true })?;
        self.last_fence = Some(fence);
        Ok(())
    }

    fn send_create(&mut self) -> DecodeResult<()> {
        let body = MessageBody::Create(CreateMessage {
            stream_type: self.stream_type,
            session_flags: 0,
            width_in_samples: self.config.resolution.width,
            height_in_samples: self.config.resolution.height,
            dpb_size: self.dpb_size,
        });

        {
            let set = &self.buffers[self.cur_buffer];
            let res = set.msg_fb.resource()?;
            let mut map = res.map()?;
            protocol::write_message(
                &mut map.as_mut_slice()[..protocol::FB_BUFFER_OFFSET],
                self.stream_handle.0,
                0,
                &body,
            )?;
        }

        self.send_msg_buf()?;
        self.cs.flush(FlushFlags::default())?;
        self.next_buffer();
        Ok(())
    }

    fn send_destroy(&mut self) -> DecodeResult<()> {
        {
            let set = &self.buffers[self.cur_buffer];
            let res = set.msg_fb.resource()?;
            let mut map = res.map()?;
            protocol::write_message(
                &mut map.as_mut_slice()[..protocol::FB_BUFFER_OFFSET],
                self.stream_handle.0,
                0,
                &MessageBody::Destroy,
            )?;
        }

        self.send_msg_buf()?;
        self.cs.flush(FlushFlags::default())?;
        Ok(())
    }

    /// Cycles to the next rotating buffer set.
    fn next_buffer(&mut self) {
        self.cur_buffer = (self.cur_buffer + 1) % NUM_BUFFERS;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::mpeg2::Mpeg2PictureDesc;
    use crate::device::dummy::DummyBackend;
    use crate::device::dummy::DummyStream;
    use crate::device::dummy::StreamLog;
    use crate::device::dummy::StreamOp;
    use crate::video_frame::tests::FakeSurface;

    fn mpeg2_config(width: u32, height: u32) -> DecoderConfig {
        DecoderConfig {
            profile: Profile::Mpeg2Main,
            level: 8,
            resolution: Resolution::from((width, height)),
            interlaced: false,
            max_references: 2,
        }
    }

    fn open_decoder(config: DecoderConfig) -> (Decoder, Rc<DummyBackend>, StreamLog) {
        let _ = env_logger::builder().is_test(true).try_init();
        let backend = DummyBackend::new();
        let (cs, log) = DummyStream::new();
        let handles = StreamHandleAllocator::new();
        let dec = Decoder::open(
            backend.clone(),
            Box::new(cs),
            &handles,
            config,
            DecoderCaps::default(),
        )
        .unwrap();
        (dec, backend, log)
    }

    fn decode_one_frame(dec: &mut Decoder, backend: &Rc<DummyBackend>, data: &[u8]) {
        let desc = PictureDesc::Mpeg2(Mpeg2PictureDesc::default());
        let target = Rc::new(FakeSurface::nv12(backend, dec.config.resolution));
        dec.begin_frame(target, &desc).unwrap();
        dec.decode_bitstream(&[data]).unwrap();
        dec.end_frame(&desc).unwrap();
    }

    #[test]
    fn open_sends_create_and_advances_rotation() {
        let (dec, _backend, log) = open_decoder(mpeg2_config(720, 576));
        assert_eq!(dec.cur_buffer, 1);

        let ops = log.borrow();
        // Session context + message buffer, then a flush.
        assert!(matches!(ops[0], StreamOp::AddBuffer { access: Access::ReadWrite, .. }));
        assert!(ops.iter().any(|op| matches!(op, StreamOp::Flush)));
    }

    #[test]
    fn rotation_visits_every_set_in_order() {
        let (mut dec, backend, _log) = open_decoder(mpeg2_config(320, 240));

        // The create message consumed set 0.
        let mut expected = 1;
        for _ in 0..9 {
            assert_eq!(dec.cur_buffer, expected);
            decode_one_frame(&mut dec, &backend, &[0u8; 32]);
            expected = (expected + 1) % NUM_BUFFERS;
            assert_eq!(dec.cur_buffer, expected);
        }
    }

    #[test]
    fn bitstream_grows_transparently() {
        // 64x64 gives an 8 KiB initial bitstream buffer.
        let (mut dec, backend, _log) = open_decoder(mpeg2_config(64, 64));
        let set_idx = dec.cur_buffer;
        assert_eq!(dec.buffers[set_idx].bitstream.size(), 8192);

        let payload: Vec<u8> = (0..10240u32).map(|i| i as u8).collect();
        let desc = PictureDesc::Mpeg2(Mpeg2PictureDesc::default());
        let target = Rc::new(FakeSurface::nv12(&backend, dec.config.resolution));
        dec.begin_frame(target, &desc).unwrap();
        dec.decode_bitstream(&[&payload]).unwrap();

        let set = &dec.buffers[set_idx];
        assert!(set.bitstream.size() >= 10240);
        let res = set.bitstream.resource().unwrap();
        let map = res.map().unwrap();
        assert_eq!(&map.as_slice()[..10240], &payload[..]);
        drop(map);

        dec.end_frame(&desc).unwrap();
    }

    #[test]
    fn fragments_are_appended_in_order_across_calls() {
        let (mut dec, backend, _log) = open_decoder(mpeg2_config(320, 240));
        let set_idx = dec.cur_buffer;

        let desc = PictureDesc::Mpeg2(Mpeg2PictureDesc::default());
        let target = Rc::new(FakeSurface::nv12(&backend, dec.config.resolution));
        dec.begin_frame(target, &desc).unwrap();
        dec.decode_bitstream(&[&[1u8; 10], &[2u8; 10]]).unwrap();
        dec.decode_bitstream(&[&[3u8; 10]]).unwrap();

        let res = dec.buffers[set_idx].bitstream.resource().unwrap();
        let map = res.map().unwrap();
        assert_eq!(&map.as_slice()[..10], &[1u8; 10]);
        assert_eq!(&map.as_slice()[10..20], &[2u8; 10]);
        assert_eq!(&map.as_slice()[20..30], &[3u8; 10]);
    }

    #[test]
    fn decode_bitstream_without_begin_is_a_noop() {
        let (mut dec, _backend, log) = open_decoder(mpeg2_config(320, 240));
        let ops_before = log.borrow().len();

        dec.decode_bitstream(&[&[0xffu8; 128]]).unwrap();

        assert_eq!(log.borrow().len(), ops_before);
        let set = &dec.buffers[dec.cur_buffer];
        let res = set.bitstream.resource().unwrap();
        let map = res.map().unwrap();
        assert!(map.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn end_frame_without_begin_is_a_noop() {
        let (mut dec, _backend, log) = open_decoder(mpeg2_config(320, 240));
        let ops_before = log.borrow().len();

        let desc = PictureDesc::Mpeg2(Mpeg2PictureDesc::default());
        dec.end_frame(&desc).unwrap();

        assert_eq!(log.borrow().len(), ops_before);
        assert_eq!(dec.cur_buffer, 1);
    }

    #[test]
    fn end_frame_pads_bitstream_and_writes_message() {
        let (mut dec, backend, log) = open_decoder(mpeg2_config(320, 240));
        let set_idx = dec.cur_buffer;
        let handle = dec.stream_handle.0;

        decode_one_frame(&mut dec, &backend, &[0x5au8; 100]);

        // Padded to the 128-byte alignment with zeros.
        let res = dec.buffers[set_idx].bitstream.resource().unwrap();
        let map = res.map().unwrap();
        assert!(map.as_slice()[100..128].iter().all(|&b| b == 0));
        drop(map);

        // The decode message landed in the message region with our handle.
        let res = dec.buffers[set_idx].msg_fb.resource().unwrap();
        let map = res.map().unwrap();
        assert_eq!(&map.as_slice()[8..12], &handle.to_le_bytes());
        drop(map);

        // The submission ends with the engine kick.
        let ops = log.borrow();
        let kick = ops
            .iter()
            .rev()
            .find(|op| matches!(op, StreamOp::SetReg { reg, .. } if *reg == protocol::REG_ENGINE_CNTL));
        assert!(matches!(kick, Some(StreamOp::SetReg { value: 1, .. })));
    }

    #[test]
    fn mpeg2_dpb_uses_hardware_reference_count() {
        let config = DecoderConfig {
            max_references: 10,
            ..mpeg2_config(720, 576)
        };
        let (dec, _backend, _log) = open_decoder(config);

        let expected = dpb::image_size(Resolution::from((720, 576))) * dpb::NUM_MPEG2_REFS;
        assert_eq!(dec.dpb.as_ref().unwrap().size(), expected as usize);
    }

    #[test]
    fn mjpeg_synthesizes_image_wrapper() {
        let backend = DummyBackend::new();
        let (cs, _log) = DummyStream::new();
        let handles = StreamHandleAllocator::new();
        let mut dec = Decoder::open(
            backend.clone(),
            Box::new(cs),
            &handles,
            DecoderConfig {
                profile: Profile::JpegBaseline,
                level: 0,
                resolution: Resolution::from((640, 480)),
                interlaced: false,
                max_references: 0,
            },
            DecoderCaps::default(),
        )
        .unwrap();

        // No reference store for motion-JPEG.
        assert!(dec.dpb.is_none());

        let set_idx = dec.cur_buffer;
        let desc = PictureDesc::MotionJpeg(crate::codec::mjpeg::MjpegPictureDesc {
            resolution: Resolution::from((640, 480)),
            ..Default::default()
        });
        let target = Rc::new(FakeSurface::nv12(&backend, Resolution::from((640, 480))));
        dec.begin_frame(target, &desc).unwrap();
        dec.decode_bitstream(&[&[0x12u8, 0x34, 0x56]]).unwrap();
        dec.end_frame(&desc).unwrap();

        let res = dec.buffers[set_idx].bitstream.resource().unwrap();
        let map = res.map().unwrap();
        let bs = map.as_slice();
        // Starts with SOI, scan data present, EOI before the zero padding.
        assert_eq!(&bs[..2], &[0xff, 0xd8]);
        let eoi = bs.windows(2).rposition(|w| w == [0xff, 0xd9]).unwrap();
        assert_eq!(&bs[eoi - 3..eoi], &[0x12, 0x34, 0x56]);
    }

    #[test]
    fn mpeg12_on_legacy_hardware_requests_software_fallback() {
        let backend = DummyBackend::new();
        let (cs, _log) = DummyStream::new();
        let handles = StreamHandleAllocator::new();
        let result = Decoder::open(
            backend,
            Box::new(cs),
            &handles,
            mpeg2_config(720, 576),
            DecoderCaps {
                hardware_mpeg12: false,
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(OpenError::SoftwareFallbackRequired)));
    }

    #[test]
    fn close_sends_destroy() {
        let (dec, _backend, log) = open_decoder(mpeg2_config(320, 240));
        let flushes_before = log
            .borrow()
            .iter()
            .filter(|op| matches!(op, StreamOp::Flush))
            .count();

        dec.close().unwrap();

        let flushes_after = log
            .borrow()
            .iter()
            .filter(|op| matches!(op, StreamOp::Flush))
            .count();
        assert_eq!(flushes_after, flushes_before + 1);
    }

    #[test]
    fn fence_timeout_is_surfaced() {
        let backend = DummyBackend::new();
        let (mut cs, _log) = DummyStream::new();
        cs.fail_waits();
        let handles = StreamHandleAllocator::new();
        let mut dec = Decoder::open(
            backend.clone(),
            Box::new(cs),
            &handles,
            mpeg2_config(320, 240),
            DecoderCaps::default(),
        )
        .unwrap();

        decode_one_frame(&mut dec, &backend, &[0u8; 16]);
        assert!(matches!(
            dec.get_decoder_fence(1_000_000),
            Err(DecodeError::DeviceTimeout)
        ));
    }
}
