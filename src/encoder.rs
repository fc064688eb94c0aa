// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Encode engine state machine.
//!
//! An [`Encoder`] owns the shared coded picture buffer, the slot ledger that
//! orders it, and the session lifecycle against the engine firmware. The
//! session is created lazily on the first frame: the firmware needs picture
//! geometry and rate-control state in its create/config packets, and those are
//! only trustworthy once the caller commits to a first picture.
//!
//! Completion is asynchronous. `encode_bitstream` hands back a token wrapping
//! the frame's feedback buffer; `get_feedback` reads the firmware's status
//! record out of it once the caller has waited on the submission fence.

pub mod cpb;
pub mod firmware;

use std::rc::Rc;

use byteorder::ByteOrder;
use byteorder::LittleEndian;
use log::debug;
use log::warn;
use thiserror::Error;

use crate::buffer::BufferError;
use crate::buffer::EngineBuffer;
use crate::device::CommandStream;
use crate::device::DeviceError;
use crate::device::FlushFlags;
use crate::device::GpuResource;
use crate::device::MemoryDomain;
use crate::device::ResourceBackend;
use crate::encoder::cpb::CpbLedger;
use crate::encoder::cpb::FrameFootprint;
use crate::encoder::firmware::CreateParams;
use crate::encoder::firmware::EncodeParams;
use crate::encoder::firmware::FirmwareInterface;
use crate::encoder::firmware::FirmwareVersion;
use crate::encoder::firmware::PicControlParams;
use crate::encoder::firmware::RateControlParams;
use crate::encoder::firmware::RefEntry;
use crate::encoder::firmware::TaskOp;
use crate::encoder::firmware::RC_METHOD_CBR;
use crate::encoder::firmware::RC_METHOD_NONE;
use crate::session::StreamHandle;
use crate::session::StreamHandleAllocator;
use crate::video_frame::VideoSurface;
use crate::PictureType;
use crate::Profile;
use crate::Resolution;

/// Most slots the coded picture buffer can hold.
pub const MAX_CPB_SLOTS: u32 = 16;
/// Auxiliary bitstream row buffers per encode pipe.
pub const MAX_AUX_BUFFER_NUM: u32 = 2;
/// Bytes of one auxiliary bitstream row.
const AUX_ROW_SIZE: u32 = 64 * 1024;
/// Bytes of the per-task feedback buffer.
pub const FEEDBACK_BUFFER_SIZE: usize = 512;

/// Feedback record dword indices, written by the firmware.
const FB_STATUS: usize = 1;
const FB_END_OFFSET: usize = 4;
const FB_START_OFFSET: usize = 9;

#[derive(Debug, Error)]
pub enum OpenError {
    #[error("encode firmware {0} is not supported")]
    UnsupportedFirmware(FirmwareVersion),
    #[error("codec/profile combination is not supported by this engine")]
    Unsupported,
    #[error("out of device memory")]
    OutOfMemory,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type OpenResult<T> = Result<T, OpenError>;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("out of device memory")]
    OutOfMemory,
    #[error("fence wait timed out")]
    DeviceTimeout,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type EncodeResult<T> = Result<T, EncodeError>;

impl From<BufferError> for OpenError {
    fn from(err: BufferError) -> Self {
        match err {
            BufferError::OutOfMemory => OpenError::OutOfMemory,
            other => OpenError::Other(other.into()),
        }
    }
}

impl From<BufferError> for EncodeError {
    fn from(err: BufferError) -> Self {
        match err {
            BufferError::OutOfMemory => EncodeError::OutOfMemory,
            other => EncodeError::Other(other.into()),
        }
    }
}

impl From<DeviceError> for EncodeError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::OutOfMemory => EncodeError::OutOfMemory,
            DeviceError::Timeout => EncodeError::DeviceTimeout,
            other => EncodeError::Other(other.into()),
        }
    }
}

/// Specifies the rate control operation of the encode engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateControl {
    /// The encoder shall maintain the constant bitrate, in bits per second.
    ConstantBitrate(u64),

    /// The encoder shall keep the quantization parameter constant,
    /// disregarding bitrate.
    ConstantQuality(u32),
}

/// Dynamic parameters of the encoded stream that the client may change during
/// the encoding session without recreating the encoder instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunings {
    pub rate_control: RateControl,
    /// Stream framerate in frames per second.
    pub framerate: u32,
    /// Minimum quantization parameter.
    pub min_quality: u32,
    /// Maximum quantization parameter.
    pub max_quality: u32,
}

impl Default for Tunings {
    fn default() -> Self {
        Self {
            rate_control: RateControl::ConstantBitrate(200_000),
            framerate: 30,
            min_quality: 0,
            max_quality: 51,
        }
    }
}

/// Hardware capabilities relevant to the encode engine.
#[derive(Clone, Debug)]
pub struct EncoderCaps {
    pub firmware_version: FirmwareVersion,
    /// Two encode pipes share the work of one frame; extra row buffers ride
    /// at the end of the CPB allocation.
    pub dual_pipe: bool,
    /// A second engine instance exists and frames may be batched in pairs per
    /// submission.
    pub dual_instance: bool,
}

impl Default for EncoderCaps {
    fn default() -> Self {
        Self {
            firmware_version: FirmwareVersion::new(52, 8, 3),
            dual_pipe: false,
            dual_instance: false,
        }
    }
}

/// Session parameters fixed at open time, except for [`Tunings`] which may be
/// replaced between frames through [`Encoder::tune`].
#[derive(Clone, Debug)]
pub struct EncoderConfig {
    pub profile: Profile,
    pub level: u32,
    pub resolution: Resolution,
    pub max_references: u32,
    pub tunings: Tunings,
}

/// Caller-supplied description of the picture being encoded.
#[derive(Clone, Debug)]
pub struct EncodePicture {
    pub picture_type: PictureType,
    pub frame_num: u32,
    pub pic_order_cnt: u32,
    /// `frame_num` of the forward reference, P and B pictures only.
    pub l0_frame_num: u32,
    /// `frame_num` of the backward reference, B pictures only.
    pub l1_frame_num: u32,
    /// The reconstructed picture will not serve as a reference.
    pub not_referenced: bool,
}

/// Handle to one frame's feedback buffer. Redeemed through
/// [`Encoder::get_feedback`] after the submission fence has signalled.
pub struct FeedbackToken {
    buffer: EngineBuffer,
}

/// Number of CPB slots for a level and picture geometry.
pub fn cpb_slot_count(level: u32, resolution: Resolution) -> u32 {
    // H.264 table A-1, max decoded picture buffer size in macroblocks.
    let dpb_in_mbs = match level {
        10 => 396,
        11 => 900,
        12 | 13 | 20 => 2376,
        21 => 4752,
        22 | 30 => 8100,
        31 => 18000,
        32 => 20480,
        40 | 41 => 32768,
        42 => 34816,
        50 => 110400,
        _ => 184320,
    };
    let fs_in_mb = resolution.width_in_mbs() * resolution.height_in_mbs();
    (dpb_in_mbs / fs_in_mb).clamp(1, MAX_CPB_SLOTS)
}

/// Encode engine session.
pub struct Encoder {
    backend: Rc<dyn ResourceBackend>,
    cs: Box<dyn CommandStream>,
    handles: Rc<StreamHandleAllocator>,

    interface: FirmwareInterface,
    config: EncoderConfig,
    profile_idc: u32,
    dual_pipe: bool,
    dual_instance: bool,

    footprint: FrameFootprint,
    ledger: CpbLedger,
    cpb: EngineBuffer,

    stream_handle: Option<StreamHandle>,
    /// Tunings last pushed to the firmware; diverges from `config.tunings`
    /// after `tune` until the next frame reconfigures.
    active_tunings: Tunings,
    source: Option<Rc<dyn VideoSurface>>,
    pending: Option<EncodePicture>,
    task_id: u32,
    frames_in_flight: u32,
}

impl Encoder {
    /// Validates firmware support and allocates the coded picture buffer. No
    /// packets reach the engine until the first frame.
    pub fn open(
        backend: Rc<dyn ResourceBackend>,
        cs: Box<dyn CommandStream>,
        handles: Rc<StreamHandleAllocator>,
        config: EncoderConfig,
        caps: EncoderCaps,
    ) -> OpenResult<Self> {
        let interface = FirmwareInterface::pick(caps.firmware_version)
            .ok_or(OpenError::UnsupportedFirmware(caps.firmware_version))?;

        let profile_idc = match config.profile {
            Profile::H264Baseline => 66,
            Profile::H264Main => 77,
            Profile::H264High => 100,
            _ => return Err(OpenError::Unsupported),
        };

        let footprint = FrameFootprint::new(config.resolution);
        let cpb_num = cpb_slot_count(config.level, config.resolution);
        let mut cpb_size = cpb_num * footprint.frame_size();
        if caps.dual_pipe {
            cpb_size += MAX_AUX_BUFFER_NUM * AUX_ROW_SIZE * 2;
        }
        let cpb = EngineBuffer::create(&*backend, cpb_size as usize, MemoryDomain::Device)?;
        let ledger = CpbLedger::new(cpb_num as usize, footprint);

        debug!(
            "opened encoder ({} interface {:?}), {} cpb slots, {} bytes",
            caps.firmware_version, interface, cpb_num, cpb_size
        );

        let active_tunings = config.tunings.clone();
        Ok(Self {
            backend,
            cs,
            handles,
            interface,
            config,
            profile_idc,
            dual_pipe: caps.dual_pipe,
            dual_instance: caps.dual_instance,
            footprint,
            ledger,
            cpb,
            stream_handle: None,
            active_tunings,
            source: None,
            pending: None,
            task_id: 0,
            frames_in_flight: 0,
        })
    }

    /// Replaces the stream tunings. Takes effect at the next `begin_frame`,
    /// which reconfigures the running session.
    pub fn tune(&mut self, tunings: Tunings) {
        self.config.tunings = tunings;
    }

    /// Starts a frame read from `source`.
    ///
    /// The first frame creates and configures the firmware session. An IDR
    /// picture resets the slot ledger; P and B pictures promote their
    /// references toward the head.
    pub fn begin_frame(
        &mut self,
        source: Rc<dyn VideoSurface>,
        pic: &EncodePicture,
    ) -> EncodeResult<()> {
        if self.stream_handle.is_none() {
            self.create_session()?;
        } else if self.config.tunings != self.active_tunings {
            // Reconfigure in place; the session survives rate control
            // changes.
            if let Some(handle) = self.stream_handle {
                self.interface.session(&mut *self.cs, handle);
                self.emit_config();
            }
            self.active_tunings = self.config.tunings.clone();
        }

        match pic.picture_type {
            PictureType::Idr => self.ledger.reset(),
            ty if ty.is_inter() => {
                let l0 = self.ledger.ref_pic_idx(pic.frame_num, pic.l0_frame_num);
                let l1 = if ty == PictureType::B {
                    self.ledger.ref_pic_idx(pic.frame_num, pic.l1_frame_num)
                } else {
                    0
                };
                self.ledger.promote_for(ty, l0, l1);
            }
            _ => (),
        }

        self.source = Some(source);
        self.pending = Some(pic.clone());
        Ok(())
    }

    /// Records the encode task for the current frame, targeting
    /// `destination` for the compressed output.
    ///
    /// Returns immediately; completion is observed through the returned
    /// token. Without a paired `begin_frame` the token reads back as an empty
    /// frame.
    pub fn encode_bitstream(
        &mut self,
        destination: &Rc<dyn GpuResource>,
    ) -> EncodeResult<FeedbackToken> {
        let fb = EngineBuffer::create(&*self.backend, FEEDBACK_BUFFER_SIZE, MemoryDomain::Staging)?;

        let (Some(source), Some(pic), Some(handle)) =
            (self.source.clone(), self.pending.clone(), self.stream_handle)
        else {
            warn!("encode_bitstream without a begun frame");
            return Ok(FeedbackToken { buffer: fb });
        };

        // One session packet per submission.
        if self.cs.num_emitted() == 0 {
            self.interface.session(&mut *self.cs, handle);
        }
        self.task_id += 1;
        self.interface
            .task_info(&mut *self.cs, TaskOp::Encode, self.task_id);

        let reconstructed = self.ledger.frame_offset(self.ledger.current());
        let l0 = pic
            .picture_type
            .is_inter()
            .then(|| self.ref_entry(self.ledger.l0()));
        let l1 = (pic.picture_type == PictureType::B).then(|| self.ref_entry(self.ledger.l1()));

        let aux_offsets = self.aux_offsets();
        let luma = source.plane_resource(0);
        let chroma = source.plane_resource(source.num_planes().min(2) - 1);
        let params = EncodeParams {
            picture_type: pic.picture_type,
            frame_num: pic.frame_num,
            pic_order_cnt: pic.pic_order_cnt,
            allowed_max_bitstream_size: destination.size() as u32,
            source_luma: luma,
            source_chroma: chroma,
            luma_pitch: source.plane_layout(0).pitch,
            chroma_pitch: source.plane_layout(source.num_planes().min(2) - 1).pitch,
            cpb: self.cpb.resource()?,
            reconstructed,
            l0,
            l1,
            aux_offsets: &aux_offsets,
            destination,
        };
        self.interface.encode(&mut *self.cs, &params);
        self.interface.feedback(&mut *self.cs, fb.resource()?);

        self.frames_in_flight += 1;
        Ok(FeedbackToken { buffer: fb })
    }

    /// Finishes the current frame and records it in the slot ledger.
    ///
    /// Submissions are batched in pairs when a second engine instance can
    /// drain them; otherwise every frame flushes. Without a paired
    /// `begin_frame` this is a no-op.
    pub fn end_frame(&mut self, pic: &EncodePicture) -> EncodeResult<()> {
        if self.pending.take().is_none() {
            return Ok(());
        }
        self.source = None;

        if !self.dual_instance || self.frames_in_flight > 1 {
            self.cs.flush(FlushFlags { asynchronous: true })?;
            self.frames_in_flight = 0;
        }

        if pic.picture_type != PictureType::Skip {
            self.ledger.commit(
                pic.picture_type,
                pic.frame_num,
                pic.pic_order_cnt,
                !pic.not_referenced,
            );
        }
        Ok(())
    }

    /// Reads the bitstream size out of a completed frame's feedback buffer
    /// and releases it.
    ///
    /// The caller must have waited on the submission fence first; the only
    /// blocking here is the map itself. A zero status word means the firmware
    /// produced no bitstream for this frame, reported as size 0.
    pub fn get_feedback(&self, token: FeedbackToken) -> EncodeResult<u32> {
        let mut token = token;
        let size = {
            let res = token.buffer.resource()?;
            let map = res.map()?;
            let record = map.as_slice();
            let dword = |idx: usize| LittleEndian::read_u32(&record[idx * 4..idx * 4 + 4]);

            if dword(FB_STATUS) == 0 {
                0
            } else {
                dword(FB_END_OFFSET).saturating_sub(dword(FB_START_OFFSET))
            }
        };
        token.buffer.destroy();
        Ok(size)
    }

    /// Tears the session down. A session that was never created (no frame
    /// encoded) needs no destroy handshake.
    pub fn close(mut self) -> EncodeResult<()> {
        if let Some(handle) = self.stream_handle {
            self.interface.session(&mut *self.cs, handle);
            self.task_id += 1;
            self.interface
                .task_info(&mut *self.cs, TaskOp::Destroy, self.task_id);
            self.interface.destroy(&mut *self.cs);
            self.cs.flush(FlushFlags::default())?;
        }
        self.cpb.destroy();
        Ok(())
    }

    /// Creates and configures the firmware session. The setup task wants a
    /// feedback target like any other, served by a throwaway buffer.
    fn create_session(&mut self) -> EncodeResult<()> {
        let handle = self.handles.next();
        self.stream_handle = Some(handle);

        let mut fb = EngineBuffer::create(&*self.backend, FEEDBACK_BUFFER_SIZE, MemoryDomain::Staging)?;
        self.interface.session(&mut *self.cs, handle);
        self.task_id += 1;
        self.interface
            .task_info(&mut *self.cs, TaskOp::Create, self.task_id);
        self.interface.create(
            &mut *self.cs,
            &CreateParams {
                profile_idc: self.profile_idc,
                level_idc: self.config.level,
                max_references: self.config.max_references,
                resolution: self.config.resolution,
            },
        );
        self.emit_config();
        self.interface.feedback(&mut *self.cs, fb.resource()?);
        self.cs.flush(FlushFlags::default())?;
        fb.destroy();

        self.active_tunings = self.config.tunings.clone();
        debug!("created encode session {:08x}", handle.0);
        Ok(())
    }

    fn emit_config(&mut self) {
        let rc = rate_control_params(&self.config.tunings);
        self.interface.rate_control(&mut *self.cs, &rc);
        self.interface.config_ext(&mut *self.cs);
        self.interface.motion_estimation(&mut *self.cs);
        self.interface.rdo(&mut *self.cs);
        self.interface.pic_control(
            &mut *self.cs,
            &PicControlParams {
                // Baseline profile has no CABAC.
                cabac_enable: self.profile_idc != 66,
                num_mbs: self.config.resolution.width_in_mbs()
                    * self.config.resolution.height_in_mbs(),
                num_references: self.config.max_references,
            },
        );
    }

    fn ref_entry(&self, slot: &cpb::CpbSlot) -> RefEntry {
        let (luma_offset, chroma_offset) = self.ledger.frame_offset(slot);
        RefEntry {
            frame_num: slot.frame_num,
            pic_order_cnt: slot.pic_order_cnt,
            luma_offset,
            chroma_offset,
        }
    }

    /// Row buffer offsets behind the last CPB slot, dual-pipe only.
    fn aux_offsets(&self) -> Vec<u32> {
        if !self.dual_pipe {
            return Vec::new();
        }
        let base = self.ledger.len() as u32 * self.footprint.frame_size();
        (0..MAX_AUX_BUFFER_NUM * 2)
            .map(|i| base + i * AUX_ROW_SIZE)
            .collect()
    }
}

/// Maps the stream tunings onto the firmware's rate control packet.
fn rate_control_params(tunings: &Tunings) -> RateControlParams {
    let (method, target_bitrate, initial_qp, min_qp, max_qp) = match tunings.rate_control {
        RateControl::ConstantBitrate(bps) => (
            RC_METHOD_CBR,
            bps as u32,
            26,
            tunings.min_quality,
            tunings.max_quality.min(51),
        ),
        RateControl::ConstantQuality(qp) => {
            let qp = qp.min(51);
            (RC_METHOD_NONE, 0, qp, qp, qp)
        }
    };

    RateControlParams {
        method,
        target_bitrate,
        peak_bitrate: target_bitrate + target_bitrate / 2,
        frame_rate_num: tunings.framerate,
        frame_rate_den: 1,
        initial_qp,
        min_qp,
        max_qp,
        // One second worth of stream.
        vbv_buffer_size: target_bitrate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::dummy::DummyBackend;
    use crate::device::dummy::DummyStream;
    use crate::device::dummy::StreamLog;
    use crate::device::dummy::StreamOp;
    use crate::device::Access;
    use crate::video_frame::tests::FakeSurface;

    /// 176x144 is 99 macroblocks; level 10 allows 396, giving 4 CPB slots.
    fn qcif_config() -> EncoderConfig {
        EncoderConfig {
            profile: Profile::H264Main,
            level: 10,
            resolution: Resolution::from((176, 144)),
            max_references: 1,
            tunings: Tunings::default(),
        }
    }

    fn open_encoder(
        config: EncoderConfig,
        caps: EncoderCaps,
    ) -> (Encoder, Rc<DummyBackend>, StreamLog) {
        let _ = env_logger::builder().is_test(true).try_init();
        let backend = DummyBackend::new();
        let (cs, log) = DummyStream::new();
        let enc = Encoder::open(
            backend.clone(),
            Box::new(cs),
            Rc::new(StreamHandleAllocator::new()),
            config,
            caps,
        )
        .unwrap();
        (enc, backend, log)
    }

    fn idr(frame_num: u32) -> EncodePicture {
        EncodePicture {
            picture_type: PictureType::Idr,
            frame_num,
            pic_order_cnt: frame_num * 2,
            l0_frame_num: 0,
            l1_frame_num: 0,
            not_referenced: false,
        }
    }

    fn p_frame(frame_num: u32) -> EncodePicture {
        EncodePicture {
            picture_type: PictureType::P,
            frame_num,
            pic_order_cnt: frame_num * 2,
            l0_frame_num: frame_num - 1,
            l1_frame_num: 0,
            not_referenced: false,
        }
    }

    fn encode_one_frame(
        enc: &mut Encoder,
        backend: &Rc<DummyBackend>,
        pic: &EncodePicture,
    ) -> FeedbackToken {
        let source = Rc::new(FakeSurface::nv12(backend, enc.config.resolution));
        let destination = backend
            .create_resource(0x10000, MemoryDomain::Device)
            .unwrap();
        enc.begin_frame(source, pic).unwrap();
        let token = enc.encode_bitstream(&destination).unwrap();
        enc.end_frame(pic).unwrap();
        token
    }

    fn emitted_cmds(log: &StreamLog) -> Vec<u32> {
        // Packet command words follow each packet's size dword.
        let ops = log.borrow();
        let dwords: Vec<u32> = ops
            .iter()
            .filter_map(|op| match op {
                StreamOp::Emit(dword) => Some(*dword),
                _ => None,
            })
            .collect();
        let mut cmds = Vec::new();
        let mut at = 0;
        while at < dwords.len() {
            cmds.push(dwords[at + 1]);
            at += dwords[at] as usize / 4;
        }
        cmds
    }

    #[test]
    fn unsupported_firmware_is_rejected() {
        let backend = DummyBackend::new();
        let (cs, _log) = DummyStream::new();
        let result = Encoder::open(
            backend,
            Box::new(cs),
            Rc::new(StreamHandleAllocator::new()),
            qcif_config(),
            EncoderCaps {
                firmware_version: FirmwareVersion::new(39, 0, 0),
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(OpenError::UnsupportedFirmware(_))));
    }

    #[test]
    fn non_h264_profiles_are_rejected() {
        let backend = DummyBackend::new();
        let (cs, _log) = DummyStream::new();
        let result = Encoder::open(
            backend,
            Box::new(cs),
            Rc::new(StreamHandleAllocator::new()),
            EncoderConfig {
                profile: Profile::Mpeg2Main,
                ..qcif_config()
            },
            EncoderCaps::default(),
        );
        assert!(matches!(result, Err(OpenError::Unsupported)));
    }

    #[test]
    fn cpb_is_sized_from_the_level_table() {
        let (enc, _backend, _log) = open_encoder(qcif_config(), EncoderCaps::default());
        assert_eq!(enc.ledger.len(), 4);
        assert_eq!(
            enc.cpb.size(),
            4 * enc.footprint.frame_size() as usize
        );
    }

    #[test]
    fn cpb_slots_are_clamped_to_the_hardware_maximum() {
        let config = EncoderConfig {
            level: 51,
            ..qcif_config()
        };
        let (enc, _backend, _log) = open_encoder(config, EncoderCaps::default());
        assert_eq!(enc.ledger.len(), MAX_CPB_SLOTS as usize);
    }

    #[test]
    fn dual_pipe_reserves_row_buffers() {
        let (plain, _, _) = open_encoder(qcif_config(), EncoderCaps::default());
        let (dual, _, _) = open_encoder(
            qcif_config(),
            EncoderCaps {
                dual_pipe: true,
                ..Default::default()
            },
        );
        assert_eq!(
            dual.cpb.size(),
            plain.cpb.size() + (MAX_AUX_BUFFER_NUM * AUX_ROW_SIZE * 2) as usize
        );
    }

    #[test]
    fn open_is_lazy() {
        let (_enc, _backend, log) = open_encoder(qcif_config(), EncoderCaps::default());
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn first_frame_creates_the_session() {
        let (mut enc, backend, log) = open_encoder(qcif_config(), EncoderCaps::default());

        let source = Rc::new(FakeSurface::nv12(&backend, enc.config.resolution));
        enc.begin_frame(source, &idr(0)).unwrap();

        let cmds = emitted_cmds(&log);
        assert_eq!(cmds[0], firmware::CMD_SESSION);
        assert_eq!(cmds[1], firmware::CMD_TASK_INFO);
        assert_eq!(cmds[2], firmware::CMD_CREATE);
        assert!(cmds.contains(&firmware::CMD_RATE_CTRL));
        assert!(cmds.contains(&firmware::CMD_FEEDBACK));
        // The setup handshake flushed synchronously.
        assert!(log.borrow().iter().any(|op| matches!(op, StreamOp::Flush)));
    }

    #[test]
    fn session_is_created_once() {
        let (mut enc, backend, log) = open_encoder(qcif_config(), EncoderCaps::default());

        let token = encode_one_frame(&mut enc, &backend, &idr(0));
        enc.get_feedback(token).unwrap();
        let token = encode_one_frame(&mut enc, &backend, &p_frame(1));
        enc.get_feedback(token).unwrap();

        let creates = emitted_cmds(&log)
            .iter()
            .filter(|&&cmd| cmd == firmware::CMD_CREATE)
            .count();
        assert_eq!(creates, 1);
    }

    #[test]
    fn tune_reconfigures_without_recreating() {
        let (mut enc, backend, log) = open_encoder(qcif_config(), EncoderCaps::default());
        encode_one_frame(&mut enc, &backend, &idr(0));
        let configs_before = emitted_cmds(&log)
            .iter()
            .filter(|&&cmd| cmd == firmware::CMD_RATE_CTRL)
            .count();

        enc.tune(Tunings {
            rate_control: RateControl::ConstantBitrate(800_000),
            ..Tunings::default()
        });
        encode_one_frame(&mut enc, &backend, &p_frame(1));

        let cmds = emitted_cmds(&log);
        let configs = cmds.iter().filter(|&&cmd| cmd == firmware::CMD_RATE_CTRL).count();
        let creates = cmds.iter().filter(|&&cmd| cmd == firmware::CMD_CREATE).count();
        let destroys = cmds.iter().filter(|&&cmd| cmd == firmware::CMD_DESTROY).count();
        assert_eq!(configs, configs_before + 1);
        assert_eq!(creates, 1);
        assert_eq!(destroys, 0);
    }

    #[test]
    fn unchanged_tunings_do_not_reconfigure() {
        let (mut enc, backend, log) = open_encoder(qcif_config(), EncoderCaps::default());
        encode_one_frame(&mut enc, &backend, &idr(0));
        let configs_before = emitted_cmds(&log)
            .iter()
            .filter(|&&cmd| cmd == firmware::CMD_RATE_CTRL)
            .count();

        enc.tune(Tunings::default());
        encode_one_frame(&mut enc, &backend, &p_frame(1));

        let configs = emitted_cmds(&log)
            .iter()
            .filter(|&&cmd| cmd == firmware::CMD_RATE_CTRL)
            .count();
        assert_eq!(configs, configs_before);
    }

    #[test]
    fn low_delay_gop_keeps_most_recent_reference() {
        // I,P,P,P,P against the 4-slot QCIF ledger.
        let (mut enc, backend, _log) = open_encoder(qcif_config(), EncoderCaps::default());

        encode_one_frame(&mut enc, &backend, &idr(0));
        for frame_num in 1..5 {
            encode_one_frame(&mut enc, &backend, &p_frame(frame_num));
        }

        assert_eq!(enc.ledger.l0().frame_num, 4);
    }

    #[test]
    fn every_frame_flushes_without_dual_instance() {
        let (mut enc, backend, log) = open_encoder(qcif_config(), EncoderCaps::default());

        encode_one_frame(&mut enc, &backend, &idr(0));
        let flushes = |log: &StreamLog| {
            log.borrow()
                .iter()
                .filter(|op| matches!(op, StreamOp::Flush))
                .count()
        };
        // Session create plus the frame itself.
        assert_eq!(flushes(&log), 2);

        encode_one_frame(&mut enc, &backend, &p_frame(1));
        assert_eq!(flushes(&log), 3);
    }

    #[test]
    fn dual_instance_batches_two_frames_per_flush() {
        let (mut enc, backend, log) = open_encoder(
            qcif_config(),
            EncoderCaps {
                dual_instance: true,
                ..Default::default()
            },
        );

        let flushes = |log: &StreamLog| {
            log.borrow()
                .iter()
                .filter(|op| matches!(op, StreamOp::Flush))
                .count()
        };

        encode_one_frame(&mut enc, &backend, &idr(0));
        // Only the session create handshake has flushed.
        assert_eq!(flushes(&log), 1);

        encode_one_frame(&mut enc, &backend, &p_frame(1));
        assert_eq!(flushes(&log), 2);

        encode_one_frame(&mut enc, &backend, &p_frame(2));
        assert_eq!(flushes(&log), 2);
        encode_one_frame(&mut enc, &backend, &p_frame(3));
        assert_eq!(flushes(&log), 3);
    }

    #[test]
    fn encode_references_cpb_and_destination() {
        let (mut enc, backend, log) = open_encoder(qcif_config(), EncoderCaps::default());

        let source = Rc::new(FakeSurface::nv12(&backend, enc.config.resolution));
        let destination = backend
            .create_resource(0x10000, MemoryDomain::Device)
            .unwrap();
        enc.begin_frame(source, &idr(0)).unwrap();
        enc.encode_bitstream(&destination).unwrap();

        let cpb_va = enc.cpb.resource().unwrap().virtual_address();
        let ops = log.borrow();
        assert!(ops.iter().any(|op| matches!(
            op,
            StreamOp::AddBuffer { va, access: Access::ReadWrite, .. } if *va == cpb_va
        )));
        assert!(ops.iter().any(|op| matches!(
            op,
            StreamOp::AddBuffer { va, access: Access::Write, .. }
                if *va == destination.virtual_address()
        )));
    }

    #[test]
    fn empty_feedback_reports_zero_size() {
        let (mut enc, backend, _log) = open_encoder(qcif_config(), EncoderCaps::default());
        let token = encode_one_frame(&mut enc, &backend, &idr(0));

        // The firmware never wrote the status word.
        assert_eq!(enc.get_feedback(token).unwrap(), 0);
    }

    #[test]
    fn feedback_size_is_the_offset_difference() {
        let (mut enc, backend, _log) = open_encoder(qcif_config(), EncoderCaps::default());
        let token = encode_one_frame(&mut enc, &backend, &idr(0));

        {
            let res = token.buffer.resource().unwrap();
            let mut map = res.map().unwrap();
            let record = map.as_mut_slice();
            record[FB_STATUS * 4..FB_STATUS * 4 + 4].copy_from_slice(&1u32.to_le_bytes());
            record[FB_END_OFFSET * 4..FB_END_OFFSET * 4 + 4]
                .copy_from_slice(&0x1400u32.to_le_bytes());
            record[FB_START_OFFSET * 4..FB_START_OFFSET * 4 + 4]
                .copy_from_slice(&0x400u32.to_le_bytes());
        }

        assert_eq!(enc.get_feedback(token).unwrap(), 0x1000);
    }

    #[test]
    fn encode_bitstream_without_begin_yields_empty_token() {
        let (mut enc, backend, log) = open_encoder(qcif_config(), EncoderCaps::default());
        let destination = backend
            .create_resource(0x10000, MemoryDomain::Device)
            .unwrap();

        let token = enc.encode_bitstream(&destination).unwrap();

        // Nothing was recorded and the token reads back empty.
        assert!(log.borrow().is_empty());
        assert_eq!(enc.get_feedback(token).unwrap(), 0);
    }

    #[test]
    fn end_frame_without_begin_is_a_noop() {
        let (mut enc, _backend, log) = open_encoder(qcif_config(), EncoderCaps::default());
        enc.end_frame(&idr(0)).unwrap();
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn close_without_frames_skips_the_destroy_handshake() {
        let (enc, _backend, log) = open_encoder(qcif_config(), EncoderCaps::default());
        enc.close().unwrap();
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn close_destroys_a_live_session() {
        let (mut enc, backend, log) = open_encoder(qcif_config(), EncoderCaps::default());
        encode_one_frame(&mut enc, &backend, &idr(0));

        enc.close().unwrap();

        let cmds = emitted_cmds(&log);
        assert_eq!(cmds[cmds.len() - 2], firmware::CMD_TASK_INFO);
        assert_eq!(*cmds.last().unwrap(), firmware::CMD_DESTROY);
    }

    #[test]
    fn skipped_pictures_do_not_touch_the_ledger() {
        let (mut enc, backend, _log) = open_encoder(qcif_config(), EncoderCaps::default());
        encode_one_frame(&mut enc, &backend, &idr(0));
        let head_before = enc.ledger.l0().frame_num;

        let skip = EncodePicture {
            picture_type: PictureType::Skip,
            frame_num: 1,
            pic_order_cnt: 2,
            l0_frame_num: 0,
            l1_frame_num: 0,
            not_referenced: true,
        };
        encode_one_frame(&mut enc, &backend, &skip);

        assert_eq!(enc.ledger.l0().frame_num, head_before);
    }
}
