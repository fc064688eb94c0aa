// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Encode engine firmware packet interfaces.
//!
//! Unlike the decode engine, the encode engine consumes dword packets straight
//! from the command ring. Every packet starts with its byte size followed by a
//! command word; the payload layouts changed across firmware generations, so
//! the interface generation is picked once at open time and dispatched through
//! [`FirmwareInterface`] from then on.

use std::fmt;
use std::rc::Rc;

use enumn::N;

use crate::device::Access;
use crate::device::CommandStream;
use crate::device::GpuResource;
use crate::device::MemoryDomain;
use crate::session::StreamHandle;
use crate::PictureType;
use crate::Resolution;

pub const CMD_SESSION: u32 = 0x0000_0001;
pub const CMD_TASK_INFO: u32 = 0x0000_0002;
pub const CMD_CREATE: u32 = 0x0100_0001;
pub const CMD_DESTROY: u32 = 0x0200_0001;
pub const CMD_ENCODE: u32 = 0x0300_0001;
pub const CMD_CONFIG_EXT: u32 = 0x0400_0001;
pub const CMD_PIC_CTRL: u32 = 0x0400_0002;
pub const CMD_RATE_CTRL: u32 = 0x0400_0005;
pub const CMD_MOTION_EST: u32 = 0x0400_0007;
pub const CMD_RDO: u32 = 0x0400_0008;
pub const CMD_FEEDBACK: u32 = 0x0500_0005;

/// Marks an absent reference entry in the encode packet.
pub const NO_REFERENCE: u32 = 0xffff_ffff;

pub const RC_METHOD_NONE: u32 = 0;
pub const RC_METHOD_CBR: u32 = 1;

/// Encoder firmware version, packed as (major, minor, revision) bytes the way
/// the firmware reports itself.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct FirmwareVersion(pub u32);

impl FirmwareVersion {
    pub const fn new(major: u32, minor: u32, revision: u32) -> Self {
        Self((major << 24) | (minor << 16) | (revision << 8))
    }

    pub fn major(self) -> u32 {
        self.0 >> 24
    }

    pub fn minor(self) -> u32 {
        (self.0 >> 16) & 0xff
    }

    pub fn revision(self) -> u32 {
        (self.0 >> 8) & 0xff
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major(), self.minor(), self.revision())
    }
}

impl fmt::Debug for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FirmwareVersion({})", self)
    }
}

/// Firmware builds validated against this driver.
#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
#[repr(u32)]
enum KnownVersion {
    V40_2_2 = (40 << 24) | (2 << 16) | (2 << 8),
    V50_0_1 = (50 << 24) | (1 << 8),
    V50_1_7 = (50 << 24) | (1 << 16) | (7 << 8),
    V50_17_3 = (50 << 24) | (17 << 16) | (3 << 8),
    V52_0_3 = (52 << 24) | (3 << 8),
    V52_4_3 = (52 << 24) | (4 << 16) | (3 << 8),
    V52_8_3 = (52 << 24) | (8 << 16) | (3 << 8),
}

/// Newer majors keep the newest known packet layout.
const NEWEST_MAJOR: u32 = 53;

/// Whether this driver can talk to `version`.
pub fn is_supported(version: FirmwareVersion) -> bool {
    KnownVersion::n(version.0).is_some() || version.major() >= NEWEST_MAJOR
}

/// Packet layout generations. Selected once at open time.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FirmwareInterface {
    Fw40,
    Fw50,
    Fw52,
}

/// Operation tag carried in a task-info packet.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum TaskOp {
    Create = 0,
    Destroy = 1,
    Encode = 3,
}

/// Session geometry, fixed at open time.
#[derive(Clone, Debug)]
pub struct CreateParams {
    pub profile_idc: u32,
    pub level_idc: u32,
    pub max_references: u32,
    pub resolution: Resolution,
}

/// Rate control state pushed by a config packet.
#[derive(Clone, Debug)]
pub struct RateControlParams {
    pub method: u32,
    pub target_bitrate: u32,
    pub peak_bitrate: u32,
    pub frame_rate_num: u32,
    pub frame_rate_den: u32,
    pub initial_qp: u32,
    pub min_qp: u32,
    pub max_qp: u32,
    pub vbv_buffer_size: u32,
}

/// Picture control state pushed by a config packet.
#[derive(Clone, Debug)]
pub struct PicControlParams {
    pub cabac_enable: bool,
    pub num_mbs: u32,
    pub num_references: u32,
}

/// One reference picture in the encode packet, resolved from the slot ledger.
#[derive(Copy, Clone, Debug)]
pub struct RefEntry {
    pub frame_num: u32,
    pub pic_order_cnt: u32,
    pub luma_offset: u32,
    pub chroma_offset: u32,
}

/// Per-frame encode command.
pub struct EncodeParams<'a> {
    pub picture_type: PictureType,
    pub frame_num: u32,
    pub pic_order_cnt: u32,
    pub allowed_max_bitstream_size: u32,
    pub source_luma: &'a Rc<dyn GpuResource>,
    pub source_chroma: &'a Rc<dyn GpuResource>,
    pub luma_pitch: u32,
    pub chroma_pitch: u32,
    pub cpb: &'a Rc<dyn GpuResource>,
    /// Offsets of the slot receiving the reconstructed picture.
    pub reconstructed: (u32, u32),
    pub l0: Option<RefEntry>,
    pub l1: Option<RefEntry>,
    /// Bitstream row buffer offsets inside the CPB, dual-pipe parts only.
    pub aux_offsets: &'a [u32],
    pub destination: &'a Rc<dyn GpuResource>,
}

fn picture_type_word(ty: PictureType) -> u32 {
    match ty {
        PictureType::Idr => 0,
        PictureType::I => 1,
        PictureType::P => 2,
        PictureType::B => 3,
        PictureType::Skip => 4,
    }
}

/// Packet under construction. The leading size dword is only known once the
/// packet is complete, so dwords are staged and emitted in one piece.
struct Packet<'a> {
    cs: &'a mut dyn CommandStream,
    dwords: Vec<u32>,
}

impl<'a> Packet<'a> {
    fn new(cs: &'a mut dyn CommandStream, cmd: u32) -> Self {
        Self {
            cs,
            dwords: vec![0, cmd],
        }
    }

    fn dword(&mut self, value: u32) {
        self.dwords.push(value);
    }

    /// References `res` from the submission and appends its address, high
    /// dword first.
    fn buffer(
        &mut self,
        res: &Rc<dyn GpuResource>,
        offset: u64,
        access: Access,
        domain: MemoryDomain,
    ) {
        self.cs.add_buffer(res, access, domain);
        let addr = res.virtual_address() + offset;
        self.dwords.push((addr >> 32) as u32);
        self.dwords.push(addr as u32);
    }

    fn finish(mut self) {
        self.dwords[0] = (self.dwords.len() * 4) as u32;
        self.cs.emit_slice(&self.dwords);
    }
}

impl FirmwareInterface {
    /// Picks the packet interface for `version`, or `None` when the version is
    /// not supported.
    pub fn pick(version: FirmwareVersion) -> Option<Self> {
        if !is_supported(version) {
            return None;
        }
        Some(match version.major() {
            ..=49 => FirmwareInterface::Fw40,
            50 => FirmwareInterface::Fw50,
            _ => FirmwareInterface::Fw52,
        })
    }

    /// Binds subsequent packets to a session. First packet of every
    /// submission.
    pub fn session(self, cs: &mut dyn CommandStream, handle: StreamHandle) {
        let mut p = Packet::new(cs, CMD_SESSION);
        p.dword(handle.0);
        p.finish();
    }

    pub fn task_info(self, cs: &mut dyn CommandStream, op: TaskOp, task_id: u32) {
        let mut p = Packet::new(cs, CMD_TASK_INFO);
        // Offset of the next task; the last task of a submission carries the
        // end marker.
        p.dword(0xffff_ffff);
        p.dword(op as u32);
        p.dword(task_id);
        if self == FirmwareInterface::Fw52 {
            // Feedback slot and bitstream ring index.
            p.dword(0);
            p.dword(0);
        }
        p.finish();
    }

    pub fn create(self, cs: &mut dyn CommandStream, params: &CreateParams) {
        let mut p = Packet::new(cs, CMD_CREATE);
        // Circular output buffer mode is never used.
        p.dword(0);
        p.dword(params.profile_idc);
        p.dword(params.level_idc);
        p.dword(params.max_references);
        p.dword(params.resolution.width);
        p.dword(params.resolution.height);
        if self == FirmwareInterface::Fw52 {
            // Pre-encode (two pass) mode off.
            p.dword(0);
            p.dword(0);
        }
        p.finish();
    }

    pub fn rate_control(self, cs: &mut dyn CommandStream, params: &RateControlParams) {
        let mut p = Packet::new(cs, CMD_RATE_CTRL);
        p.dword(params.method);
        p.dword(params.target_bitrate);
        p.dword(params.peak_bitrate);
        p.dword(params.frame_rate_num);
        p.dword(params.frame_rate_den);
        p.dword(params.initial_qp);
        p.dword(params.min_qp);
        p.dword(params.max_qp);
        if self != FirmwareInterface::Fw40 {
            p.dword(params.vbv_buffer_size);
        }
        p.finish();
    }

    pub fn config_ext(self, cs: &mut dyn CommandStream) {
        let mut p = Packet::new(cs, CMD_CONFIG_EXT);
        p.dword(0);
        p.finish();
    }

    pub fn motion_estimation(self, cs: &mut dyn CommandStream) {
        let mut p = Packet::new(cs, CMD_MOTION_EST);
        // 16x16 and 8x8 block search, quarter-pel refinement, fixed search
        // window.
        p.dword(1);
        p.dword(1);
        p.dword(16);
        p.dword(16);
        p.finish();
    }

    pub fn rdo(self, cs: &mut dyn CommandStream) {
        let mut p = Packet::new(cs, CMD_RDO);
        p.dword(1);
        p.finish();
    }

    pub fn pic_control(self, cs: &mut dyn CommandStream, params: &PicControlParams) {
        let mut p = Packet::new(cs, CMD_PIC_CTRL);
        p.dword(params.cabac_enable as u32);
        p.dword(params.num_mbs);
        p.dword(params.num_references);
        p.finish();
    }

    /// Points the firmware at the buffer it reports completion status into.
    pub fn feedback(self, cs: &mut dyn CommandStream, fb: &Rc<dyn GpuResource>) {
        let mut p = Packet::new(cs, CMD_FEEDBACK);
        p.buffer(fb, 0, Access::Write, MemoryDomain::Staging);
        // Linear mode, one feedback record.
        p.dword(0);
        p.dword(1);
        p.finish();
    }

    pub fn encode(self, cs: &mut dyn CommandStream, params: &EncodeParams) {
        let mut p = Packet::new(cs, CMD_ENCODE);
        // Stream headers ride ahead of IDR frames.
        p.dword((params.picture_type == PictureType::Idr) as u32);
        p.dword(params.allowed_max_bitstream_size);
        p.buffer(
            params.source_luma,
            0,
            Access::Read,
            MemoryDomain::Device,
        );
        p.buffer(
            params.source_chroma,
            0,
            Access::Read,
            MemoryDomain::Device,
        );
        p.dword(params.luma_pitch);
        p.dword(params.chroma_pitch);
        p.buffer(params.cpb, 0, Access::ReadWrite, MemoryDomain::Device);
        p.dword(params.reconstructed.0);
        p.dword(params.reconstructed.1);
        p.dword(picture_type_word(params.picture_type));
        p.dword(params.frame_num);
        p.dword(params.pic_order_cnt);
        for reference in [&params.l0, &params.l1] {
            match reference {
                Some(entry) => {
                    p.dword(entry.frame_num);
                    p.dword(entry.pic_order_cnt);
                    p.dword(entry.luma_offset);
                    p.dword(entry.chroma_offset);
                }
                None => {
                    p.dword(NO_REFERENCE);
                    p.dword(0);
                    p.dword(NO_REFERENCE);
                    p.dword(NO_REFERENCE);
                }
            }
        }
        p.buffer(params.destination, 0, Access::Write, MemoryDomain::Device);
        if self == FirmwareInterface::Fw52 {
            p.dword(params.aux_offsets.len() as u32);
            for &offset in params.aux_offsets {
                p.dword(offset);
            }
        }
        p.finish();
    }

    pub fn destroy(self, cs: &mut dyn CommandStream) {
        Packet::new(cs, CMD_DESTROY).finish();
    }
}
