// SPDX-License-Identifier: GPL-3.0-only

//! In-memory DRM device.
//!
//! Used by the test suite and by `SWL_KMS_DEVICE=mock` to run the whole
//! backend headless. Every call is recorded, blobs and framebuffers are
//! tracked so leaks are observable, and failures can be scripted per
//! operation. Page-flip events stay pending until [`MockKernel::complete_flips`]
//! plays the part of the vblank.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    io,
    os::fd::OwnedFd,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use super::{
    AtomicRequest, CommitFlags, FlipEvent, KernelDevice, ObjectType, RawConnector, RawCrtc,
    RawPlane, RawProperty, RawResources,
};
use crate::backend::kms::{
    buffer::BufferLayout, drm_helpers::DRM_FORMAT_MOD_LINEAR, resources::Mode,
};

pub const XRGB8888: u32 = 0x3432_5258;
pub const ARGB8888: u32 = 0x3432_5241;

#[derive(Debug, Clone, PartialEq)]
pub enum KernelCall {
    AtomicCommit {
        request: AtomicRequest,
        flags: CommitFlags,
    },
    CreateBlob {
        id: u32,
        data: Vec<u8>,
    },
    DestroyBlob(u32),
    SetCrtc {
        crtc: u32,
        fb: Option<u32>,
        connectors: Vec<u32>,
        mode: Option<Mode>,
    },
    PageFlip {
        crtc: u32,
        fb: u32,
    },
    SetCursor2 {
        crtc: u32,
        handle: u32,
        size: (u32, u32),
        hotspot: (i32, i32),
    },
    SetCursor {
        crtc: u32,
        handle: u32,
        size: (u32, u32),
    },
    MoveCursor {
        crtc: u32,
        pos: (i32, i32),
    },
    SetProperty {
        object: u32,
        prop: u32,
        value: u64,
    },
    SetGamma {
        crtc: u32,
        size: usize,
    },
    AddFramebuffer(u32),
    RemoveFramebuffer(u32),
}

/// Operations whose outcome can be scripted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    AtomicCommit,
    CreateBlob,
    SetCrtc,
    PageFlip,
    SetCursor2,
    SetCursor,
    MoveCursor,
    SetProperty,
    SetGamma,
    AddFramebuffer,
}

#[derive(Default)]
struct MockState {
    resources: RawResources,
    atomic: bool,
    calls: Vec<KernelCall>,
    live_blobs: HashSet<u32>,
    blobs_created: usize,
    live_fbs: HashSet<u32>,
    fbs_created: usize,
    next_id: u32,
    /// errno per call, 0 meaning success
    scripted: HashMap<MockOp, VecDeque<i32>>,
    persistent: HashMap<MockOp, i32>,
    pending_events: Vec<FlipEvent>,
    ready_events: Vec<FlipEvent>,
    sequence: u32,
}

impl MockState {
    fn outcome(&mut self, op: MockOp) -> io::Result<()> {
        let errno = match self.scripted.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(errno) => errno,
            None => self.persistent.get(&op).copied().unwrap_or(0),
        };
        match errno {
            0 => Ok(()),
            errno => Err(io::Error::from_raw_os_error(errno)),
        }
    }

    fn alloc_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn queue_flip(&mut self, crtc_id: u32) {
        self.sequence += 1;
        let usec = self.sequence as u64 * 16_667;
        self.pending_events.push(FlipEvent {
            crtc_id,
            sequence: self.sequence,
            tv_sec: (usec / 1_000_000) as u32,
            tv_usec: (usec % 1_000_000) as u32,
        });
    }

    /// CRTCs an atomic request touches, directly or through a CRTC_ID write
    fn crtcs_in(&self, request: &AtomicRequest) -> Vec<u32> {
        let crtc_ids: HashSet<u32> = self.resources.crtcs.iter().map(|c| c.id).collect();
        let crtc_id_props: HashSet<u32> = self
            .resources
            .planes
            .iter()
            .flat_map(|p| p.props.iter())
            .chain(self.resources.connectors.iter().flat_map(|c| c.props.iter()))
            .filter(|prop| prop.name == "CRTC_ID")
            .map(|prop| prop.id)
            .collect();

        let mut crtcs = Vec::new();
        for (object, prop, value) in request.iter() {
            let crtc = if crtc_ids.contains(&object) {
                Some(object)
            } else if crtc_id_props.contains(&prop) && value != 0 {
                Some(value as u32)
            } else {
                None
            };
            if let Some(crtc) = crtc.filter(|crtc| !crtcs.contains(crtc)) {
                crtcs.push(crtc);
            }
        }
        crtcs
    }
}

/// Cheaply cloneable handle to one in-memory device
#[derive(Clone)]
pub struct MockKernel {
    state: Arc<Mutex<MockState>>,
}

impl MockKernel {
    pub fn new(resources: RawResources, atomic: bool) -> Self {
        MockKernel {
            state: Arc::new(Mutex::new(MockState {
                resources,
                atomic,
                next_id: 500,
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue per-call outcomes for `op`; `0` lets a call succeed
    pub fn script(&self, op: MockOp, errnos: impl IntoIterator<Item = i32>) {
        self.lock().scripted.entry(op).or_default().extend(errnos);
    }

    /// Fail every call to `op` once the script for it is exhausted
    pub fn fail_always(&self, op: MockOp, errno: i32) {
        self.lock().persistent.insert(op, errno);
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.scripted.clear();
        state.persistent.clear();
    }

    pub fn set_resources(&self, resources: RawResources) {
        self.lock().resources = resources;
    }

    pub fn calls(&self) -> Vec<KernelCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn live_blobs(&self) -> usize {
        self.lock().live_blobs.len()
    }

    pub fn blobs_created(&self) -> usize {
        self.lock().blobs_created
    }

    pub fn framebuffers_created(&self) -> usize {
        self.lock().fbs_created
    }

    pub fn live_framebuffers(&self) -> usize {
        self.lock().live_fbs.len()
    }

    /// CRTCs with a flip waiting for its vblank
    pub fn pending_flips(&self) -> Vec<u32> {
        self.lock().pending_events.iter().map(|e| e.crtc_id).collect()
    }

    /// Let every pending flip complete; returns how many did
    pub fn complete_flips(&self) -> usize {
        let mut state = self.lock();
        let events = std::mem::take(&mut state.pending_events);
        let count = events.len();
        state.ready_events.extend(events);
        count
    }
}

impl KernelDevice for MockKernel {
    fn supports_atomic(&self) -> bool {
        self.lock().atomic
    }

    fn discover(&self) -> io::Result<RawResources> {
        Ok(self.lock().resources.clone())
    }

    fn event_fd(&self) -> Option<OwnedFd> {
        None
    }

    fn read_events(&self) -> io::Result<Vec<FlipEvent>> {
        Ok(std::mem::take(&mut self.lock().ready_events))
    }

    fn atomic_commit(&self, request: &AtomicRequest, flags: CommitFlags) -> io::Result<()> {
        let mut state = self.lock();
        state.calls.push(KernelCall::AtomicCommit {
            request: request.clone(),
            flags,
        });
        state.outcome(MockOp::AtomicCommit)?;
        if flags.contains(CommitFlags::PAGE_FLIP_EVENT) && !flags.contains(CommitFlags::TEST_ONLY) {
            for crtc in state.crtcs_in(request) {
                state.queue_flip(crtc);
            }
        }
        Ok(())
    }

    fn create_blob(&self, data: &[u8]) -> io::Result<u32> {
        let mut state = self.lock();
        state.outcome(MockOp::CreateBlob)?;
        let id = state.alloc_id();
        state.live_blobs.insert(id);
        state.blobs_created += 1;
        state.calls.push(KernelCall::CreateBlob {
            id,
            data: data.to_vec(),
        });
        Ok(id)
    }

    fn destroy_blob(&self, blob_id: u32) -> io::Result<()> {
        let mut state = self.lock();
        state.calls.push(KernelCall::DestroyBlob(blob_id));
        if state.live_blobs.remove(&blob_id) {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(libc::ENOENT))
        }
    }

    fn set_crtc(
        &self,
        crtc: u32,
        fb: Option<u32>,
        _pos: (u32, u32),
        connectors: &[u32],
        mode: Option<&Mode>,
    ) -> io::Result<()> {
        let mut state = self.lock();
        state.calls.push(KernelCall::SetCrtc {
            crtc,
            fb,
            connectors: connectors.to_vec(),
            mode: mode.cloned(),
        });
        state.outcome(MockOp::SetCrtc)
    }

    fn page_flip(&self, crtc: u32, fb: u32) -> io::Result<()> {
        let mut state = self.lock();
        state.calls.push(KernelCall::PageFlip { crtc, fb });
        state.outcome(MockOp::PageFlip)?;
        state.queue_flip(crtc);
        Ok(())
    }

    fn set_cursor2(
        &self,
        crtc: u32,
        handle: u32,
        size: (u32, u32),
        hotspot: (i32, i32),
    ) -> io::Result<()> {
        let mut state = self.lock();
        state.calls.push(KernelCall::SetCursor2 {
            crtc,
            handle,
            size,
            hotspot,
        });
        state.outcome(MockOp::SetCursor2)
    }

    fn set_cursor(&self, crtc: u32, handle: u32, size: (u32, u32)) -> io::Result<()> {
        let mut state = self.lock();
        state.calls.push(KernelCall::SetCursor { crtc, handle, size });
        state.outcome(MockOp::SetCursor)
    }

    fn move_cursor(&self, crtc: u32, pos: (i32, i32)) -> io::Result<()> {
        let mut state = self.lock();
        state.calls.push(KernelCall::MoveCursor { crtc, pos });
        state.outcome(MockOp::MoveCursor)
    }

    fn set_object_property(
        &self,
        object: u32,
        _object_type: ObjectType,
        prop: u32,
        value: u64,
    ) -> io::Result<()> {
        let mut state = self.lock();
        state.calls.push(KernelCall::SetProperty {
            object,
            prop,
            value,
        });
        state.outcome(MockOp::SetProperty)
    }

    fn set_gamma(&self, crtc: u32, red: &[u16], _green: &[u16], _blue: &[u16]) -> io::Result<()> {
        let mut state = self.lock();
        state.calls.push(KernelCall::SetGamma {
            crtc,
            size: red.len(),
        });
        state.outcome(MockOp::SetGamma)
    }

    fn add_framebuffer(&self, _layout: &BufferLayout) -> io::Result<u32> {
        let mut state = self.lock();
        state.outcome(MockOp::AddFramebuffer)?;
        let id = state.alloc_id();
        state.live_fbs.insert(id);
        state.fbs_created += 1;
        state.calls.push(KernelCall::AddFramebuffer(id));
        Ok(id)
    }

    fn remove_framebuffer(&self, fb: u32) -> io::Result<()> {
        let mut state = self.lock();
        state.calls.push(KernelCall::RemoveFramebuffer(fb));
        if state.live_fbs.remove(&fb) {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(libc::ENOENT))
        }
    }
}

/// Builder for plausible discovery snapshots
pub struct MockResources {
    raw: RawResources,
    next_prop: u32,
}

pub const CRTC_A: u32 = 41;
pub const CRTC_B: u32 = 42;
pub const PRIMARY_A: u32 = 31;
pub const CURSOR_A: u32 = 32;
pub const OVERLAY: u32 = 33;
pub const PRIMARY_B: u32 = 34;
pub const CURSOR_B: u32 = 35;
pub const CONNECTOR_A: u32 = 51;
pub const CONNECTOR_B: u32 = 52;

impl MockResources {
    pub fn mode_1080p() -> Mode {
        Mode::new(
            148_500,
            (1920, 2008, 2052, 2200),
            (1080, 1084, 1089, 1125),
            drm_ffi::DRM_MODE_FLAG_PHSYNC | drm_ffi::DRM_MODE_FLAG_PVSYNC,
            drm_ffi::DRM_MODE_TYPE_DRIVER | drm_ffi::DRM_MODE_TYPE_PREFERRED,
            "1920x1080",
        )
    }

    pub fn mode_720p() -> Mode {
        Mode::new(
            74_250,
            (1280, 1390, 1430, 1650),
            (720, 725, 730, 750),
            drm_ffi::DRM_MODE_FLAG_PHSYNC | drm_ffi::DRM_MODE_FLAG_PVSYNC,
            drm_ffi::DRM_MODE_TYPE_DRIVER,
            "1280x720",
        )
    }

    fn empty() -> Self {
        MockResources {
            raw: RawResources::default(),
            next_prop: 1000,
        }
    }

    /// One CRTC with primary, cursor and overlay planes driving HDMI-A-1
    pub fn single_output() -> Self {
        let mut res = Self::empty();
        res.add_crtc(CRTC_A);
        res.add_plane(PRIMARY_A, 1, 0b01);
        res.add_plane(CURSOR_A, 2, 0b01);
        res.add_plane(OVERLAY, 0, 0b01);
        res.add_connector(CONNECTOR_A, "HDMI-A-1", 0b01);
        res
    }

    /// Two CRTCs, each with its own primary and cursor plane, one shared overlay
    pub fn dual_output() -> Self {
        let mut res = Self::empty();
        res.add_crtc(CRTC_A);
        res.add_crtc(CRTC_B);
        res.add_plane(PRIMARY_A, 1, 0b01);
        res.add_plane(CURSOR_A, 2, 0b01);
        res.add_plane(OVERLAY, 0, 0b11);
        res.add_plane(PRIMARY_B, 1, 0b10);
        res.add_plane(CURSOR_B, 2, 0b10);
        res.add_connector(CONNECTOR_A, "HDMI-A-1", 0b11);
        res.add_connector(CONNECTOR_B, "DP-1", 0b11);
        res
    }

    /// Drop a property by name from every object
    pub fn without_prop(mut self, name: &str) -> Self {
        let props = self
            .raw
            .crtcs
            .iter_mut()
            .map(|c| &mut c.props)
            .chain(self.raw.planes.iter_mut().map(|p| &mut p.props))
            .chain(self.raw.connectors.iter_mut().map(|c| &mut c.props));
        for props in props {
            props.retain(|prop| prop.name != name);
        }
        self
    }

    pub fn disconnected(mut self) -> Self {
        for connector in &mut self.raw.connectors {
            connector.connected = false;
        }
        self
    }

    pub fn build(self) -> RawResources {
        self.raw
    }

    fn prop(&mut self, name: &str, value: u64, enums: &[(&str, u64)]) -> RawProperty {
        self.next_prop += 1;
        RawProperty {
            name: name.to_string(),
            id: self.next_prop,
            value,
            enums: enums.iter().map(|(n, v)| (n.to_string(), *v)).collect(),
        }
    }

    fn add_crtc(&mut self, id: u32) {
        let props = vec![
            self.prop("MODE_ID", 0, &[]),
            self.prop("ACTIVE", 0, &[]),
            self.prop("GAMMA_LUT", 0, &[]),
            self.prop("GAMMA_LUT_SIZE", 256, &[]),
            self.prop("VRR_ENABLED", 0, &[]),
        ];
        self.raw.crtcs.push(RawCrtc {
            id,
            gamma_size: 256,
            current_mode: None,
            props,
        });
    }

    fn add_plane(&mut self, id: u32, plane_type: u64, possible_crtcs: u32) {
        let mut props = vec![self.prop("type", plane_type, &[])];
        for name in [
            "FB_ID", "CRTC_ID", "SRC_X", "SRC_Y", "SRC_W", "SRC_H", "CRTC_X", "CRTC_Y", "CRTC_W",
            "CRTC_H", "rotation", "FB_DAMAGE_CLIPS",
        ] {
            props.push(self.prop(name, 0, &[]));
        }
        if plane_type == 2 {
            props.push(self.prop("HOTSPOT_X", 0, &[]));
            props.push(self.prop("HOTSPOT_Y", 0, &[]));
        }

        let formats = match plane_type {
            2 => vec![ARGB8888],
            _ => vec![XRGB8888, ARGB8888],
        };
        let format_modifiers = formats.iter().map(|f| (*f, DRM_FORMAT_MOD_LINEAR)).collect();
        self.raw.planes.push(RawPlane {
            id,
            possible_crtcs,
            formats,
            format_modifiers,
            rotations: 0b1111,
            props,
        });
    }

    fn add_connector(&mut self, id: u32, name: &str, possible_crtcs: u32) {
        let props = vec![
            self.prop("CRTC_ID", 0, &[]),
            self.prop("DPMS", 0, &[("On", 0), ("Standby", 1), ("Suspend", 2), ("Off", 3)]),
            self.prop("underscan", 0, &[("off", 0), ("on", 1), ("auto", 2)]),
            self.prop("underscan hborder", 0, &[]),
            self.prop("underscan vborder", 0, &[]),
            self.prop("privacy-screen sw-state", 1, &[("Enabled", 0), ("Disabled", 1)]),
            self.prop("max bpc", 8, &[]),
            self.prop("Colorspace", 0, &[("Default", 0), ("BT2020_RGB", 9), ("BT2020_YCC", 10)]),
            self.prop("HDR_OUTPUT_METADATA", 0, &[]),
            self.prop(
                "Broadcast RGB",
                0,
                &[("Automatic", 0), ("Full", 1), ("Limited 16:235", 2)],
            ),
            self.prop("vrr_capable", 1, &[]),
        ];
        self.raw.connectors.push(RawConnector {
            id,
            name: name.to_string(),
            connected: true,
            modes: vec![Self::mode_1080p(), Self::mode_720p()],
            possible_crtcs,
            current_crtc: None,
            props,
        });
    }
}
