// SPDX-License-Identifier: GPL-3.0-only

//! The ioctl surface the backend drives.
//!
//! Everything above this module speaks in plain ids and byte buffers, so the
//! commit strategies can run unchanged against a real card or the in-memory
//! [`mock::MockKernel`].

use bitflags::bitflags;
use std::{io, os::fd::OwnedFd};

use super::{buffer::BufferLayout, resources::Mode};

pub mod card;
pub mod mock;

pub use self::card::DrmKernel;

/// One kernel property as reported by discovery
#[derive(Debug, Clone, PartialEq)]
pub struct RawProperty {
    pub name: String,
    pub id: u32,
    pub value: u64,
    /// Named entries of enum properties, or of bitmask properties with the bit as value
    pub enums: Vec<(String, u64)>,
}

#[derive(Debug, Clone)]
pub struct RawCrtc {
    pub id: u32,
    pub gamma_size: u32,
    pub current_mode: Option<Mode>,
    pub props: Vec<RawProperty>,
}

#[derive(Debug, Clone)]
pub struct RawPlane {
    pub id: u32,
    /// Bitmask over CRTC indices
    pub possible_crtcs: u32,
    pub formats: Vec<u32>,
    pub format_modifiers: Vec<(u32, u64)>,
    /// `DRM_MODE_ROTATE_*` bits
    pub rotations: u32,
    pub props: Vec<RawProperty>,
}

#[derive(Debug, Clone)]
pub struct RawConnector {
    pub id: u32,
    pub name: String,
    pub connected: bool,
    pub modes: Vec<Mode>,
    /// Bitmask over CRTC indices
    pub possible_crtcs: u32,
    pub current_crtc: Option<u32>,
    pub props: Vec<RawProperty>,
}

/// Plain-data snapshot of a device's display objects
#[derive(Debug, Clone, Default)]
pub struct RawResources {
    pub crtcs: Vec<RawCrtc>,
    pub planes: Vec<RawPlane>,
    pub connectors: Vec<RawConnector>,
}

bitflags! {
    /// Mirrors `DRM_MODE_ATOMIC_*` and `DRM_MODE_PAGE_FLIP_EVENT`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CommitFlags: u32 {
        const PAGE_FLIP_EVENT = 0x0001;
        const TEST_ONLY = 0x0100;
        const NONBLOCK = 0x0200;
        const ALLOW_MODESET = 0x0400;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Crtc,
    Connector,
    Plane,
}

/// An ordered batch of `(object, property, value)` writes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AtomicRequest {
    props: Vec<(u32, u32, u64)>,
}

impl AtomicRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, object: u32, prop: u32, value: u64) {
        self.props.push((object, prop, value));
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u32, u64)> + '_ {
        self.props.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.props.len()
    }

    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    /// Last value written for a property, as the kernel would apply it
    pub fn value(&self, object: u32, prop: u32) -> Option<u64> {
        self.props
            .iter()
            .rev()
            .find(|(o, p, _)| *o == object && *p == prop)
            .map(|(_, _, v)| *v)
    }
}

/// A page-flip completion read from the DRM event fd
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlipEvent {
    pub crtc_id: u32,
    pub sequence: u32,
    pub tv_sec: u32,
    pub tv_usec: u32,
}

/// The kernel display API of one DRM device
pub trait KernelDevice: Send {
    fn supports_atomic(&self) -> bool;

    fn discover(&self) -> io::Result<RawResources>;

    /// Fd to poll for page-flip events, if the device has one
    fn event_fd(&self) -> Option<OwnedFd>;

    fn read_events(&self) -> io::Result<Vec<FlipEvent>>;

    fn atomic_commit(&self, request: &AtomicRequest, flags: CommitFlags) -> io::Result<()>;

    fn create_blob(&self, data: &[u8]) -> io::Result<u32>;

    fn destroy_blob(&self, blob_id: u32) -> io::Result<()>;

    fn set_crtc(
        &self,
        crtc: u32,
        fb: Option<u32>,
        pos: (u32, u32),
        connectors: &[u32],
        mode: Option<&Mode>,
    ) -> io::Result<()>;

    /// Legacy page flip, always requesting a completion event
    fn page_flip(&self, crtc: u32, fb: u32) -> io::Result<()>;

    fn set_cursor2(
        &self,
        crtc: u32,
        handle: u32,
        size: (u32, u32),
        hotspot: (i32, i32),
    ) -> io::Result<()>;

    fn set_cursor(&self, crtc: u32, handle: u32, size: (u32, u32)) -> io::Result<()>;

    fn move_cursor(&self, crtc: u32, pos: (i32, i32)) -> io::Result<()>;

    fn set_object_property(
        &self,
        object: u32,
        object_type: ObjectType,
        prop: u32,
        value: u64,
    ) -> io::Result<()>;

    fn set_gamma(&self, crtc: u32, red: &[u16], green: &[u16], blue: &[u16]) -> io::Result<()>;

    fn add_framebuffer(&self, layout: &BufferLayout) -> io::Result<u32>;

    fn remove_framebuffer(&self, fb: u32) -> io::Result<()>;
}
