// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
};
use tracing::debug;

use super::{
    drm_helpers::DRM_FORMAT_MOD_INVALID,
    error::{KmsError, KmsResult},
    kernel::KernelDevice,
    resources::DeviceId,
};

/// Memory layout of a GPU buffer, as `AddFB2` wants it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    pub width: u32,
    pub height: u32,
    /// DRM fourcc
    pub format: u32,
    pub modifier: u64,
    pub handles: [u32; 4],
    pub pitches: [u32; 4],
    pub offsets: [u32; 4],
}

impl BufferLayout {
    pub fn single_plane(width: u32, height: u32, stride: u32, format: u32, handle: u32) -> Self {
        BufferLayout {
            width,
            height,
            format,
            modifier: DRM_FORMAT_MOD_INVALID,
            handles: [handle, 0, 0, 0],
            pitches: [stride, 0, 0, 0],
            offsets: [0; 4],
        }
    }

    pub fn with_modifier(mut self, modifier: u64) -> Self {
        self.modifier = modifier;
        self
    }

    pub fn stride(&self) -> u32 {
        self.pitches[0]
    }

    /// GEM handle of the first plane, used by the legacy cursor ioctls
    pub fn handle(&self) -> u32 {
        self.handles[0]
    }

    pub fn has_explicit_modifier(&self) -> bool {
        self.modifier != DRM_FORMAT_MOD_INVALID
    }
}

type FbRelease = Box<dyn FnOnce(u32) + Send>;

/// A buffer that can be scanned out by a plane.
///
/// The framebuffer id is created on first use and shared by every plane
/// assignment referencing the buffer. Dropping the last reference hands the
/// id to the release hook, which routes `RmFB` back to the KMS thread.
pub struct ScanoutBuffer {
    device: DeviceId,
    layout: BufferLayout,
    fb_id: Mutex<Option<u32>>,
    release: Mutex<Option<FbRelease>>,
}

impl ScanoutBuffer {
    pub fn new(
        device: DeviceId,
        layout: BufferLayout,
        release: impl FnOnce(u32) + Send + 'static,
    ) -> Arc<Self> {
        Arc::new(ScanoutBuffer {
            device,
            layout,
            fb_id: Mutex::new(None),
            release: Mutex::new(Some(Box::new(release))),
        })
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn layout(&self) -> &BufferLayout {
        &self.layout
    }

    pub fn width(&self) -> u32 {
        self.layout.width
    }

    pub fn height(&self) -> u32 {
        self.layout.height
    }

    pub fn stride(&self) -> u32 {
        self.layout.stride()
    }

    pub fn format(&self) -> u32 {
        self.layout.format
    }

    pub fn modifier(&self) -> u64 {
        self.layout.modifier
    }

    pub fn handle(&self) -> u32 {
        self.layout.handle()
    }

    pub fn fb_id(&self) -> Option<u32> {
        *self.fb_id.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the cached framebuffer id, creating it on first use
    pub fn ensure_fb_id(&self, kernel: &dyn KernelDevice) -> KmsResult<u32> {
        let mut fb_id = self.fb_id.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = *fb_id {
            return Ok(id);
        }

        let id = kernel
            .add_framebuffer(&self.layout)
            .map_err(|err| KmsError::ioctl("drmModeAddFB2", &err))?;
        debug!(
            fb = id,
            "Created framebuffer for {}x{} buffer", self.layout.width, self.layout.height
        );
        *fb_id = Some(id);
        Ok(id)
    }
}

impl fmt::Debug for ScanoutBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanoutBuffer")
            .field("device", &self.device)
            .field("size", &(self.layout.width, self.layout.height))
            .field("format", &format_args!("{:#010x}", self.layout.format))
            .field("fb_id", &self.fb_id())
            .finish()
    }
}

impl Drop for ScanoutBuffer {
    fn drop(&mut self) {
        let fb_id = self.fb_id.get_mut().unwrap_or_else(PoisonError::into_inner).take();
        let release = self.release.get_mut().unwrap_or_else(PoisonError::into_inner).take();
        if let (Some(fb_id), Some(release)) = (fb_id, release) {
            release(fb_id);
        }
    }
}
