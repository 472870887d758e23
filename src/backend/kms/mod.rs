// SPDX-License-Identifier: GPL-3.0-only

//! KMS backend.
//!
//! [`Kms`] is the caller-side facade. It owns the [`thread::Thread`] engine,
//! whose impl context holds a [`KmsImpl`] with one [`ImplDevice`] per DRM
//! device. Every kernel call happens inside that context; callers build an
//! [`Update`] and either wait for its [`Feedback`] or get it delivered to a
//! callback context later.

pub mod buffer;
pub mod cursor_manager;
pub mod device;
pub mod drm_helpers;
pub mod error;
pub mod impl_device;
pub mod kernel;
pub mod page_flip;
pub mod resources;
pub mod thread;
pub mod update;

pub use self::{
    buffer::{BufferLayout, ScanoutBuffer},
    cursor_manager::{CrtcLayout, CursorManager},
    device::Device,
    error::{ErrorKind, KmsError, KmsResult},
    impl_device::{FilterContext, StrategyMode, UpdateFilter},
    kernel::{DrmKernel, KernelDevice},
    page_flip::{FlipTimings, PageFlipListener},
    resources::{
        Connector, Crtc, DeviceId, DeviceResources, Mode, Plane, PlaneType, ResourceChanges,
        Rotation,
    },
    thread::{CallbackContext, Callbacks, ThreadType},
    update::{
        AssignPlaneFlags, BroadcastRgb, Colorspace, Eotf, Feedback, GammaLut, HdrMetadata,
        PlaneFeedback, Update, UpdateFlags,
    },
};

use anyhow::{Context, Result};
use calloop::LoopHandle;
use indexmap::IndexMap;
use std::{
    fmt,
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tracing::{debug, info, trace, warn};

use self::{
    cursor_manager::CursorManagerImpl,
    impl_device::{ImplDevice, discard_listeners},
    thread::Thread,
};

const DRI_DIR: &str = "/dev/dri";

/// State of the impl context
pub struct KmsImpl {
    loop_handle: LoopHandle<'static, KmsImpl>,
    callbacks: Callbacks,
    devices: IndexMap<DeviceId, ImplDevice>,
    filters: Vec<UpdateFilter>,
    cursor_manager: Arc<Mutex<CursorManagerImpl>>,
    scheduled: Vec<Arc<Crtc>>,
}

impl fmt::Debug for KmsImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KmsImpl")
            .field("devices", &self.devices)
            .field("filters", &self.filters.len())
            .field("scheduled", &self.scheduled.len())
            .finish()
    }
}

impl KmsImpl {
    fn new(loop_handle: LoopHandle<'static, KmsImpl>, callbacks: Callbacks) -> Self {
        let cursor_manager = Arc::new(Mutex::new(CursorManagerImpl::new(callbacks.clone())));
        let filters = vec![CursorManagerImpl::filter(cursor_manager.clone())];
        KmsImpl {
            loop_handle,
            callbacks,
            devices: IndexMap::new(),
            filters,
            cursor_manager,
            scheduled: Vec::new(),
        }
    }

    pub(crate) fn device_mut(&mut self, id: DeviceId) -> Option<&mut ImplDevice> {
        self.devices.get_mut(&id)
    }

    pub(crate) fn cursor_manager(&self) -> MutexGuard<'_, CursorManagerImpl> {
        self.cursor_manager
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Process `crtc` once the loop is idle, with an otherwise empty update
    /// the filters can add to. Repeated requests before that coalesce.
    pub(crate) fn schedule_process(&mut self, crtc: Arc<Crtc>) {
        if self
            .scheduled
            .iter()
            .any(|c| c.id() == crtc.id() && c.device() == crtc.device())
        {
            return;
        }
        if self.scheduled.is_empty() {
            self.loop_handle
                .insert_idle(|kms: &mut KmsImpl| kms.process_scheduled());
        }
        self.scheduled.push(crtc);
    }

    fn process_scheduled(&mut self) {
        for crtc in std::mem::take(&mut self.scheduled) {
            let Some(device) = self.devices.get_mut(&crtc.device()) else {
                continue;
            };
            let feedback = device.schedule_process(&crtc, &mut self.filters);
            trace!(crtc = crtc.id(), passed = feedback.is_passed(), "Processed scheduled update");
        }
    }

    fn add_device(
        &mut self,
        id: DeviceId,
        path: String,
        kernel: Box<dyn KernelDevice>,
        mode: StrategyMode,
    ) -> KmsResult<(&'static str, DeviceResources)> {
        let device = ImplDevice::new(
            id,
            path,
            kernel,
            mode,
            self.callbacks.clone(),
            Some(self.loop_handle.clone()),
        )?;
        let result = (device.strategy().name(), device.resources().clone());
        self.devices.insert(id, device);
        Ok(result)
    }

    fn remove_device(&mut self, id: DeviceId) -> bool {
        match self.devices.shift_remove(&id) {
            Some(mut device) => {
                device.prepare_shutdown();
                self.scheduled.retain(|crtc| crtc.device() != id);
                true
            }
            None => false,
        }
    }

    /// Commit `update` on every device it touches. Result listeners get
    /// the merged feedback.
    pub fn process_update(&mut self, mut update: Update, flags: UpdateFlags) -> Feedback {
        let result_listeners = update.take_result_listeners();
        let mut feedback: Option<Feedback> = None;

        for (id, mut device_update) in update.split_by_device() {
            let flags = if device_update.needs_modeset() {
                flags | UpdateFlags::MODE_SET
            } else {
                flags
            };
            let device_feedback = match self.devices.get_mut(&id) {
                Some(device) => {
                    device.process_update(device_update, flags, None, &mut self.filters)
                }
                None => {
                    warn!(device = %id, "Update references an unknown device");
                    let err = KmsError::failed(format!("unknown device {id}"));
                    discard_listeners(
                        device_update.take_page_flip_listeners(),
                        &self.callbacks,
                        Some(err.clone()),
                    );
                    Feedback::failed(Vec::new(), err)
                }
            };
            feedback = Some(match feedback {
                Some(feedback) => feedback.merge(device_feedback),
                None => device_feedback,
            });
        }

        let feedback =
            feedback.unwrap_or_else(|| Feedback::failed(Vec::new(), KmsError::EmptyUpdate));
        for listener in result_listeners {
            listener.notify(&self.callbacks, feedback.clone());
        }
        feedback
    }

    fn update_states(&mut self) -> Vec<(DeviceId, KmsResult<ResourceChanges>, DeviceResources)> {
        self.devices
            .values_mut()
            .map(|device| {
                let changes = device.update_resources();
                (device.id(), changes, device.resources().clone())
            })
            .collect()
    }

    /// Read kernel events of devices without a watched event fd
    fn dispatch_events(&mut self) -> usize {
        self.devices
            .values_mut()
            .filter(|device| device.needs_polling())
            .map(ImplDevice::dispatch_events)
            .sum()
    }

    fn remove_framebuffer(&mut self, device: DeviceId, fb_id: u32) {
        let Some(device) = self.devices.get(&device) else {
            debug!(fb_id, "Device gone before framebuffer release");
            return;
        };
        if let Err(err) = device.kernel().remove_framebuffer(fb_id) {
            warn!(path = device.path(), fb_id, ?err, "Failed to remove framebuffer");
        }
    }

    fn disable(&mut self) {
        for device in self.devices.values_mut() {
            device.disable();
        }
    }

    fn prepare_shutdown(&mut self) {
        self.scheduled.clear();
        for device in self.devices.values_mut() {
            device.prepare_shutdown();
        }
        self.cursor_manager().clear();
    }
}

/// Entry point of the backend
pub struct Kms {
    thread: Thread<KmsImpl>,
    devices: IndexMap<DeviceId, Device>,
    cursor_manager: CursorManager,
    next_id: u32,
}

impl fmt::Debug for Kms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kms")
            .field("thread", &self.thread)
            .field("devices", &self.devices)
            .finish_non_exhaustive()
    }
}

impl Kms {
    pub fn new(thread_type: ThreadType) -> Result<Self> {
        let thread = Thread::new("swl-kms", thread_type, KmsImpl::new)
            .context("Failed to start KMS thread")?;
        let cursor_manager = CursorManager::new(thread.handle());
        Ok(Kms {
            thread,
            devices: IndexMap::new(),
            cursor_manager,
            next_id: 0,
        })
    }

    /// Open the DRM card at `path`
    pub fn open(&mut self, path: &Path, mode: StrategyMode) -> Result<&Device> {
        let kernel = DrmKernel::open(path, mode != StrategyMode::Simple)?;
        self.add_device(path.display().to_string(), Box::new(kernel), mode)
    }

    /// Open the primary GPU: the card flagged `boot_vga`, else the first one
    pub fn open_primary_gpu(&mut self, mode: StrategyMode) -> Result<&Device> {
        let nodes = drm_helpers::card_nodes(Path::new(DRI_DIR));
        let path = drm_helpers::find_primary_gpu(&nodes)
            .or_else(|| nodes.first().cloned())
            .with_context(|| format!("No DRM card found in {DRI_DIR}"))?;
        self.open(&path, mode)
    }

    /// Hand `kernel` to the impl context
    pub fn add_device(
        &mut self,
        path: impl Into<String>,
        kernel: Box<dyn KernelDevice>,
        mode: StrategyMode,
    ) -> Result<&Device> {
        let id = DeviceId(self.next_id);
        self.next_id += 1;
        let path = path.into();
        let impl_path = path.clone();
        let (strategy, resources) = self
            .thread
            .run_sync(move |kms| kms.add_device(id, impl_path, kernel, mode))
            .and_then(|result| result)
            .with_context(|| format!("Failed to add KMS device {path}"))?;
        info!(device = %id, path, strategy, "Added KMS device");
        Ok(self
            .devices
            .entry(id)
            .or_insert(Device::new(id, path, strategy, resources)))
    }

    pub fn remove_device(&mut self, id: DeviceId) -> KmsResult<()> {
        self.devices.shift_remove(&id);
        if self.thread.run_sync(move |kms| kms.remove_device(id))? {
            info!(device = %id, "Removed KMS device");
        }
        Ok(())
    }

    /// Commit and wait for the result
    pub fn submit(&self, update: Update, flags: UpdateFlags) -> Feedback {
        self.thread
            .run_sync(move |kms| kms.process_update(update, flags))
            .unwrap_or_else(|err| Feedback::failed(Vec::new(), err))
    }

    /// Validate without changing anything
    pub fn test_update(&self, update: Update) -> Feedback {
        self.submit(update, UpdateFlags::TEST_ONLY)
    }

    /// Commit without waiting; `on_result` runs on `context`
    pub fn submit_async(
        &self,
        mut update: Update,
        flags: UpdateFlags,
        context: CallbackContext,
        on_result: impl FnOnce(&Feedback) + Send + 'static,
    ) -> KmsResult<()> {
        update.add_result_listener(context, on_result);
        self.thread.post(move |kms| {
            kms.process_update(update, flags);
        })
    }

    /// Re-read every device after a hot-plug; returns what changed where
    pub fn update_states(&mut self) -> KmsResult<Vec<(DeviceId, ResourceChanges)>> {
        let states = self.thread.run_sync(|kms| kms.update_states())?;
        let mut changed = Vec::new();
        for (id, changes, resources) in states {
            let changes = match changes {
                Ok(changes) => changes,
                Err(err) => {
                    warn!(device = %id, %err, "Failed to refresh device resources");
                    continue;
                }
            };
            if let Some(device) = self.devices.get_mut(&id) {
                device.set_resources(resources);
            }
            if !changes.is_empty() {
                changed.push((id, changes));
            }
        }
        Ok(changed)
    }

    /// Read kernel events of devices that have no pollable event fd
    pub fn poll_events(&self) -> KmsResult<usize> {
        self.thread.run_sync(|kms| kms.dispatch_events())
    }

    /// Drive the impl (user mode) and run callbacks queued for
    /// [`CallbackContext::MAIN`]
    pub fn dispatch(&self, timeout: Option<Duration>) -> KmsResult<usize> {
        self.thread.dispatch(timeout)
    }

    pub fn flush_callbacks(&self) -> usize {
        self.thread.flush_callbacks()
    }

    /// Turn every output off
    pub fn disable(&self) -> KmsResult<()> {
        self.thread.run_sync(|kms| kms.disable())
    }

    /// Discard everything in flight and deliver the outcomes
    pub fn prepare_shutdown(&self) -> KmsResult<()> {
        self.thread.run_sync(|kms| kms.prepare_shutdown())?;
        self.flush_callbacks();
        // framebuffer releases posted by the callbacks above
        self.thread.run_sync(|_| ())
    }

    /// Wrap a caller-allocated buffer. The framebuffer is removed on the
    /// impl context once the last reference drops.
    pub fn wrap_buffer(&self, device: DeviceId, layout: BufferLayout) -> Arc<ScanoutBuffer> {
        let handle = self.thread.handle();
        ScanoutBuffer::new(device, layout, move |fb_id| {
            if handle
                .post(move |kms| kms.remove_framebuffer(device, fb_id))
                .is_err()
            {
                debug!(fb_id, "KMS thread gone, framebuffer left to the kernel");
            }
        })
    }

    pub fn cursor_manager(&self) -> &CursorManager {
        &self.cursor_manager
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn device(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(&id)
    }

    pub fn callbacks(&self) -> &Callbacks {
        self.thread.callbacks()
    }

    pub fn thread_type(&self) -> ThreadType {
        self.thread.thread_type()
    }
}

impl Drop for Kms {
    fn drop(&mut self) {
        if let Err(err) = self.prepare_shutdown() {
            debug!(%err, "KMS thread gone before shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::kms::{
        kernel::mock::{CRTC_A, KernelCall, MockKernel, MockResources, PRIMARY_A, XRGB8888},
        update::testing::{buffer, full_rects},
    };
    use std::sync::mpsc;

    fn kms_with_mock(thread_type: ThreadType) -> (Kms, MockKernel, Device) {
        let mut kms = Kms::new(thread_type).unwrap();
        let mock = MockKernel::new(MockResources::single_output().build(), true);
        let device = kms
            .add_device("mock", Box::new(mock.clone()), StrategyMode::Auto)
            .unwrap()
            .clone();
        (kms, mock, device)
    }

    fn primary_update(kms: &Kms, device: &Device) -> Update {
        let crtc = device.crtc(CRTC_A).unwrap().clone();
        let plane = device.primary_plane_for(&crtc).unwrap().clone();
        let (src, dst) = full_rects((1920, 1080));
        let layout = BufferLayout::single_plane(1920, 1080, 1920 * 4, XRGB8888, 7);
        let mut update = Update::new();
        update.assign_plane(
            &crtc,
            &plane,
            kms.wrap_buffer(device.id(), layout),
            src,
            dst,
            AssignPlaneFlags::empty(),
        );
        update
    }

    #[test]
    fn empty_update_is_rejected() {
        let (kms, mock, _) = kms_with_mock(ThreadType::User);
        let feedback = kms.submit(Update::new(), UpdateFlags::empty());
        assert!(matches!(feedback.error(), Some(KmsError::EmptyUpdate)));
        assert!(mock.calls().is_empty());
    }

    #[test]
    fn unknown_device_fails_without_kernel_calls() {
        let (kms, mock, device) = kms_with_mock(ThreadType::User);
        let other = DeviceResources::from_raw(DeviceId(9), &MockResources::single_output().build());
        let crtc = other.crtc(CRTC_A).unwrap().clone();
        let plane = other.plane(PRIMARY_A).unwrap().clone();
        let (src, dst) = full_rects((1920, 1080));

        let mut update = Update::new();
        let buf = buffer(DeviceId(9), (1920, 1080));
        update.assign_plane(&crtc, &plane, buf, src, dst, AssignPlaneFlags::empty());
        let feedback = kms.submit(update, UpdateFlags::empty());

        assert!(matches!(feedback.error(), Some(KmsError::Failed(_))));
        assert!(mock.calls().is_empty());
        assert_eq!(device.strategy_name(), "atomic");
    }

    #[test]
    fn result_listener_runs_on_main_context() {
        let (kms, _, device) = kms_with_mock(ThreadType::Kernel);
        let (tx, rx) = mpsc::channel();

        let update = primary_update(&kms, &device);
        kms.submit_async(update, UpdateFlags::empty(), CallbackContext::MAIN, move |feedback| {
            tx.send(feedback.is_passed()).unwrap();
        })
        .unwrap();

        let passed = loop {
            if let Ok(passed) = rx.try_recv() {
                break passed;
            }
            kms.dispatch(Some(Duration::from_millis(10))).unwrap();
        };
        assert!(passed);
    }

    #[test]
    fn released_buffers_remove_their_framebuffer() {
        let (kms, mock, device) = kms_with_mock(ThreadType::User);
        let update = primary_update(&kms, &device);
        assert!(kms.submit(update, UpdateFlags::empty()).is_passed());
        assert_eq!(mock.framebuffers_created(), 1);

        // the release is posted once the commit dropped the last reference
        kms.thread.run_sync(|_| ()).unwrap();
        assert_eq!(mock.live_framebuffers(), 0);
        assert!(mock
            .calls()
            .iter()
            .any(|call| matches!(call, KernelCall::RemoveFramebuffer(_))));
    }
}
