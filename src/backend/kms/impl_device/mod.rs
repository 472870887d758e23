// SPDX-License-Identifier: GPL-3.0-only

//! Per-device state living in the impl context.
//!
//! [`ImplDevice`] owns the kernel connection, the discovered resources and
//! one commit [`Strategy`]. It runs update filters, rejects empty updates,
//! keeps the fd held while anything is in flight and wires the strategy's
//! retry deadlines and kernel events into the impl event loop.

pub mod atomic;
pub mod simple;

use calloop::{
    Interest, LoopHandle, Mode as TriggerMode, PostAction, RegistrationToken,
    generic::Generic,
    timer::{TimeoutAction, Timer},
};
use std::{fmt, sync::Arc, time::Instant};
use tracing::{debug, error, info, trace, warn};

use self::{atomic::AtomicStrategy, simple::SimpleStrategy};
use super::{
    KmsImpl,
    error::{KmsError, KmsResult},
    kernel::{FlipEvent, KernelDevice},
    page_flip::PageFlipData,
    resources::{
        Connector, ConnectorProp, Crtc, DeviceId, DeviceResources, PropName, ResourceChanges,
    },
    thread::Callbacks,
    update::{ConnectorUpdate, Feedback, PageFlipListenerEntry, Underscan, Update, UpdateFlags},
};

/// Which commit API a device uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrategyMode {
    /// Atomic when the driver supports it, legacy otherwise
    #[default]
    Auto,
    Atomic,
    Simple,
}

/// The kernel connection of one device and its hold count
pub struct DeviceFd {
    kernel: Box<dyn KernelDevice>,
    path: String,
    holds: usize,
}

impl DeviceFd {
    pub fn new(kernel: Box<dyn KernelDevice>, path: impl Into<String>) -> Self {
        DeviceFd {
            kernel,
            path: path.into(),
            holds: 0,
        }
    }

    pub fn kernel(&self) -> &dyn KernelDevice {
        &*self.kernel
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn hold(&mut self) {
        self.holds += 1;
    }

    pub fn unhold(&mut self) {
        match self.holds {
            0 => warn!(path = self.path, "Unbalanced device fd release"),
            1 => {
                self.holds = 0;
                trace!(path = self.path, "Device fd no longer held");
            }
            _ => self.holds -= 1,
        }
    }

    pub fn hold_count(&self) -> usize {
        self.holds
    }
}

impl fmt::Debug for DeviceFd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceFd")
            .field("path", &self.path)
            .field("holds", &self.holds)
            .finish()
    }
}

/// What a strategy gets to work with while handling one request
pub struct StrategyContext<'a> {
    pub fd: &'a mut DeviceFd,
    pub resources: &'a DeviceResources,
    pub callbacks: &'a Callbacks,
    pub now: Instant,
}

impl StrategyContext<'_> {
    pub fn kernel(&self) -> &dyn KernelDevice {
        self.fd.kernel()
    }
}

/// The commit strategies; the set is closed
#[derive(Debug)]
pub enum Strategy {
    Atomic(AtomicStrategy),
    Simple(SimpleStrategy),
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Atomic(_) => "atomic",
            Strategy::Simple(_) => "simple",
        }
    }

    pub fn process_update(
        &mut self,
        ctx: &mut StrategyContext<'_>,
        update: Update,
        flags: UpdateFlags,
    ) -> Feedback {
        match self {
            Strategy::Atomic(atomic) => atomic.process_update(ctx, update, flags),
            Strategy::Simple(simple) => simple.process_update(ctx, update, flags),
        }
    }

    pub fn handle_flip_event(&mut self, ctx: &mut StrategyContext<'_>, event: &FlipEvent) {
        match self {
            Strategy::Atomic(atomic) => atomic.handle_flip_event(ctx, event),
            Strategy::Simple(simple) => simple.handle_flip_event(ctx, event),
        }
    }

    pub fn retry_page_flips(&mut self, ctx: &mut StrategyContext<'_>) {
        if let Strategy::Simple(simple) = self {
            simple.retry_page_flips(ctx);
        }
    }

    pub fn next_retry_deadline(&self) -> Option<Instant> {
        match self {
            Strategy::Atomic(_) => None,
            Strategy::Simple(simple) => simple.next_retry_deadline(),
        }
    }

    pub fn disable(&mut self, ctx: &mut StrategyContext<'_>) {
        match self {
            Strategy::Atomic(atomic) => atomic.disable(ctx),
            Strategy::Simple(simple) => simple.disable(ctx),
        }
    }

    pub fn discard_pending_page_flips(&mut self, ctx: &mut StrategyContext<'_>) {
        if let Strategy::Simple(simple) = self {
            simple.discard_pending_page_flips(ctx);
        }
    }

    pub fn prepare_shutdown(&mut self, ctx: &mut StrategyContext<'_>) {
        match self {
            Strategy::Atomic(atomic) => atomic.prepare_shutdown(ctx),
            Strategy::Simple(simple) => simple.prepare_shutdown(ctx),
        }
    }
}

/// Input handed to update filters
pub struct FilterContext<'a> {
    pub device: DeviceId,
    pub resources: &'a DeviceResources,
    /// The CRTC being processed, when the update is bound to one
    pub crtc: Option<&'a Arc<Crtc>>,
    pub flags: UpdateFlags,
}

/// Runs on every update right before it reaches the strategy
pub type UpdateFilter = Box<dyn FnMut(&FilterContext<'_>, &mut Update) + Send>;

/// Property blobs created for one commit, destroyed when dropped
pub(crate) struct BlobGuard<'a> {
    kernel: &'a dyn KernelDevice,
    ids: Vec<u32>,
}

impl<'a> BlobGuard<'a> {
    pub fn new(kernel: &'a dyn KernelDevice) -> Self {
        BlobGuard {
            kernel,
            ids: Vec::new(),
        }
    }

    pub fn create(&mut self, data: &[u8]) -> KmsResult<u32> {
        let id = self
            .kernel
            .create_blob(data)
            .map_err(|err| KmsError::ioctl("drmModeCreatePropertyBlob", &err))?;
        self.ids.push(id);
        Ok(id)
    }
}

impl Drop for BlobGuard<'_> {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            if let Err(err) = self.kernel.destroy_blob(id) {
                warn!(blob = id, ?err, "Failed to destroy property blob");
            }
        }
    }
}

fn connector_enum(connector: &Connector, prop: ConnectorProp, name: &str) -> KmsResult<(u32, u64)> {
    let id = connector.props().require(prop, connector)?;
    let value = connector.props().enum_value(prop, name).ok_or_else(|| {
        KmsError::failed(format!(
            "{connector} does not support {} \"{name}\"",
            prop.name()
        ))
    })?;
    Ok((id, value))
}

/// Property writes for one connector update, in kernel ids. HDR metadata is
/// uploaded through `blobs`.
pub(crate) fn connector_property_writes(
    update: &ConnectorUpdate,
    blobs: &mut BlobGuard<'_>,
) -> KmsResult<Vec<(u32, u64)>> {
    let connector = &*update.connector;
    let props = connector.props();
    let mut writes = Vec::new();

    match update.underscan {
        Some(Underscan::On { hborder, vborder }) => {
            writes.push(connector_enum(connector, ConnectorProp::Underscan, "on")?);
            writes.push((props.require(ConnectorProp::UnderscanHBorder, connector)?, hborder));
            writes.push((props.require(ConnectorProp::UnderscanVBorder, connector)?, vborder));
        }
        Some(Underscan::Off) => {
            writes.push(connector_enum(connector, ConnectorProp::Underscan, "off")?);
        }
        None => {}
    }
    if let Some(enabled) = update.privacy_screen {
        let name = if enabled { "Enabled" } else { "Disabled" };
        writes.push(connector_enum(connector, ConnectorProp::PrivacyScreenSwState, name)?);
    }
    if let Some(max_bpc) = update.max_bpc {
        writes.push((props.require(ConnectorProp::MaxBpc, connector)?, max_bpc));
    }
    if let Some(colorspace) = update.colorspace {
        writes.push(connector_enum(
            connector,
            ConnectorProp::Colorspace,
            colorspace.kernel_name(),
        )?);
    }
    if let Some(hdr) = &update.hdr {
        let prop = props.require(ConnectorProp::HdrOutputMetadata, connector)?;
        let blob = match hdr {
            Some(metadata) => blobs.create(&metadata.to_blob_data())?,
            None => 0,
        };
        writes.push((prop, blob as u64));
    }
    if let Some(broadcast_rgb) = update.broadcast_rgb {
        writes.push(connector_enum(
            connector,
            ConnectorProp::BroadcastRgb,
            broadcast_rgb.kernel_name(),
        )?);
    }
    Ok(writes)
}

/// One [`PageFlipData`] per CRTC, in order of first appearance
pub(crate) fn group_page_flip_listeners(
    entries: Vec<PageFlipListenerEntry>,
    callbacks: &Callbacks,
) -> Vec<PageFlipData> {
    let mut datas: Vec<PageFlipData> = Vec::new();
    for entry in entries {
        let index = match datas.iter().position(|data| data.crtc().id() == entry.crtc.id()) {
            Some(index) => index,
            None => {
                datas.push(PageFlipData::new(entry.crtc.clone(), callbacks.clone()));
                datas.len() - 1
            }
        };
        datas[index].add_listener(entry.listener, entry.context);
    }
    datas
}

pub(crate) fn discard_listeners(
    entries: Vec<PageFlipListenerEntry>,
    callbacks: &Callbacks,
    error: Option<KmsError>,
) {
    for data in group_page_flip_listeners(entries, callbacks) {
        data.discard(error.clone());
    }
}

/// One DRM device as seen from the impl context
pub struct ImplDevice {
    id: DeviceId,
    fd: DeviceFd,
    resources: DeviceResources,
    callbacks: Callbacks,
    strategy: Strategy,
    loop_handle: Option<LoopHandle<'static, KmsImpl>>,
    retry_timer: Option<RegistrationToken>,
    event_source: Option<RegistrationToken>,
}

impl fmt::Debug for ImplDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImplDevice")
            .field("id", &self.id)
            .field("fd", &self.fd)
            .field("strategy", &self.strategy.name())
            .finish()
    }
}

impl ImplDevice {
    /// Discover `kernel`'s resources and pick a strategy. With a loop
    /// handle, kernel events and retry timers are driven by that loop.
    pub fn new(
        id: DeviceId,
        path: impl Into<String>,
        kernel: Box<dyn KernelDevice>,
        mode: StrategyMode,
        callbacks: Callbacks,
        loop_handle: Option<LoopHandle<'static, KmsImpl>>,
    ) -> KmsResult<Self> {
        let fd = DeviceFd::new(kernel, path);
        let raw = fd
            .kernel()
            .discover()
            .map_err(|err| KmsError::ioctl("drmModeGetResources", &err))?;
        let resources = DeviceResources::from_raw(id, &raw);

        let atomic = fd.kernel().supports_atomic();
        let strategy = match (mode, atomic) {
            (StrategyMode::Auto | StrategyMode::Atomic, true) => {
                Strategy::Atomic(AtomicStrategy::default())
            }
            (StrategyMode::Atomic, false) => {
                return Err(KmsError::failed(format!(
                    "{} does not support atomic mode setting",
                    fd.path()
                )));
            }
            (StrategyMode::Auto, false) | (StrategyMode::Simple, _) => {
                Strategy::Simple(SimpleStrategy::default())
            }
        };
        info!(
            path = fd.path(),
            crtcs = resources.crtcs.len(),
            planes = resources.planes.len(),
            connectors = resources.connectors.len(),
            "Using {} mode setting",
            strategy.name()
        );

        let mut device = ImplDevice {
            id,
            fd,
            resources,
            callbacks,
            strategy,
            loop_handle,
            retry_timer: None,
            event_source: None,
        };
        device.register_event_source();
        Ok(device)
    }

    fn register_event_source(&mut self) {
        let (Some(handle), Some(event_fd)) = (&self.loop_handle, self.fd.kernel().event_fd()) else {
            return;
        };
        let id = self.id;
        let source = Generic::new(event_fd, Interest::READ, TriggerMode::Level);
        match handle.insert_source(source, move |_, _, kms: &mut KmsImpl| {
            if let Some(device) = kms.device_mut(id) {
                device.dispatch_events();
            }
            Ok(PostAction::Continue)
        }) {
            Ok(token) => self.event_source = Some(token),
            Err(err) => error!(
                path = self.fd.path(),
                error = ?err.error,
                "Failed to watch DRM events"
            ),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn path(&self) -> &str {
        self.fd.path()
    }

    pub fn resources(&self) -> &DeviceResources {
        &self.resources
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    pub fn hold_count(&self) -> usize {
        self.fd.hold_count()
    }

    pub fn kernel(&self) -> &dyn KernelDevice {
        self.fd.kernel()
    }

    /// Kernel events only arrive through [`Self::dispatch_events`] calls
    pub fn needs_polling(&self) -> bool {
        self.event_source.is_none()
    }

    fn split(&mut self, now: Instant) -> (&mut Strategy, StrategyContext<'_>) {
        (
            &mut self.strategy,
            StrategyContext {
                fd: &mut self.fd,
                resources: &self.resources,
                callbacks: &self.callbacks,
                now,
            },
        )
    }

    /// Filter, commit and report one update. Result listeners are notified
    /// on their contexts with the returned feedback.
    pub fn process_update(
        &mut self,
        mut update: Update,
        flags: UpdateFlags,
        crtc: Option<Arc<Crtc>>,
        filters: &mut [UpdateFilter],
    ) -> Feedback {
        let mut result_listeners = update.take_result_listeners();
        let crtc = crtc.or_else(|| update.latch_crtc().cloned());
        let filter_ctx = FilterContext {
            device: self.id,
            resources: &self.resources,
            crtc: crtc.as_ref(),
            flags,
        };
        for filter in filters.iter_mut() {
            filter(&filter_ctx, &mut update);
        }
        result_listeners.extend(update.take_result_listeners());

        let feedback = if update.is_empty() {
            trace!(path = self.fd.path(), "Rejecting empty update");
            discard_listeners(
                update.take_page_flip_listeners(),
                &self.callbacks,
                Some(KmsError::EmptyUpdate),
            );
            Feedback::failed(Vec::new(), KmsError::EmptyUpdate)
        } else {
            debug!(path = self.fd.path(), ?flags, "Processing update");
            self.fd.hold();
            let (strategy, mut ctx) = self.split(Instant::now());
            let feedback = strategy.process_update(&mut ctx, update, flags);
            self.fd.unhold();
            self.arm_retry_timer();
            feedback
        };

        if let Some(err) = feedback.error() {
            if !matches!(err, KmsError::EmptyUpdate) {
                warn!(path = self.fd.path(), %err, "Update failed");
            }
        }
        for listener in result_listeners {
            listener.notify(&self.callbacks, feedback.clone());
        }
        feedback
    }

    /// Run the filters on an otherwise empty update bound to `crtc`, so
    /// that cursor changes reach the kernel without a caller commit
    pub fn schedule_process(&mut self, crtc: &Arc<Crtc>, filters: &mut [UpdateFilter]) -> Feedback {
        self.process_update(Update::new(), UpdateFlags::empty(), Some(crtc.clone()), filters)
    }

    /// Read and dispatch pending kernel events; returns how many arrived
    pub fn dispatch_events(&mut self) -> usize {
        let events = match self.fd.kernel().read_events() {
            Ok(events) => events,
            Err(err) => {
                warn!(path = self.fd.path(), ?err, "Failed to read DRM events");
                return 0;
            }
        };
        let (strategy, mut ctx) = self.split(Instant::now());
        for event in &events {
            strategy.handle_flip_event(&mut ctx, event);
        }
        if !events.is_empty() {
            trace!(path = self.fd.path(), count = events.len(), "Dispatched DRM events");
        }
        events.len()
    }

    /// Re-attempt every retry due at `now`
    pub fn retry_page_flips(&mut self, now: Instant) {
        let (strategy, mut ctx) = self.split(now);
        strategy.retry_page_flips(&mut ctx);
        self.arm_retry_timer();
    }

    pub fn next_retry_deadline(&self) -> Option<Instant> {
        self.strategy.next_retry_deadline()
    }

    fn arm_retry_timer(&mut self) {
        let Some(handle) = &self.loop_handle else {
            return;
        };
        if let Some(token) = self.retry_timer.take() {
            handle.remove(token);
        }
        let Some(deadline) = self.strategy.next_retry_deadline() else {
            return;
        };

        let id = self.id;
        let timer = Timer::from_deadline(deadline);
        match handle.insert_source(timer, move |_, _, kms: &mut KmsImpl| {
            if let Some(device) = kms.device_mut(id) {
                device.retry_timer = None;
                device.retry_page_flips(Instant::now());
            }
            TimeoutAction::Drop
        }) {
            Ok(token) => self.retry_timer = Some(token),
            Err(err) => error!(
                path = self.fd.path(),
                error = ?err.error,
                "Failed to arm page flip retry timer"
            ),
        }
    }

    /// Turn every output of the device off
    pub fn disable(&mut self) {
        info!(path = self.fd.path(), "Disabling device");
        self.fd.hold();
        let (strategy, mut ctx) = self.split(Instant::now());
        strategy.disable(&mut ctx);
        self.fd.unhold();
    }

    /// Drop retries that were never issued; their listeners are told the
    /// flip was discarded
    pub fn discard_pending_page_flips(&mut self) {
        let (strategy, mut ctx) = self.split(Instant::now());
        strategy.discard_pending_page_flips(&mut ctx);
        self.arm_retry_timer();
    }

    /// Give up on everything still in flight before the device goes away
    pub fn prepare_shutdown(&mut self) {
        self.discard_pending_page_flips();
        let (strategy, mut ctx) = self.split(Instant::now());
        strategy.prepare_shutdown(&mut ctx);
        debug!(path = self.fd.path(), holds = self.fd.hold_count(), "Prepared device for shutdown");
    }

    /// Re-read the kernel objects after a hot-plug
    pub fn update_resources(&mut self) -> KmsResult<ResourceChanges> {
        let raw = self
            .fd
            .kernel()
            .discover()
            .map_err(|err| KmsError::ioctl("drmModeGetResources", &err))?;
        let resources = DeviceResources::from_raw(self.id, &raw);
        let changes = resources.changes_since(&self.resources);
        if !changes.is_empty() {
            info!(path = self.fd.path(), ?changes, "Device resources changed");
        }
        self.resources = resources;
        Ok(changes)
    }
}

impl Drop for ImplDevice {
    fn drop(&mut self) {
        if let Some(handle) = &self.loop_handle {
            for token in [self.retry_timer.take(), self.event_source.take()]
                .into_iter()
                .flatten()
            {
                handle.remove(token);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::kms::{
        kernel::mock::{CONNECTOR_A, CRTC_A, MockKernel, MockResources, PRIMARY_A},
        page_flip::testing::{Delivered, RecordingListener},
        thread::CallbackContext,
        update::{
            AssignPlaneFlags,
            testing::{buffer, full_rects},
        },
    };
    use std::sync::Mutex;

    fn device(mode: StrategyMode, atomic: bool) -> (ImplDevice, MockKernel, Callbacks) {
        let kernel = MockKernel::new(MockResources::single_output().build(), atomic);
        let callbacks = Callbacks::new();
        let device = ImplDevice::new(
            DeviceId(0),
            "mock",
            Box::new(kernel.clone()),
            mode,
            callbacks.clone(),
            None,
        )
        .unwrap();
        (device, kernel, callbacks)
    }

    #[test]
    fn strategy_follows_driver_and_mode() {
        assert_eq!(device(StrategyMode::Auto, true).0.strategy().name(), "atomic");
        assert_eq!(device(StrategyMode::Auto, false).0.strategy().name(), "simple");
        assert_eq!(device(StrategyMode::Simple, true).0.strategy().name(), "simple");

        let kernel = MockKernel::new(MockResources::single_output().build(), false);
        let err = ImplDevice::new(
            DeviceId(0),
            "mock",
            Box::new(kernel),
            StrategyMode::Atomic,
            Callbacks::new(),
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("atomic"));
    }

    #[test]
    fn empty_update_fails_and_reaches_result_listeners() {
        let (mut device, kernel, callbacks) = device(StrategyMode::Auto, true);
        let crtc = device.resources().crtc(CRTC_A).unwrap().clone();
        let listener = RecordingListener::new();
        let seen = Arc::new(Mutex::new(None));

        let mut update = Update::new();
        update.add_page_flip_listener(&crtc, listener.clone(), CallbackContext::MAIN);
        let s = seen.clone();
        update.add_result_listener(CallbackContext::MAIN, move |feedback| {
            *s.lock().unwrap() = feedback.error().cloned();
        });

        let feedback = device.process_update(update, UpdateFlags::empty(), None, &mut []);
        assert_eq!(feedback.error(), Some(&KmsError::EmptyUpdate));
        callbacks.dispatch(CallbackContext::MAIN);
        assert_eq!(*seen.lock().unwrap(), Some(KmsError::EmptyUpdate));
        assert_eq!(
            listener.delivered(),
            vec![Delivered::Discarded(CRTC_A, Some(KmsError::EmptyUpdate))]
        );
        assert!(kernel.calls().is_empty());
    }

    #[test]
    fn filters_can_fill_a_scheduled_update() {
        let (mut device, kernel, _) = device(StrategyMode::Auto, true);
        let crtc = device.resources().crtc(CRTC_A).unwrap().clone();
        let seen_crtc = Arc::new(Mutex::new(None));

        let s = seen_crtc.clone();
        let mut filters: Vec<UpdateFilter> = vec![Box::new(move |ctx, update| {
            *s.lock().unwrap() = ctx.crtc.map(|crtc| crtc.id());
            let crtc = ctx.crtc.unwrap().clone();
            update.set_vrr(&crtc, true);
        })];
        let feedback = device.schedule_process(&crtc, &mut filters);

        assert!(feedback.is_passed());
        assert_eq!(*seen_crtc.lock().unwrap(), Some(CRTC_A));
        assert_eq!(kernel.calls().len(), 1);
        assert_eq!(device.hold_count(), 0);
    }

    #[test]
    fn hold_count_tracks_in_flight_flips() {
        let (mut device, kernel, callbacks) = device(StrategyMode::Auto, true);
        let crtc = device.resources().crtc(CRTC_A).unwrap().clone();
        let primary = device.resources().plane(PRIMARY_A).unwrap().clone();
        let connector = device.resources().connector(CONNECTOR_A).unwrap().clone();
        let listener = RecordingListener::new();

        let mut update = Update::new();
        update.mode_set(&crtc, &[connector], Some(MockResources::mode_1080p()));
        let (src, dst) = full_rects((1920, 1080));
        update.assign_plane(
            &crtc,
            &primary,
            buffer(DeviceId(0), (1920, 1080)),
            src,
            dst,
            AssignPlaneFlags::empty(),
        );
        update.add_page_flip_listener(&crtc, listener.clone(), CallbackContext::MAIN);
        assert!(device
            .process_update(update, UpdateFlags::empty(), None, &mut [])
            .is_passed());
        assert_eq!(device.hold_count(), 1);

        kernel.complete_flips();
        assert_eq!(device.dispatch_events(), 1);
        assert_eq!(device.hold_count(), 0);
        callbacks.dispatch(CallbackContext::MAIN);
        assert!(matches!(listener.delivered()[..], [Delivered::Flipped(CRTC_A, _)]));
    }

    #[test]
    fn unbalanced_release_keeps_count_at_zero() {
        let kernel = MockKernel::new(MockResources::single_output().build(), true);
        let mut fd = DeviceFd::new(Box::new(kernel), "mock");
        fd.hold();
        fd.unhold();
        fd.unhold();
        assert_eq!(fd.hold_count(), 0);
    }

    #[test]
    fn hot_plug_refresh_reports_connector_changes() {
        let (mut device, kernel, _) = device(StrategyMode::Auto, true);
        kernel.set_resources(MockResources::single_output().disconnected().build());
        let changes = device.update_resources().unwrap();
        assert_eq!(changes, ResourceChanges::CONNECTORS);
        assert!(!device.resources().connectors[0].is_connected());
    }
}
