// SPDX-License-Identifier: GPL-3.0-only

//! Legacy mode setting: one ioctl per object.
//!
//! Nothing is atomic here. Entries are applied in order and a failure stops
//! processing without rolling back what was already applied.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    time::{Duration, Instant},
};
use tracing::{debug, trace, warn};

use super::{
    BlobGuard, StrategyContext, connector_enum, connector_property_writes, discard_listeners,
    group_page_flip_listeners,
};
use crate::backend::kms::{
    buffer::ScanoutBuffer,
    error::{ErrorKind, KmsError, KmsResult},
    kernel::{FlipEvent, KernelDevice, ObjectType},
    page_flip::{PageFlipData, warn_if_duplicate},
    resources::{Connector, ConnectorProp, Crtc, CrtcProp, Mode, PlaneProp, PlaneType},
    update::{
        AssignPlaneFlags, ConnectorUpdate, CrtcColorUpdate, CrtcUpdate, CustomPageFlipFn, Feedback,
        GammaLut, ModeSet, PlaneAssignment, PlaneFeedback, Update, UpdateFlags,
    },
};

/// Used when a cached mode reports no usable refresh rate
const FALLBACK_REFRESH_INTERVAL: Duration = Duration::from_micros(16_667);

/// The last successful mode set of a CRTC. Page flips and their fallbacks
/// need it and the kernel cannot give it back.
#[derive(Debug, Clone)]
struct CachedModeSet {
    connectors: Vec<u32>,
    mode: Mode,
    width: u32,
    height: u32,
    stride: u32,
    format: u32,
    modifier: u64,
}

impl CachedModeSet {
    fn is_compatible(&self, buffer: &ScanoutBuffer) -> bool {
        buffer.width() == self.width
            && buffer.height() == self.height
            && buffer.stride() == self.stride
            && buffer.format() == self.format
            && buffer.modifier() == self.modifier
    }

    fn refresh_interval(&self) -> Duration {
        let rate = self.mode.refresh_rate();
        if rate > 0.0 {
            Duration::from_secs_f64(1.0 / rate)
        } else {
            FALLBACK_REFRESH_INTERVAL
        }
    }
}

struct RetryEntry {
    data: PageFlipData,
    fb_id: u32,
    interval: Duration,
    retry_time: Instant,
    custom: Option<CustomPageFlipFn>,
}

#[derive(Default)]
pub struct SimpleStrategy {
    mode_sets: HashMap<u32, CachedModeSet>,
    /// Connectors we switched off
    dpms_off: HashSet<u32>,
    /// Sorted by retry time
    retries: Vec<RetryEntry>,
    posted: Vec<PageFlipData>,
    postponed_flips: Vec<PageFlipData>,
    postponed_fallbacks: Vec<PageFlipData>,
}

impl fmt::Debug for SimpleStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleStrategy")
            .field("mode_sets", &self.mode_sets.keys().collect::<Vec<_>>())
            .field("retries", &self.retries.len())
            .field("posted", &self.posted.len())
            .field("postponed_flips", &self.postponed_flips.len())
            .field("postponed_fallbacks", &self.postponed_fallbacks.len())
            .finish()
    }
}

fn primary_assignment<'a>(update: &'a Update, crtc: &Crtc) -> Option<&'a PlaneAssignment> {
    update.plane_assignments().iter().find(|assignment| {
        assignment.crtc.id() == crtc.id() && assignment.plane.plane_type() == PlaneType::Primary
    })
}

fn set_property(
    kernel: &dyn KernelDevice,
    object: u32,
    object_type: ObjectType,
    prop: u32,
    value: u64,
) -> KmsResult<()> {
    kernel
        .set_object_property(object, object_type, prop, value)
        .map_err(|err| {
            KmsError::ioctl(format!("drmModeObjectSetProperty on object {object}"), &err)
        })
}

fn issue_flip(
    kernel: &dyn KernelDevice,
    crtc: &Crtc,
    fb_id: u32,
    custom: Option<&mut CustomPageFlipFn>,
) -> KmsResult<()> {
    match custom {
        Some(func) => {
            debug!(crtc = crtc.id(), "[simple] Invoking custom page flip");
            func(kernel, crtc).map_err(|err| KmsError::ioctl("Custom page flip", &err))
        }
        None => {
            trace!(crtc = crtc.id(), fb = fb_id, "[simple] Page flipping");
            kernel
                .page_flip(crtc.id(), fb_id)
                .map_err(|err| KmsError::ioctl(format!("drmModePageFlip on {crtc}"), &err))
        }
    }
}

impl SimpleStrategy {
    pub fn pending_retries(&self) -> usize {
        self.retries.len()
    }

    pub fn posted_page_flips(&self) -> usize {
        self.posted.len()
    }

    pub fn next_retry_deadline(&self) -> Option<Instant> {
        self.retries.first().map(|entry| entry.retry_time)
    }

    pub fn process_update(
        &mut self,
        ctx: &mut StrategyContext<'_>,
        mut update: Update,
        flags: UpdateFlags,
    ) -> Feedback {
        if flags.contains(UpdateFlags::TEST_ONLY) {
            discard_listeners(update.take_page_flip_listeners(), ctx.callbacks, None);
            return self.test_update(ctx, &update);
        }

        let mut failed_planes = Vec::new();
        if let Err(err) = self.apply(ctx, &update, &mut failed_planes) {
            debug!(%err, "[simple] Update failed");
            discard_listeners(update.take_page_flip_listeners(), ctx.callbacks, Some(err.clone()));
            return Feedback::failed(failed_planes, err);
        }
        match self.dispatch_page_flips(ctx, &mut update, &mut failed_planes) {
            Ok(()) => Feedback::passed(failed_planes),
            Err(err) => Feedback::failed(failed_planes, err),
        }
    }

    fn apply(
        &mut self,
        ctx: &mut StrategyContext<'_>,
        update: &Update,
        failed_planes: &mut Vec<PlaneFeedback>,
    ) -> KmsResult<()> {
        for mode_set in update.mode_sets() {
            self.process_mode_set(ctx.kernel(), update, mode_set)?;
        }
        for connector_update in update.connector_updates() {
            process_connector_update(ctx.kernel(), connector_update)?;
        }
        for color in update.crtc_color_updates() {
            process_crtc_color(ctx.kernel(), color)?;
        }
        for crtc_update in update.crtc_updates() {
            process_crtc_update(ctx.kernel(), crtc_update)?;
        }

        for assignment in update.plane_assignments() {
            let result = match assignment.plane.plane_type() {
                PlaneType::Primary => continue,
                PlaneType::Cursor => process_cursor_plane(ctx.kernel(), assignment),
                PlaneType::Overlay => Err(KmsError::failed(format!(
                    "{} cannot be driven through the legacy API",
                    assignment.plane
                ))),
            };
            if let Err(err) = result {
                if err.is_permission_denied() {
                    return Err(err);
                }
                failed_planes.push(PlaneFeedback {
                    plane: assignment.plane.clone(),
                    crtc: assignment.crtc.clone(),
                    error: err.clone(),
                });
                if !assignment.flags.contains(AssignPlaneFlags::ALLOW_FAIL) {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn set_dpms(
        &mut self,
        kernel: &dyn KernelDevice,
        connector: &Connector,
        on: bool,
    ) -> KmsResult<()> {
        let value = if on { "On" } else { "Off" };
        let (prop, value) = connector_enum(connector, ConnectorProp::Dpms, value)?;
        debug!(connector = connector.id(), on, "[simple] Setting DPMS");
        set_property(kernel, connector.id(), ObjectType::Connector, prop, value)?;
        if on {
            self.dpms_off.remove(&connector.id());
        } else {
            self.dpms_off.insert(connector.id());
        }
        Ok(())
    }

    fn needs_dpms_on(&self, connector: &Connector) -> bool {
        if self.dpms_off.contains(&connector.id()) {
            return true;
        }
        let props = connector.props();
        match (
            props.value(ConnectorProp::Dpms),
            props.enum_value(ConnectorProp::Dpms, "On"),
        ) {
            (Some(current), Some(on)) => current != on,
            _ => false,
        }
    }

    fn process_mode_set(
        &mut self,
        kernel: &dyn KernelDevice,
        update: &Update,
        mode_set: &ModeSet,
    ) -> KmsResult<()> {
        let crtc = &mode_set.crtc;
        let Some(mode) = &mode_set.mode else {
            debug!(crtc = crtc.id(), "[simple] Unsetting mode");
            kernel
                .set_crtc(crtc.id(), None, (0, 0), &[], None)
                .map_err(|err| KmsError::ioctl(format!("drmModeSetCrtc on {crtc}"), &err))?;
            self.mode_sets.remove(&crtc.id());
            return Ok(());
        };

        let (primary, buffer) = primary_assignment(update, crtc)
            .and_then(|assignment| assignment.buffer.as_ref().map(|buffer| (assignment, buffer)))
            .ok_or_else(|| {
                KmsError::failed(format!(
                    "Missing primary plane assignment for legacy mode set on {crtc}"
                ))
            })?;

        let x = primary.src.loc.x.max(0.0) as u32;
        let y = primary.src.loc.y.max(0.0) as u32;

        if let Some(rotation) = primary.rotation {
            let prop = primary
                .plane
                .props()
                .require(PlaneProp::Rotation, &*primary.plane)?;
            set_property(
                kernel,
                primary.plane.id(),
                ObjectType::Plane,
                prop,
                rotation.bits() as u64,
            )?;
        }

        let fb = buffer.ensure_fb_id(kernel)?;

        for connector in &mode_set.connectors {
            if self.needs_dpms_on(connector) {
                self.set_dpms(kernel, connector, true)?;
            }
        }

        let connectors: Vec<u32> = mode_set.connectors.iter().map(|c| c.id()).collect();
        debug!(
            crtc = crtc.id(),
            fb,
            ?connectors,
            "[simple] Setting mode {}",
            mode.name
        );
        kernel
            .set_crtc(crtc.id(), Some(fb), (x, y), &connectors, Some(mode))
            .map_err(|err| {
                KmsError::ioctl(format!("drmModeSetCrtc mode '{}' on {crtc}", mode.name), &err)
            })?;

        self.mode_sets.insert(
            crtc.id(),
            CachedModeSet {
                connectors,
                mode: mode.clone(),
                width: buffer.width(),
                height: buffer.height(),
                stride: buffer.stride(),
                format: buffer.format(),
                modifier: buffer.modifier(),
            },
        );
        Ok(())
    }

    fn dispatch_page_flips(
        &mut self,
        ctx: &mut StrategyContext<'_>,
        update: &mut Update,
        failed_planes: &mut Vec<PlaneFeedback>,
    ) -> KmsResult<()> {
        let mut custom = update.take_custom_page_flip();
        let datas = group_page_flip_listeners(update.take_page_flip_listeners(), ctx.callbacks);
        let mut datas = datas.into_iter();

        while let Some(data) = datas.next() {
            let crtc = data.crtc().clone();
            let func = custom
                .take_if(|custom| custom.crtc.id() == crtc.id())
                .map(|custom| custom.func);
            let primary = primary_assignment(update, &crtc);

            if let Err(err) = self.dispatch_page_flip(ctx, data, primary, func) {
                if let Some(primary) = primary.filter(|_| !err.is_permission_denied()) {
                    failed_planes.push(PlaneFeedback {
                        plane: primary.plane.clone(),
                        crtc: crtc.clone(),
                        error: err.clone(),
                    });
                }
                for rest in datas {
                    rest.discard(Some(err.clone()));
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Flip one CRTC. On error the data has already been discarded.
    fn dispatch_page_flip(
        &mut self,
        ctx: &mut StrategyContext<'_>,
        mut data: PageFlipData,
        primary: Option<&PlaneAssignment>,
        mut custom: Option<CustomPageFlipFn>,
    ) -> KmsResult<()> {
        let crtc = data.crtc().clone();
        let buffer = primary.and_then(|assignment| assignment.buffer.as_ref());

        if buffer.is_none() && custom.is_none() {
            trace!(crtc = crtc.id(), "[simple] Symbolic page flip");
            data.make_symbolic();
            data.flipped();
            return Ok(());
        }

        let fb_id = match buffer.map(|buffer| buffer.ensure_fb_id(ctx.kernel())).transpose() {
            Ok(fb_id) => fb_id.unwrap_or(0),
            Err(err) => {
                data.discard(Some(err.clone()));
                return Err(err);
            }
        };

        let err = match issue_flip(ctx.kernel(), &crtc, fb_id, custom.as_mut()) {
            Ok(()) => {
                ctx.fd.hold();
                self.posted.push(data);
                warn_if_duplicate(&self.posted, &crtc);
                return Ok(());
            }
            Err(err) => err,
        };

        match err.kind() {
            ErrorKind::TransientBusy => {
                let Some(cached) = self.mode_sets.get(&crtc.id()) else {
                    let err = KmsError::failed(format!(
                        "Page flip of {} failed, and no mode set available",
                        crtc.id()
                    ));
                    data.discard(Some(err.clone()));
                    return Err(err);
                };
                let interval = cached.refresh_interval();
                debug!(crtc = crtc.id(), ?interval, "[simple] Scheduling page flip retry");
                ctx.fd.hold();
                self.schedule_retry(RetryEntry {
                    data,
                    fb_id,
                    interval,
                    retry_time: ctx.now + interval,
                    custom,
                });
                Ok(())
            }
            ErrorKind::CompatibilityFallback => {
                debug!(crtc = crtc.id(), "[simple] Falling back to mode set");
                match self.mode_set_fallback(ctx.kernel(), &crtc, primary) {
                    Ok(()) => {
                        self.finish_mode_set_fallback(data);
                        Ok(())
                    }
                    Err(err) => {
                        data.discard(Some(err.clone()));
                        Err(err)
                    }
                }
            }
            _ => {
                data.discard(Some(err.clone()));
                Err(err)
            }
        }
    }

    fn mode_set_fallback(
        &self,
        kernel: &dyn KernelDevice,
        crtc: &Crtc,
        primary: Option<&PlaneAssignment>,
    ) -> KmsResult<()> {
        let cached = self
            .mode_sets
            .get(&crtc.id())
            .ok_or_else(|| KmsError::failed("Missing mode set for page flip fallback"))?;
        let (primary, buffer) = primary
            .and_then(|assignment| assignment.buffer.as_ref().map(|buffer| (assignment, buffer)))
            .ok_or_else(|| {
                KmsError::failed("Missing primary plane assignment for page flip fallback")
            })?;
        let fb = buffer.ensure_fb_id(kernel)?;
        let x = primary.src.loc.x.max(0.0) as u32;
        let y = primary.src.loc.y.max(0.0) as u32;
        kernel
            .set_crtc(crtc.id(), Some(fb), (x, y), &cached.connectors, Some(&cached.mode))
            .map_err(|err| {
                KmsError::ioctl(
                    format!("drmModeSetCrtc mode '{}' on {crtc}", cached.mode.name),
                    &err,
                )
            })
    }

    fn finish_mode_set_fallback(&mut self, data: PageFlipData) {
        if self.retries.is_empty() {
            data.mode_set_fallback();
        } else {
            self.postponed_fallbacks.push(data);
        }
    }

    fn schedule_retry(&mut self, entry: RetryEntry) {
        self.retries.push(entry);
        self.retries.sort_by_key(|entry| entry.retry_time);
    }

    /// Re-issue every retry due at `ctx.now`. Another EBUSY pushes the
    /// entry one more refresh interval out.
    pub fn retry_page_flips(&mut self, ctx: &mut StrategyContext<'_>) {
        let now = ctx.now;
        let mut remaining = Vec::with_capacity(self.retries.len());

        for mut entry in std::mem::take(&mut self.retries) {
            if entry.retry_time > now {
                remaining.push(entry);
                continue;
            }
            let crtc = entry.data.crtc().clone();
            match issue_flip(ctx.kernel(), &crtc, entry.fb_id, entry.custom.as_mut()) {
                Ok(()) => {
                    trace!(crtc = crtc.id(), "[simple] Page flip retry posted");
                    self.posted.push(entry.data);
                }
                Err(err) if err.kind() == ErrorKind::TransientBusy => {
                    entry.retry_time += entry.interval;
                    trace!(crtc = crtc.id(), "[simple] Page flip still busy, retrying later");
                    remaining.push(entry);
                }
                Err(err) => {
                    warn!(crtc = crtc.id(), %err, "[simple] Page flip retry failed");
                    entry.data.discard(Some(err));
                    ctx.fd.unhold();
                }
            }
        }

        remaining.sort_by_key(|entry| entry.retry_time);
        self.retries = remaining;
        if self.retries.is_empty() {
            self.flush_postponed();
        }
    }

    fn flush_postponed(&mut self) {
        for data in self.postponed_flips.drain(..) {
            data.flipped();
        }
        for data in self.postponed_fallbacks.drain(..) {
            data.mode_set_fallback();
        }
    }

    pub fn handle_flip_event(&mut self, ctx: &mut StrategyContext<'_>, event: &FlipEvent) {
        let Some(index) = self
            .posted
            .iter()
            .position(|data| data.crtc().id() == event.crtc_id)
        else {
            debug!(crtc = event.crtc_id, "[simple] Flip event without posted page flip");
            return;
        };
        let mut data = self.posted.remove(index);
        data.set_timings(event);
        ctx.fd.unhold();
        if self.retries.is_empty() {
            data.flipped();
        } else {
            trace!(crtc = event.crtc_id, "[simple] Postponing flip while retries are pending");
            self.postponed_flips.push(data);
        }
    }

    /// Switch every connector off
    pub fn disable(&mut self, ctx: &mut StrategyContext<'_>) {
        for connector in &ctx.resources.connectors {
            if let Err(err) = self.set_dpms(ctx.kernel(), connector, false) {
                warn!(
                    path = ctx.fd.path(),
                    connector = connector.id(),
                    %err,
                    "[simple] Failed to set DPMS off"
                );
            }
        }
    }

    pub fn discard_pending_page_flips(&mut self, ctx: &mut StrategyContext<'_>) {
        if self.retries.is_empty() {
            return;
        }
        for entry in self.retries.drain(..) {
            debug!(crtc = entry.data.crtc().id(), "[simple] Discarding page flip retry");
            entry.data.discard(None);
            ctx.fd.unhold();
        }
        self.flush_postponed();
    }

    pub fn prepare_shutdown(&mut self, ctx: &mut StrategyContext<'_>) {
        for data in self.posted.drain(..) {
            data.discard(None);
            ctx.fd.unhold();
        }
        self.flush_postponed();
    }

    /// Legacy mode setting cannot test anything, so check buffers against
    /// the mode set they would be flipped onto
    fn test_update(&self, ctx: &StrategyContext<'_>, update: &Update) -> Feedback {
        let mut failed_planes = Vec::new();
        for assignment in update.plane_assignments() {
            let Some(buffer) = &assignment.buffer else {
                continue;
            };
            let error = match self.mode_sets.get(&assignment.crtc.id()) {
                None => Some(KmsError::failed("No existing mode set")),
                Some(cached) => match buffer.ensure_fb_id(ctx.kernel()) {
                    Err(err) => Some(err),
                    Ok(_) if !cached.is_compatible(buffer) => {
                        Some(KmsError::failed("Incompatible buffer"))
                    }
                    Ok(_) => None,
                },
            };
            if let Some(error) = error {
                failed_planes.push(PlaneFeedback {
                    plane: assignment.plane.clone(),
                    crtc: assignment.crtc.clone(),
                    error,
                });
            }
        }

        if failed_planes.is_empty() {
            Feedback::passed(Vec::new())
        } else {
            Feedback::failed(
                failed_planes,
                KmsError::failed("One or more buffers incompatible"),
            )
        }
    }
}

fn process_connector_update(kernel: &dyn KernelDevice, update: &ConnectorUpdate) -> KmsResult<()> {
    let connector = update.connector.id();
    let mut blobs = BlobGuard::new(kernel);
    for (prop, value) in connector_property_writes(update, &mut blobs)? {
        trace!(connector, prop, value, "[simple] Setting connector property");
        set_property(kernel, connector, ObjectType::Connector, prop, value)?;
    }
    Ok(())
}

fn process_crtc_color(kernel: &dyn KernelDevice, color: &CrtcColorUpdate) -> KmsResult<()> {
    let crtc = &color.crtc;
    let identity;
    let lut = match &color.gamma {
        Some(lut) => lut,
        None => {
            identity = GammaLut::identity(crtc.gamma_size() as usize);
            &identity
        }
    };
    debug!(crtc = crtc.id(), size = lut.len(), "[simple] Setting gamma");
    kernel
        .set_gamma(crtc.id(), &lut.red, &lut.green, &lut.blue)
        .map_err(|err| KmsError::ioctl(format!("drmModeCrtcSetGamma on {crtc}"), &err))
}

fn process_crtc_update(kernel: &dyn KernelDevice, update: &CrtcUpdate) -> KmsResult<()> {
    let crtc = &update.crtc;
    if let Some(enabled) = update.vrr {
        let prop = crtc.props().require(CrtcProp::VrrEnabled, &**crtc)?;
        debug!(crtc = crtc.id(), enabled, "[simple] Setting VRR");
        set_property(kernel, crtc.id(), ObjectType::Crtc, prop, enabled as u64)?;
    }
    Ok(())
}

fn process_cursor_plane(kernel: &dyn KernelDevice, assignment: &PlaneAssignment) -> KmsResult<()> {
    let crtc = assignment.crtc.id();
    let Some(buffer) = &assignment.buffer else {
        trace!(crtc, "[simple] Hiding cursor");
        return kernel
            .set_cursor(crtc, 0, (0, 0))
            .map_err(|err| KmsError::ioctl("drmModeSetCursor", &err));
    };

    if !assignment.flags.contains(AssignPlaneFlags::FB_UNCHANGED) {
        let size = (
            assignment.dst.size.w.max(0) as u32,
            assignment.dst.size.h.max(0) as u32,
        );
        let with_hotspot = assignment.cursor_hotspot.map(|hotspot| {
            kernel.set_cursor2(crtc, buffer.handle(), size, (hotspot.x, hotspot.y))
        });
        match with_hotspot {
            Some(Ok(())) => {}
            Some(Err(_)) | None => kernel
                .set_cursor(crtc, buffer.handle(), size)
                .map_err(|err| KmsError::ioctl("drmModeSetCursor", &err))?,
        }
    }

    let pos = (assignment.dst.loc.x, assignment.dst.loc.y);
    if let Err(err) = kernel.move_cursor(crtc, pos) {
        debug!(crtc, ?err, "[simple] Failed to move cursor");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::kms::{
        impl_device::DeviceFd,
        kernel::mock::{
            CONNECTOR_A, CONNECTOR_B, CRTC_A, CRTC_B, CURSOR_A, KernelCall, MockKernel, MockOp,
            MockResources, OVERLAY, PRIMARY_A, PRIMARY_B,
        },
        page_flip::testing::{Delivered, RecordingListener},
        resources::{DeviceId, DeviceResources},
        thread::{CallbackContext, Callbacks},
        update::testing::{buffer, cursor_buffer, full_rects},
    };
    use proptest::prelude::*;
    use smithay::utils::{Point, Rectangle, Size};
    use std::{
        io,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };

    struct Harness {
        kernel: MockKernel,
        fd: DeviceFd,
        resources: DeviceResources,
        callbacks: Callbacks,
        strategy: SimpleStrategy,
        start: Instant,
    }

    impl Harness {
        fn new(resources: MockResources) -> Self {
            let raw = resources.build();
            let kernel = MockKernel::new(raw.clone(), false);
            Harness {
                fd: DeviceFd::new(Box::new(kernel.clone()), "mock"),
                kernel,
                resources: DeviceResources::from_raw(DeviceId(0), &raw),
                callbacks: Callbacks::new(),
                strategy: SimpleStrategy::default(),
                start: Instant::now(),
            }
        }

        fn ctx(&mut self, now: Instant) -> (&mut SimpleStrategy, StrategyContext<'_>) {
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

        fn process_at(&mut self, update: Update, flags: UpdateFlags, now: Instant) -> Feedback {
            let (strategy, mut ctx) = self.ctx(now);
            strategy.process_update(&mut ctx, update, flags)
        }

        fn process(&mut self, update: Update) -> Feedback {
            let start = self.start;
            self.process_at(update, UpdateFlags::empty(), start)
        }

        fn retry_at(&mut self, now: Instant) {
            let (strategy, mut ctx) = self.ctx(now);
            strategy.retry_page_flips(&mut ctx);
        }

        fn dispatch_events(&mut self) {
            let events = self.kernel.read_events().unwrap();
            let start = self.start;
            let (strategy, mut ctx) = self.ctx(start);
            for event in &events {
                strategy.handle_flip_event(&mut ctx, event);
            }
        }

        fn crtc(&self, id: u32) -> Arc<Crtc> {
            self.resources.crtc(id).unwrap().clone()
        }

        fn frame(&self, crtc: u32, primary: u32, buf: &Arc<ScanoutBuffer>) -> Update {
            let crtc = self.crtc(crtc);
            let primary = self.resources.plane(primary).unwrap().clone();
            let (src, dst) = full_rects((1920, 1080));
            let mut update = Update::new();
            update.assign_plane(&crtc, &primary, buf.clone(), src, dst, AssignPlaneFlags::empty());
            update
        }

        /// Mode set CRTC A at 1080p
        fn mode_set(&mut self, buf: &Arc<ScanoutBuffer>) {
            let crtc = self.crtc(CRTC_A);
            let connector = self.resources.connector(CONNECTOR_A).unwrap().clone();
            let mut update = self.frame(CRTC_A, PRIMARY_A, buf);
            update.mode_set(&crtc, &[connector], Some(MockResources::mode_1080p()));
            assert!(self.process(update).is_passed());
        }
    }

    fn interval_60hz() -> Duration {
        Duration::from_secs_f64(1.0 / 60.0)
    }

    #[test]
    fn mode_set_uses_set_crtc_and_caches_geometry() {
        let mut h = Harness::new(MockResources::single_output());
        let buf = buffer(DeviceId(0), (1920, 1080));
        h.mode_set(&buf);

        let fb = buf.fb_id().unwrap();
        assert!(h.kernel.calls().contains(&KernelCall::SetCrtc {
            crtc: CRTC_A,
            fb: Some(fb),
            connectors: vec![CONNECTOR_A],
            mode: Some(MockResources::mode_1080p()),
        }));

        // same geometry passes a test commit, a smaller buffer does not
        let feedback =
            h.process_at(h.frame(CRTC_A, PRIMARY_A, &buf), UpdateFlags::TEST_ONLY, h.start);
        assert!(feedback.is_passed());
        let small = buffer(DeviceId(0), (1280, 720));
        let feedback =
            h.process_at(h.frame(CRTC_A, PRIMARY_A, &small), UpdateFlags::TEST_ONLY, h.start);
        assert_eq!(feedback.failed_plane_ids(), vec![PRIMARY_A]);
        assert_eq!(feedback.failed_planes()[0].error, KmsError::failed("Incompatible buffer"));
    }

    #[test]
    fn test_only_without_mode_set_fails_every_plane() {
        let mut h = Harness::new(MockResources::dual_output());
        let buf = buffer(DeviceId(0), (1920, 1080));
        let update = h.frame(CRTC_B, PRIMARY_B, &buf);
        let feedback = h.process_at(update, UpdateFlags::TEST_ONLY, h.start);
        assert_eq!(feedback.error(), Some(&KmsError::failed("One or more buffers incompatible")));
        assert_eq!(feedback.failed_planes()[0].error, KmsError::failed("No existing mode set"));
        assert!(h.kernel.calls().is_empty());
    }

    #[test]
    fn mode_set_needs_a_primary_plane() {
        let mut h = Harness::new(MockResources::single_output());
        let crtc = h.crtc(CRTC_A);
        let connector = h.resources.connector(CONNECTOR_A).unwrap().clone();
        let mut update = Update::new();
        update.mode_set(&crtc, &[connector], Some(MockResources::mode_1080p()));
        let feedback = h.process(update);
        assert!(feedback
            .error()
            .unwrap()
            .to_string()
            .starts_with("Missing primary plane assignment"));
    }

    #[test]
    fn page_flip_is_posted_and_completed() {
        let mut h = Harness::new(MockResources::single_output());
        let buf = buffer(DeviceId(0), (1920, 1080));
        h.mode_set(&buf);

        let listener = RecordingListener::new();
        let mut update = h.frame(CRTC_A, PRIMARY_A, &buf);
        update.add_page_flip_listener(&h.crtc(CRTC_A), listener.clone(), CallbackContext::MAIN);
        assert!(h.process(update).is_passed());
        assert_eq!(h.strategy.posted_page_flips(), 1);
        assert_eq!(h.fd.hold_count(), 1);

        h.kernel.complete_flips();
        h.dispatch_events();
        h.callbacks.dispatch(CallbackContext::MAIN);
        assert!(matches!(listener.delivered()[..], [Delivered::Flipped(CRTC_A, _)]));
        assert_eq!(h.fd.hold_count(), 0);
    }

    #[test]
    fn listener_without_primary_plane_gets_symbolic_ready() {
        let mut h = Harness::new(MockResources::single_output());
        let crtc = h.crtc(CRTC_A);
        let listener = RecordingListener::new();
        let mut update = Update::new();
        update.set_vrr(&crtc, true);
        update.add_page_flip_listener(&crtc, listener.clone(), CallbackContext::MAIN);
        assert!(h.process(update).is_passed());

        assert!(!h.kernel.calls().iter().any(|call| matches!(call, KernelCall::PageFlip { .. })));
        h.callbacks.dispatch(CallbackContext::MAIN);
        assert_eq!(listener.delivered(), vec![Delivered::Ready(CRTC_A)]);
        assert_eq!(h.fd.hold_count(), 0);
    }

    #[test]
    fn busy_flip_retries_each_refresh_until_it_succeeds() {
        let mut h = Harness::new(MockResources::single_output());
        let buf = buffer(DeviceId(0), (1920, 1080));
        h.mode_set(&buf);
        h.kernel.script(MockOp::PageFlip, [libc::EBUSY, libc::EBUSY, 0]);

        let listener = RecordingListener::new();
        let mut update = h.frame(CRTC_A, PRIMARY_A, &buf);
        update.add_page_flip_listener(&h.crtc(CRTC_A), listener.clone(), CallbackContext::MAIN);
        assert!(h.process(update).is_passed());

        let interval = interval_60hz();
        let first = h.strategy.next_retry_deadline().unwrap();
        assert_eq!(first, h.start + interval);
        assert_eq!(h.fd.hold_count(), 1);

        // too early, nothing happens
        h.retry_at(h.start + interval / 2);
        assert_eq!(h.strategy.next_retry_deadline(), Some(first));

        h.retry_at(first);
        let second = h.strategy.next_retry_deadline().unwrap();
        assert_eq!(second, first + interval);

        h.retry_at(second);
        assert_eq!(h.strategy.pending_retries(), 0);
        assert_eq!(h.strategy.posted_page_flips(), 1);
        let elapsed = second - h.start;
        assert!(
            elapsed >= Duration::from_micros(33_300) && elapsed <= Duration::from_micros(33_400)
        );

        h.callbacks.dispatch(CallbackContext::MAIN);
        assert!(listener.delivered().is_empty());

        h.kernel.complete_flips();
        h.dispatch_events();
        h.callbacks.dispatch(CallbackContext::MAIN);
        assert!(matches!(listener.delivered()[..], [Delivered::Flipped(CRTC_A, _)]));
        assert_eq!(h.fd.hold_count(), 0);
        let flips = h
            .kernel
            .calls()
            .iter()
            .filter(|call| matches!(call, KernelCall::PageFlip { .. }))
            .count();
        assert_eq!(flips, 3);
    }

    #[test]
    fn custom_page_flip_replaces_the_ioctl_and_survives_retries() {
        let mut h = Harness::new(MockResources::single_output());
        let buf = buffer(DeviceId(0), (1920, 1080));
        h.mode_set(&buf);

        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let listener = RecordingListener::new();
        let crtc = h.crtc(CRTC_A);
        let mut update = h.frame(CRTC_A, PRIMARY_A, &buf);
        update.add_page_flip_listener(&crtc, listener.clone(), CallbackContext::MAIN);
        update.set_custom_page_flip(&crtc, move |kernel, crtc| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(io::Error::from_raw_os_error(libc::EBUSY));
            }
            kernel.page_flip(crtc.id(), 42)
        });
        assert!(h.process(update).is_passed());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(h.strategy.pending_retries(), 1);

        h.retry_at(h.start + interval_60hz());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(h.strategy.posted_page_flips(), 1);
        assert!(h
            .kernel
            .calls()
            .contains(&KernelCall::PageFlip { crtc: CRTC_A, fb: 42 }));

        h.kernel.complete_flips();
        h.dispatch_events();
        h.callbacks.dispatch(CallbackContext::MAIN);
        assert!(matches!(listener.delivered()[..], [Delivered::Flipped(CRTC_A, _)]));
    }

    #[test]
    fn busy_flip_without_mode_set_fails() {
        let mut h = Harness::new(MockResources::single_output());
        h.kernel.script(MockOp::PageFlip, [libc::EBUSY]);
        let buf = buffer(DeviceId(0), (1920, 1080));
        let listener = RecordingListener::new();
        let mut update = h.frame(CRTC_A, PRIMARY_A, &buf);
        update.add_page_flip_listener(&h.crtc(CRTC_A), listener.clone(), CallbackContext::MAIN);

        let feedback = h.process(update);
        let err = feedback.error().cloned().unwrap();
        assert_eq!(
            err.to_string(),
            format!("Page flip of {CRTC_A} failed, and no mode set available")
        );
        assert_eq!(feedback.failed_plane_ids(), vec![PRIMARY_A]);
        h.callbacks.dispatch(CallbackContext::MAIN);
        assert_eq!(listener.delivered(), vec![Delivered::Discarded(CRTC_A, Some(err))]);
        assert_eq!(h.fd.hold_count(), 0);
    }

    #[test]
    fn revoked_device_fails_the_flip_without_retrying() {
        let mut h = Harness::new(MockResources::single_output());
        let buf = buffer(DeviceId(0), (1920, 1080));
        h.mode_set(&buf);
        h.kernel.script(MockOp::PageFlip, [libc::EACCES]);

        let listener = RecordingListener::new();
        let mut update = h.frame(CRTC_A, PRIMARY_A, &buf);
        update.add_page_flip_listener(&h.crtc(CRTC_A), listener.clone(), CallbackContext::MAIN);
        let feedback = h.process(update);

        assert!(matches!(feedback.error(), Some(KmsError::PermissionDenied { .. })));
        assert_eq!(feedback.error().unwrap().kind(), ErrorKind::Permission);
        assert_eq!(h.strategy.pending_retries(), 0);
        assert_eq!(h.strategy.posted_page_flips(), 0);
        assert_eq!(h.fd.hold_count(), 0);
        h.callbacks.dispatch(CallbackContext::MAIN);
        assert!(matches!(
            listener.delivered()[..],
            [Delivered::Discarded(CRTC_A, Some(KmsError::PermissionDenied { .. }))]
        ));
    }

    #[test]
    fn revoked_device_ends_a_pending_retry() {
        let mut h = Harness::new(MockResources::single_output());
        let buf = buffer(DeviceId(0), (1920, 1080));
        h.mode_set(&buf);
        h.kernel.script(MockOp::PageFlip, [libc::EBUSY, libc::EACCES]);

        let listener = RecordingListener::new();
        let mut update = h.frame(CRTC_A, PRIMARY_A, &buf);
        update.add_page_flip_listener(&h.crtc(CRTC_A), listener.clone(), CallbackContext::MAIN);
        assert!(h.process(update).is_passed());
        assert_eq!(h.strategy.pending_retries(), 1);
        assert_eq!(h.fd.hold_count(), 1);

        h.retry_at(h.start + interval_60hz());
        assert_eq!(h.strategy.pending_retries(), 0);
        assert_eq!(h.strategy.posted_page_flips(), 0);
        assert_eq!(h.fd.hold_count(), 0);
        h.callbacks.dispatch(CallbackContext::MAIN);
        assert!(matches!(
            listener.delivered()[..],
            [Delivered::Discarded(CRTC_A, Some(KmsError::PermissionDenied { .. }))]
        ));
    }

    #[test]
    fn invalid_flip_falls_back_to_mode_set() {
        let mut h = Harness::new(MockResources::single_output());
        let buf = buffer(DeviceId(0), (1920, 1080));
        h.mode_set(&buf);
        h.kernel.clear_calls();
        h.kernel.script(MockOp::PageFlip, [libc::EINVAL]);

        let listener = RecordingListener::new();
        let mut update = h.frame(CRTC_A, PRIMARY_A, &buf);
        update.add_page_flip_listener(&h.crtc(CRTC_A), listener.clone(), CallbackContext::MAIN);
        assert!(h.process(update).is_passed());

        assert!(h.kernel.calls().iter().any(|call| matches!(
            call,
            KernelCall::SetCrtc { crtc: CRTC_A, connectors, .. } if connectors == &vec![CONNECTOR_A]
        )));
        h.callbacks.dispatch(CallbackContext::MAIN);
        assert_eq!(listener.delivered(), vec![Delivered::ModeSetFallback(CRTC_A)]);
        assert_eq!(h.fd.hold_count(), 0);
    }

    #[test]
    fn completions_wait_for_pending_retries() {
        let mut h = Harness::new(MockResources::single_output());
        let buf = buffer(DeviceId(0), (1920, 1080));
        h.mode_set(&buf);

        let crtc = h.crtc(CRTC_A);
        let posted = RecordingListener::new();
        let mut update = h.frame(CRTC_A, PRIMARY_A, &buf);
        update.add_page_flip_listener(&crtc, posted.clone(), CallbackContext::MAIN);
        h.process(update);

        h.kernel.script(MockOp::PageFlip, [libc::EBUSY, 0]);
        let retried = RecordingListener::new();
        let mut update = h.frame(CRTC_A, PRIMARY_A, &buf);
        update.add_page_flip_listener(&crtc, retried.clone(), CallbackContext::MAIN);
        h.process(update);

        h.kernel.complete_flips();
        h.dispatch_events();
        h.callbacks.dispatch(CallbackContext::MAIN);
        assert!(posted.delivered().is_empty());

        let deadline = h.strategy.next_retry_deadline().unwrap();
        h.retry_at(deadline);
        h.callbacks.dispatch(CallbackContext::MAIN);
        assert!(matches!(posted.delivered()[..], [Delivered::Flipped(CRTC_A, _)]));
        assert!(retried.delivered().is_empty());
        assert_eq!(h.fd.hold_count(), 1);
    }

    #[test]
    fn shutdown_discards_retries_and_posted_flips() {
        let mut h = Harness::new(MockResources::dual_output());
        let buf = buffer(DeviceId(0), (1920, 1080));
        h.mode_set(&buf);
        let crtc_b = h.crtc(CRTC_B);
        let connector_b = h.resources.connector(CONNECTOR_B).unwrap().clone();
        let mut update = h.frame(CRTC_B, PRIMARY_B, &buf);
        update.mode_set(&crtc_b, &[connector_b], Some(MockResources::mode_1080p()));
        assert!(h.process(update).is_passed());

        let mut listeners = Vec::new();
        // two posted flips, one per CRTC
        for (crtc, primary) in [(CRTC_A, PRIMARY_A), (CRTC_B, PRIMARY_B)] {
            let listener = RecordingListener::new();
            let mut update = h.frame(crtc, primary, &buf);
            update.add_page_flip_listener(&h.crtc(crtc), listener.clone(), CallbackContext::MAIN);
            assert!(h.process(update).is_passed());
            listeners.push(listener);
        }
        // three retries
        h.kernel.fail_always(MockOp::PageFlip, libc::EBUSY);
        for (crtc, primary) in [(CRTC_A, PRIMARY_A), (CRTC_B, PRIMARY_B), (CRTC_A, PRIMARY_A)] {
            let listener = RecordingListener::new();
            let mut update = h.frame(crtc, primary, &buf);
            update.add_page_flip_listener(&h.crtc(crtc), listener.clone(), CallbackContext::MAIN);
            assert!(h.process(update).is_passed());
            listeners.push(listener);
        }
        assert_eq!(h.strategy.pending_retries(), 3);
        assert_eq!(h.strategy.posted_page_flips(), 2);
        assert_eq!(h.fd.hold_count(), 5);

        let start = h.start;
        let (strategy, mut ctx) = h.ctx(start);
        strategy.discard_pending_page_flips(&mut ctx);
        strategy.prepare_shutdown(&mut ctx);
        h.callbacks.dispatch(CallbackContext::MAIN);

        for listener in &listeners {
            let delivered = listener.delivered();
            assert_eq!(delivered.len(), 1);
            assert!(matches!(delivered[0], Delivered::Discarded(_, None)));
        }
        assert_eq!(h.fd.hold_count(), 0);
        assert_eq!(h.strategy.next_retry_deadline(), None);
    }

    #[test]
    fn cursor_plane_uses_cursor_ioctls() {
        let mut h = Harness::new(MockResources::single_output());
        let crtc = h.crtc(CRTC_A);
        let cursor = h.resources.plane(CURSOR_A).unwrap().clone();

        h.kernel.script(MockOp::SetCursor2, [libc::EINVAL]);
        let mut update = Update::new();
        update
            .assign_plane(
                &crtc,
                &cursor,
                cursor_buffer(DeviceId(0)),
                full_rects((64, 64)).0,
                Rectangle::new(Point::from((100, 200)), Size::from((64, 64))),
                AssignPlaneFlags::empty(),
            )
            .set_cursor_hotspot(Point::from((4, 4)));
        assert!(h.process(update).is_passed());

        let calls = h.kernel.calls();
        assert_eq!(
            calls,
            vec![
                KernelCall::SetCursor2 {
                    crtc: CRTC_A,
                    handle: 9,
                    size: (64, 64),
                    hotspot: (4, 4)
                },
                KernelCall::SetCursor {
                    crtc: CRTC_A,
                    handle: 9,
                    size: (64, 64)
                },
                KernelCall::MoveCursor {
                    crtc: CRTC_A,
                    pos: (100, 200)
                },
            ]
        );
        assert_eq!(h.kernel.framebuffers_created(), 0);

        h.kernel.clear_calls();
        let mut update = Update::new();
        update.unassign_plane(&crtc, &cursor);
        assert!(h.process(update).is_passed());
        assert_eq!(
            h.kernel.calls(),
            vec![KernelCall::SetCursor {
                crtc: CRTC_A,
                handle: 0,
                size: (0, 0)
            }]
        );
    }

    #[test]
    fn overlay_planes_fail_unless_allowed() {
        let mut h = Harness::new(MockResources::single_output());
        let crtc = h.crtc(CRTC_A);
        let overlay = h.resources.plane(OVERLAY).unwrap().clone();
        let (src, dst) = full_rects((256, 256));

        for (flags, passes) in [
            (AssignPlaneFlags::ALLOW_FAIL, true),
            (AssignPlaneFlags::empty(), false),
        ] {
            let mut update = Update::new();
            update.assign_plane(&crtc, &overlay, buffer(DeviceId(0), (256, 256)), src, dst, flags);
            update.set_vrr(&crtc, true);
            let feedback = h.process(update);
            assert_eq!(feedback.is_passed(), passes);
            assert_eq!(feedback.failed_plane_ids(), vec![OVERLAY]);
        }
    }

    #[test]
    fn legacy_changes_are_not_rolled_back() {
        let mut h = Harness::new(MockResources::single_output());
        let crtc = h.crtc(CRTC_A);
        let connector = h.resources.connector(CONNECTOR_A).unwrap().clone();
        h.kernel.script(MockOp::SetGamma, [libc::EIO]);

        let mut update = Update::new();
        update.set_max_bpc(&connector, 10);
        update.set_crtc_gamma(&crtc, None);
        update.set_vrr(&crtc, true);
        let feedback = h.process(update);
        assert_eq!(feedback.error().and_then(KmsError::errno), Some(libc::EIO));

        let calls = h.kernel.calls();
        assert!(matches!(calls[0], KernelCall::SetProperty { object: CONNECTOR_A, value: 10, .. }));
        assert_eq!(calls[1], KernelCall::SetGamma { crtc: CRTC_A, size: 256 });
        assert_eq!(calls.len(), 2);
    }

    #[test]
    fn disable_switches_dpms_off_and_mode_set_turns_it_back_on() {
        let mut h = Harness::new(MockResources::single_output());
        let start = h.start;
        let (strategy, mut ctx) = h.ctx(start);
        strategy.disable(&mut ctx);
        let dpms = h
            .resources
            .connector(CONNECTOR_A)
            .unwrap()
            .props()
            .id(ConnectorProp::Dpms)
            .unwrap();
        assert_eq!(
            h.kernel.calls(),
            vec![KernelCall::SetProperty {
                object: CONNECTOR_A,
                prop: dpms,
                value: 3
            }]
        );

        h.kernel.clear_calls();
        h.mode_set(&buffer(DeviceId(0), (1920, 1080)));
        assert!(h.kernel.calls().contains(&KernelCall::SetProperty {
            object: CONNECTOR_A,
            prop: dpms,
            value: 0
        }));
    }

    #[derive(Debug, Clone, Copy)]
    enum Response {
        Busy,
        Invalid,
        Fail,
        Ok,
    }

    impl Response {
        fn errno(self) -> i32 {
            match self {
                Response::Busy => libc::EBUSY,
                Response::Invalid => libc::EINVAL,
                Response::Fail => libc::EIO,
                Response::Ok => 0,
            }
        }
    }

    fn response() -> impl proptest::strategy::Strategy<Value = Response> {
        prop_oneof![
            4 => Just(Response::Busy),
            1 => Just(Response::Invalid),
            1 => Just(Response::Fail),
            4 => Just(Response::Ok),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn every_listener_hears_exactly_once(
            responses in proptest::collection::vec(response(), 0..24),
            flips in 1usize..6,
            retry_rounds in 0usize..8,
            shutdown in any::<bool>(),
        ) {
            let mut h = Harness::new(MockResources::single_output());
            let buf = buffer(DeviceId(0), (1920, 1080));
            h.mode_set(&buf);
            h.kernel.script(MockOp::PageFlip, responses.iter().map(|r| r.errno()));

            let crtc = h.crtc(CRTC_A);
            let listeners: Vec<_> = (0..flips).map(|_| RecordingListener::new()).collect();
            for listener in &listeners {
                let mut update = h.frame(CRTC_A, PRIMARY_A, &buf);
                update.add_page_flip_listener(&crtc, listener.clone(), CallbackContext::MAIN);
                h.process(update);
            }

            let mut now = h.start;
            for _ in 0..retry_rounds {
                now += interval_60hz();
                h.retry_at(now);
                h.kernel.complete_flips();
                h.dispatch_events();
            }
            if shutdown {
                let (strategy, mut ctx) = h.ctx(now);
                strategy.discard_pending_page_flips(&mut ctx);
                strategy.prepare_shutdown(&mut ctx);
            } else {
                h.kernel.clear_failures();
                while let Some(deadline) = h.strategy.next_retry_deadline() {
                    h.retry_at(deadline);
                }
                h.kernel.complete_flips();
                h.dispatch_events();
            }
            h.callbacks.dispatch(CallbackContext::MAIN);

            for listener in &listeners {
                prop_assert_eq!(listener.delivered().len(), 1);
            }
            prop_assert_eq!(h.fd.hold_count(), 0);
        }

        #[test]
        fn retry_deadlines_advance_by_whole_intervals(
            busy in 1usize..12,
            refresh in prop_oneof![Just(MockResources::mode_1080p()), Just(MockResources::mode_720p())],
        ) {
            let mut h = Harness::new(MockResources::single_output());
            let buf = buffer(DeviceId(0), (1920, 1080));
            let crtc = h.crtc(CRTC_A);
            let connector = h.resources.connector(CONNECTOR_A).unwrap().clone();
            let mut update = h.frame(CRTC_A, PRIMARY_A, &buf);
            update.mode_set(&crtc, &[connector], Some(refresh.clone()));
            prop_assert!(h.process(update).is_passed());

            h.kernel.script(MockOp::PageFlip, std::iter::repeat(libc::EBUSY).take(busy));
            let listener = RecordingListener::new();
            let mut update = h.frame(CRTC_A, PRIMARY_A, &buf);
            update.add_page_flip_listener(&crtc, listener.clone(), CallbackContext::MAIN);
            h.process(update);

            let interval = Duration::from_secs_f64(1.0 / refresh.refresh_rate());
            let mut previous = h.start;
            while let Some(deadline) = h.strategy.next_retry_deadline() {
                prop_assert!(deadline >= previous + interval);
                previous = deadline;
                h.retry_at(deadline);
            }
            prop_assert_eq!(h.strategy.posted_page_flips(), 1);
        }
    }
}
