// SPDX-License-Identifier: GPL-3.0-only

//! One update, one `drmModeAtomicCommit`.

use tracing::{debug, trace, warn};

use super::{
    BlobGuard, StrategyContext, connector_property_writes, discard_listeners,
    group_page_flip_listeners,
};
use crate::backend::kms::{
    error::{KmsError, KmsResult},
    kernel::{AtomicRequest, CommitFlags, FlipEvent, KernelDevice},
    page_flip::{PageFlipData, warn_if_duplicate},
    resources::{ConnectorProp, CrtcProp, DeviceResources, PlaneProp},
    update::{AssignPlaneFlags, Feedback, PlaneAssignment, PlaneFeedback, Update, UpdateFlags},
};

/// 16.16 fixed point, as the SRC_* plane properties want it
fn to_fixed(value: f64) -> u64 {
    (value * 65536.0).round().max(0.0) as u64
}

/// CRTC_X/CRTC_Y are signed
fn signed(value: i32) -> u64 {
    value as i64 as u64
}

#[derive(Default)]
struct Staged {
    request: AtomicRequest,
    /// CRTCs the commit will generate a flip event for
    touched: Vec<u32>,
    failed_planes: Vec<PlaneFeedback>,
}

impl Staged {
    fn touch(&mut self, crtc: u32) {
        if !self.touched.contains(&crtc) {
            self.touched.push(crtc);
        }
    }
}

#[derive(Debug, Default)]
pub struct AtomicStrategy {
    /// Flips waiting for their kernel event, oldest first
    pending: Vec<PageFlipData>,
}

impl AtomicStrategy {
    pub fn pending_page_flips(&self) -> usize {
        self.pending.len()
    }

    pub fn process_update(
        &mut self,
        ctx: &mut StrategyContext<'_>,
        mut update: Update,
        flags: UpdateFlags,
    ) -> Feedback {
        let test_only = flags.contains(UpdateFlags::TEST_ONLY);
        let listeners = update.take_page_flip_listeners();
        if update.take_custom_page_flip().is_some() {
            debug!("[atomic] Ignoring custom page flip");
        }

        let result = {
            let kernel = ctx.kernel();
            let mut blobs = BlobGuard::new(kernel);
            stage_update(kernel, ctx.resources, &update, &mut blobs).and_then(|mut staged| {
                let mut commit_flags = if update.needs_modeset() {
                    CommitFlags::ALLOW_MODESET
                } else {
                    CommitFlags::NONBLOCK
                };
                if test_only {
                    commit_flags |= CommitFlags::TEST_ONLY;
                }
                let wants_event = listeners
                    .iter()
                    .any(|entry| staged.touched.contains(&entry.crtc.id()));
                if wants_event && !test_only {
                    commit_flags |= CommitFlags::PAGE_FLIP_EVENT;
                } else {
                    staged.touched.clear();
                }

                debug!(
                    props = staged.request.len(),
                    flags = ?commit_flags,
                    "[atomic] Committing update"
                );
                kernel
                    .atomic_commit(&staged.request, commit_flags)
                    .map_err(|err| KmsError::ioctl("drmModeAtomicCommit", &err))?;
                Ok(staged)
            })
            // blobs are destroyed here, whatever the outcome
        };

        match result {
            Err(err) => {
                debug!(%err, "[atomic] Update failed");
                discard_listeners(listeners, ctx.callbacks, Some(err.clone()));
                Feedback::failed(Vec::new(), err)
            }
            Ok(staged) if test_only => {
                discard_listeners(listeners, ctx.callbacks, None);
                Feedback::passed(staged.failed_planes)
            }
            Ok(staged) => {
                for mut data in group_page_flip_listeners(listeners, ctx.callbacks) {
                    if staged.touched.contains(&data.crtc().id()) {
                        ctx.fd.hold();
                        let crtc = data.crtc().clone();
                        self.pending.push(data);
                        warn_if_duplicate(&self.pending, &crtc);
                    } else {
                        trace!(crtc = data.crtc().id(), "[atomic] Nothing to flip");
                        data.make_symbolic();
                        data.flipped();
                    }
                }
                Feedback::passed(staged.failed_planes)
            }
        }
    }

    pub fn handle_flip_event(&mut self, ctx: &mut StrategyContext<'_>, event: &FlipEvent) {
        let Some(index) = self
            .pending
            .iter()
            .position(|data| data.crtc().id() == event.crtc_id)
        else {
            debug!(crtc = event.crtc_id, "[atomic] Flip event without pending page flip");
            return;
        };
        let mut data = self.pending.remove(index);
        data.set_timings(event);
        trace!(crtc = event.crtc_id, sequence = event.sequence, "[atomic] Page flipped");
        data.flipped();
        ctx.fd.unhold();
    }

    /// Clear every connector, plane and CRTC in one mode set
    pub fn disable(&mut self, ctx: &mut StrategyContext<'_>) {
        let res = ctx.resources;
        let mut request = AtomicRequest::new();
        for connector in &res.connectors {
            if let Some(prop) = connector.props().id(ConnectorProp::CrtcId) {
                request.add(connector.id(), prop, 0);
            }
        }
        for plane in &res.planes {
            for prop in [PlaneProp::FbId, PlaneProp::CrtcId] {
                if let Some(id) = plane.props().id(prop) {
                    request.add(plane.id(), id, 0);
                }
            }
        }
        for crtc in &res.crtcs {
            for prop in [CrtcProp::ModeId, CrtcProp::Active] {
                if let Some(id) = crtc.props().id(prop) {
                    request.add(crtc.id(), id, 0);
                }
            }
        }
        if let Err(err) = ctx
            .kernel()
            .atomic_commit(&request, CommitFlags::ALLOW_MODESET)
        {
            warn!(path = ctx.fd.path(), ?err, "[atomic] Failed to disable device");
        }
    }

    /// Posted flips never get their event once the device is gone
    pub fn prepare_shutdown(&mut self, ctx: &mut StrategyContext<'_>) {
        for data in self.pending.drain(..) {
            data.discard(None);
            ctx.fd.unhold();
        }
    }
}

fn stage_update(
    kernel: &dyn KernelDevice,
    res: &DeviceResources,
    update: &Update,
    blobs: &mut BlobGuard<'_>,
) -> KmsResult<Staged> {
    let mut staged = Staged::default();

    if !update.mode_sets().is_empty() {
        stage_disable_all(res, &mut staged.request)?;
    }

    for connector_update in update.connector_updates() {
        let connector = &connector_update.connector;
        for (prop, value) in connector_property_writes(connector_update, blobs)? {
            staged.request.add(connector.id(), prop, value);
        }
    }

    for mode_set in update.mode_sets() {
        let crtc = &mode_set.crtc;
        let mode_id = crtc.props().require(CrtcProp::ModeId, &**crtc)?;
        let active = crtc.props().require(CrtcProp::Active, &**crtc)?;
        match &mode_set.mode {
            Some(mode) => {
                let blob = blobs.create(mode.blob_data())?;
                trace!(crtc = crtc.id(), mode = ?mode, blob, "[atomic] Setting mode");
                staged.request.add(crtc.id(), mode_id, blob as u64);
                staged.request.add(crtc.id(), active, 1);
                for connector in &mode_set.connectors {
                    let prop = connector
                        .props()
                        .require(ConnectorProp::CrtcId, &**connector)?;
                    staged.request.add(connector.id(), prop, crtc.id() as u64);
                }
                staged.touch(crtc.id());
            }
            None => {
                trace!(crtc = crtc.id(), "[atomic] Unsetting mode");
                staged.request.add(crtc.id(), mode_id, 0);
                staged.request.add(crtc.id(), active, 0);
            }
        }
    }

    for assignment in update.plane_assignments() {
        let mut writes = AtomicRequest::new();
        match stage_plane(kernel, assignment, blobs, &mut writes) {
            Ok(()) => {
                for (object, prop, value) in writes.iter() {
                    staged.request.add(object, prop, value);
                }
                if !assignment.is_disable() {
                    staged.touch(assignment.crtc.id());
                }
            }
            Err(err)
                if assignment.flags.contains(AssignPlaneFlags::ALLOW_FAIL)
                    && !err.is_permission_denied() =>
            {
                debug!(plane = assignment.plane.id(), %err, "[atomic] Skipping plane");
                staged.failed_planes.push(PlaneFeedback {
                    plane: assignment.plane.clone(),
                    crtc: assignment.crtc.clone(),
                    error: err,
                });
            }
            Err(err) => return Err(err),
        }
    }

    for color in update.crtc_color_updates() {
        let crtc = &color.crtc;
        let prop = crtc.props().require(CrtcProp::GammaLut, &**crtc)?;
        let blob = match &color.gamma {
            Some(lut) => blobs.create(&lut.to_blob_data())?,
            None => 0,
        };
        staged.request.add(crtc.id(), prop, blob as u64);
        staged.touch(crtc.id());
    }

    for crtc_update in update.crtc_updates() {
        let crtc = &crtc_update.crtc;
        if let Some(enabled) = crtc_update.vrr {
            let prop = crtc.props().require(CrtcProp::VrrEnabled, &**crtc)?;
            staged.request.add(crtc.id(), prop, enabled as u64);
            staged.touch(crtc.id());
        }
    }

    Ok(staged)
}

/// Full mode sets start with every connector and plane of the device off
fn stage_disable_all(res: &DeviceResources, request: &mut AtomicRequest) -> KmsResult<()> {
    for connector in &res.connectors {
        let prop = connector
            .props()
            .require(ConnectorProp::CrtcId, &**connector)?;
        request.add(connector.id(), prop, 0);
    }
    for plane in &res.planes {
        let fb = plane.props().require(PlaneProp::FbId, &**plane)?;
        let crtc = plane.props().require(PlaneProp::CrtcId, &**plane)?;
        request.add(plane.id(), fb, 0);
        request.add(plane.id(), crtc, 0);
    }
    Ok(())
}

fn stage_plane(
    kernel: &dyn KernelDevice,
    assignment: &PlaneAssignment,
    blobs: &mut BlobGuard<'_>,
    writes: &mut AtomicRequest,
) -> KmsResult<()> {
    let plane = &assignment.plane;
    let props = plane.props();
    let id = plane.id();

    let Some(buffer) = &assignment.buffer else {
        trace!(plane = id, "[atomic] Disabling plane");
        writes.add(id, props.require(PlaneProp::FbId, &**plane)?, 0);
        writes.add(id, props.require(PlaneProp::CrtcId, &**plane)?, 0);
        return Ok(());
    };

    let unchanged = assignment.flags.contains(AssignPlaneFlags::FB_UNCHANGED);
    if !(unchanged && buffer.fb_id().is_some()) {
        let fb = buffer.ensure_fb_id(kernel)?;
        writes.add(id, props.require(PlaneProp::FbId, &**plane)?, fb as u64);
    }
    writes.add(
        id,
        props.require(PlaneProp::CrtcId, &**plane)?,
        assignment.crtc.id() as u64,
    );

    let src = assignment.src;
    let dst = assignment.dst;
    for (prop, value) in [
        (PlaneProp::SrcX, to_fixed(src.loc.x)),
        (PlaneProp::SrcY, to_fixed(src.loc.y)),
        (PlaneProp::SrcW, to_fixed(src.size.w)),
        (PlaneProp::SrcH, to_fixed(src.size.h)),
        (PlaneProp::CrtcX, signed(dst.loc.x)),
        (PlaneProp::CrtcY, signed(dst.loc.y)),
        (PlaneProp::CrtcW, dst.size.w.max(0) as u64),
        (PlaneProp::CrtcH, dst.size.h.max(0) as u64),
    ] {
        writes.add(id, props.require(prop, &**plane)?, value);
    }

    if let Some(rotation) = assignment.rotation {
        writes.add(
            id,
            props.require(PlaneProp::Rotation, &**plane)?,
            rotation.bits() as u64,
        );
    }

    // damage is only a hint
    if let (Some(prop), Some(data)) = (
        props.id(PlaneProp::FbDamageClips),
        assignment.fb_damage_blob(),
    ) {
        let blob = blobs.create(&data)?;
        writes.add(id, prop, blob as u64);
    }

    if let Some(hotspot) = assignment.cursor_hotspot {
        if plane.supports_cursor_hotspot() {
            writes.add(id, props.require(PlaneProp::HotspotX, &**plane)?, signed(hotspot.x));
            writes.add(id, props.require(PlaneProp::HotspotY, &**plane)?, signed(hotspot.y));
        }
    }

    trace!(
        plane = id,
        crtc = assignment.crtc.id(),
        "[atomic] Assigning plane {:?} -> {:?}",
        src,
        dst
    );
    Ok(())
}
