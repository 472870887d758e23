// SPDX-License-Identifier: GPL-3.0-only

//! Transaction builder.
//!
//! An [`Update`] only collects intent. Nothing here talks to the kernel and
//! nothing can fail; plane/CRTC compatibility and property availability are
//! checked by the commit strategy that eventually consumes it.

use bitflags::bitflags;
use indexmap::IndexMap;
use smithay::utils::{Buffer, Physical, Point, Rectangle};
use std::{fmt, io, sync::Arc};

use super::{
    buffer::ScanoutBuffer,
    error::KmsError,
    kernel::KernelDevice,
    page_flip::PageFlipListener,
    resources::{Connector, Crtc, DeviceId, Mode, Plane, Rotation},
    thread::{CallbackContext, Callbacks},
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AssignPlaneFlags: u32 {
        /// The buffer is the one already scanned out; only geometry changed
        const FB_UNCHANGED = 1 << 0;
        /// Failing to apply this assignment is not fatal for the update
        const ALLOW_FAIL = 1 << 1;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UpdateFlags: u32 {
        /// Validate only, change nothing
        const TEST_ONLY = 1 << 0;
        /// The caller expects a full mode set
        const MODE_SET = 1 << 1;
    }
}

/// One plane bound to a CRTC, or disabled when `buffer` is `None`
pub struct PlaneAssignment {
    pub crtc: Arc<Crtc>,
    pub plane: Arc<Plane>,
    pub buffer: Option<Arc<ScanoutBuffer>>,
    pub src: Rectangle<f64, Buffer>,
    pub dst: Rectangle<i32, Physical>,
    pub flags: AssignPlaneFlags,
    pub rotation: Option<Rotation>,
    pub fb_damage: Option<Vec<Rectangle<i32, Buffer>>>,
    pub cursor_hotspot: Option<Point<i32, Buffer>>,
}

impl PlaneAssignment {
    pub fn is_disable(&self) -> bool {
        self.buffer.is_none()
    }

    pub fn set_fb_damage(&mut self, damage: Vec<Rectangle<i32, Buffer>>) -> &mut Self {
        self.fb_damage = Some(damage);
        self
    }

    pub fn set_rotation(&mut self, rotation: Rotation) -> &mut Self {
        self.rotation = Some(rotation);
        self
    }

    pub fn set_cursor_hotspot(&mut self, hotspot: Point<i32, Buffer>) -> &mut Self {
        self.cursor_hotspot = Some(hotspot);
        self
    }

    /// `struct drm_mode_rect` array for `FB_DAMAGE_CLIPS`
    pub fn fb_damage_blob(&self) -> Option<Vec<u8>> {
        let damage = self.fb_damage.as_ref()?;
        let mut data = Vec::with_capacity(damage.len() * 16);
        for rect in damage {
            for value in [
                rect.loc.x,
                rect.loc.y,
                rect.loc.x + rect.size.w,
                rect.loc.y + rect.size.h,
            ] {
                data.extend_from_slice(&value.to_ne_bytes());
            }
        }
        Some(data)
    }
}

impl fmt::Debug for PlaneAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaneAssignment")
            .field("crtc", &self.crtc.id())
            .field("plane", &self.plane.id())
            .field("buffer", &self.buffer)
            .field("src", &self.src)
            .field("dst", &self.dst)
            .field("flags", &self.flags)
            .finish()
    }
}

/// Full mode set of one CRTC; no mode turns the CRTC off
pub struct ModeSet {
    pub crtc: Arc<Crtc>,
    pub connectors: Vec<Arc<Connector>>,
    pub mode: Option<Mode>,
}

impl fmt::Debug for ModeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModeSet")
            .field("crtc", &self.crtc.id())
            .field(
                "connectors",
                &self.connectors.iter().map(|c| c.id()).collect::<Vec<_>>(),
            )
            .field("mode", &self.mode)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Underscan {
    Off,
    On { hborder: u64, vborder: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Colorspace {
    Default,
    Bt2020Rgb,
    Bt2020Ycc,
}

impl Colorspace {
    /// Enum entry name of the kernel "Colorspace" property
    pub fn kernel_name(self) -> &'static str {
        match self {
            Colorspace::Default => "Default",
            Colorspace::Bt2020Rgb => "BT2020_RGB",
            Colorspace::Bt2020Ycc => "BT2020_YCC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastRgb {
    Automatic,
    Full,
    Limited,
}

impl BroadcastRgb {
    pub fn kernel_name(self) -> &'static str {
        match self {
            BroadcastRgb::Automatic => "Automatic",
            BroadcastRgb::Full => "Full",
            BroadcastRgb::Limited => "Limited 16:235",
        }
    }
}

/// CTA-861-G electro-optical transfer functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eotf {
    TraditionalSdr = 0,
    TraditionalHdr = 1,
    Pq = 2,
    Hlg = 3,
}

/// Static HDR metadata, in the units of the HDMI infoframe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HdrMetadata {
    pub eotf: Eotf,
    /// Chromaticity of the red, green and blue primaries, in 0.00002 units
    pub display_primaries: [(u16, u16); 3],
    pub white_point: (u16, u16),
    /// cd/m²
    pub max_mastering_luminance: u16,
    /// 0.0001 cd/m²
    pub min_mastering_luminance: u16,
    pub max_cll: u16,
    pub max_fall: u16,
}

/// Size of `struct hdr_output_metadata`
pub const HDR_METADATA_SIZE: usize = 32;

impl HdrMetadata {
    /// `struct hdr_output_metadata` with a type 1 static infoframe
    pub fn to_blob_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(HDR_METADATA_SIZE);
        // HDMI_STATIC_METADATA_TYPE1
        data.extend_from_slice(&0u32.to_ne_bytes());
        data.push(self.eotf as u8);
        data.push(0);
        for (x, y) in self.display_primaries.iter().chain([&self.white_point]) {
            data.extend_from_slice(&x.to_ne_bytes());
            data.extend_from_slice(&y.to_ne_bytes());
        }
        for value in [
            self.max_mastering_luminance,
            self.min_mastering_luminance,
            self.max_cll,
            self.max_fall,
        ] {
            data.extend_from_slice(&value.to_ne_bytes());
        }
        data.resize(HDR_METADATA_SIZE, 0);
        data
    }
}

/// Connector property changes; `None` fields are left alone
pub struct ConnectorUpdate {
    pub connector: Arc<Connector>,
    pub underscan: Option<Underscan>,
    pub privacy_screen: Option<bool>,
    pub max_bpc: Option<u64>,
    pub colorspace: Option<Colorspace>,
    /// `Some(None)` clears previously set metadata
    pub hdr: Option<Option<HdrMetadata>>,
    pub broadcast_rgb: Option<BroadcastRgb>,
}

impl ConnectorUpdate {
    fn new(connector: Arc<Connector>) -> Self {
        ConnectorUpdate {
            connector,
            underscan: None,
            privacy_screen: None,
            max_bpc: None,
            colorspace: None,
            hdr: None,
            broadcast_rgb: None,
        }
    }

    fn merge(&mut self, other: ConnectorUpdate) {
        self.underscan = other.underscan.or(self.underscan);
        self.privacy_screen = other.privacy_screen.or(self.privacy_screen);
        self.max_bpc = other.max_bpc.or(self.max_bpc);
        self.colorspace = other.colorspace.or(self.colorspace);
        self.hdr = other.hdr.or(self.hdr);
        self.broadcast_rgb = other.broadcast_rgb.or(self.broadcast_rgb);
    }
}

impl fmt::Debug for ConnectorUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorUpdate")
            .field("connector", &self.connector.id())
            .field("underscan", &self.underscan)
            .field("privacy_screen", &self.privacy_screen)
            .field("max_bpc", &self.max_bpc)
            .field("colorspace", &self.colorspace)
            .field("hdr", &self.hdr)
            .field("broadcast_rgb", &self.broadcast_rgb)
            .finish()
    }
}

/// Per-channel gamma ramp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GammaLut {
    pub red: Vec<u16>,
    pub green: Vec<u16>,
    pub blue: Vec<u16>,
}

impl GammaLut {
    pub fn identity(size: usize) -> Self {
        let ramp: Vec<u16> = (0..size)
            .map(|i| match size {
                0 | 1 => u16::MAX,
                _ => (i * u16::MAX as usize / (size - 1)) as u16,
            })
            .collect();
        GammaLut {
            red: ramp.clone(),
            green: ramp.clone(),
            blue: ramp,
        }
    }

    pub fn len(&self) -> usize {
        self.red.len()
    }

    pub fn is_empty(&self) -> bool {
        self.red.is_empty()
    }

    /// Resample to `size` entries by nearest index
    pub fn resized(&self, size: usize) -> Self {
        if size == self.len() || self.is_empty() {
            return self.clone();
        }
        let pick = |channel: &[u16]| -> Vec<u16> {
            (0..size)
                .map(|i| {
                    let index = match size {
                        1 => 0,
                        _ => i * (channel.len() - 1) / (size - 1),
                    };
                    channel[index]
                })
                .collect()
        };
        GammaLut {
            red: pick(&self.red),
            green: pick(&self.green),
            blue: pick(&self.blue),
        }
    }

    /// `struct drm_color_lut` array for `GAMMA_LUT`
    pub fn to_blob_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.len() * 8);
        for ((r, g), b) in self.red.iter().zip(&self.green).zip(&self.blue) {
            for value in [*r, *g, *b, 0] {
                data.extend_from_slice(&value.to_ne_bytes());
            }
        }
        data
    }
}

/// Gamma change of one CRTC; `None` bypasses the LUT
pub struct CrtcColorUpdate {
    pub crtc: Arc<Crtc>,
    pub gamma: Option<GammaLut>,
}

pub struct CrtcUpdate {
    pub crtc: Arc<Crtc>,
    pub vrr: Option<bool>,
}

pub struct PageFlipListenerEntry {
    pub crtc: Arc<Crtc>,
    pub listener: Arc<dyn PageFlipListener>,
    pub context: CallbackContext,
}

/// Notified with the commit outcome, on `context`
pub struct ResultListener {
    pub context: CallbackContext,
    callback: Box<dyn FnOnce(&Feedback) + Send>,
}

impl ResultListener {
    pub fn new(
        context: CallbackContext,
        callback: impl FnOnce(&Feedback) + Send + 'static,
    ) -> Self {
        ResultListener {
            context,
            callback: Box::new(callback),
        }
    }

    pub fn notify(self, callbacks: &Callbacks, feedback: Feedback) {
        let callback = self.callback;
        callbacks.queue(self.context, move || callback(&feedback));
    }
}

/// Replaces the legacy page flip ioctl for one CRTC. Called again on every
/// retry.
pub type CustomPageFlipFn = Box<dyn FnMut(&dyn KernelDevice, &Crtc) -> io::Result<()> + Send>;

pub struct CustomPageFlip {
    pub crtc: Arc<Crtc>,
    pub func: CustomPageFlipFn,
}

/// Per-plane failure collected in a [`Feedback`]
#[derive(Clone)]
pub struct PlaneFeedback {
    pub plane: Arc<Plane>,
    pub crtc: Arc<Crtc>,
    pub error: KmsError,
}

impl fmt::Debug for PlaneFeedback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaneFeedback")
            .field("plane", &self.plane.id())
            .field("crtc", &self.crtc.id())
            .field("error", &self.error)
            .finish()
    }
}

/// Outcome of committing one update
#[derive(Debug, Clone)]
pub struct Feedback {
    error: Option<KmsError>,
    failed_planes: Vec<PlaneFeedback>,
}

impl Feedback {
    pub fn passed(failed_planes: Vec<PlaneFeedback>) -> Self {
        Feedback {
            error: None,
            failed_planes,
        }
    }

    pub fn failed(failed_planes: Vec<PlaneFeedback>, error: KmsError) -> Self {
        Feedback {
            error: Some(error),
            failed_planes,
        }
    }

    pub fn is_passed(&self) -> bool {
        self.error.is_none()
    }

    pub fn error(&self) -> Option<&KmsError> {
        self.error.as_ref()
    }

    pub fn failed_planes(&self) -> &[PlaneFeedback] {
        &self.failed_planes
    }

    pub fn failed_plane_ids(&self) -> Vec<u32> {
        self.failed_planes.iter().map(|f| f.plane.id()).collect()
    }

    /// Combine feedback of several devices; passes only if all passed
    pub fn merge(mut self, other: Feedback) -> Self {
        if self.error.is_none() {
            self.error = other.error;
        }
        self.failed_planes.extend(other.failed_planes);
        self
    }
}

#[derive(Clone, Default)]
enum Latch {
    #[default]
    Unset,
    Crtc(Arc<Crtc>),
    Unlatchable,
}

/// Intended display changes, committed as one unit per device
#[derive(Default)]
pub struct Update {
    mode_sets: Vec<ModeSet>,
    plane_assignments: Vec<PlaneAssignment>,
    connector_updates: Vec<ConnectorUpdate>,
    crtc_color_updates: Vec<CrtcColorUpdate>,
    crtc_updates: Vec<CrtcUpdate>,
    page_flip_listeners: Vec<PageFlipListenerEntry>,
    result_listeners: Vec<ResultListener>,
    custom_page_flip: Option<CustomPageFlip>,
    latch: Latch,
    needs_modeset: bool,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    fn latch_on(&mut self, crtc: &Arc<Crtc>) {
        self.latch = match &self.latch {
            Latch::Unset => Latch::Crtc(crtc.clone()),
            Latch::Crtc(latched)
                if latched.id() == crtc.id() && latched.device() == crtc.device() =>
            {
                Latch::Crtc(latched.clone())
            }
            _ => Latch::Unlatchable,
        };
    }

    /// The single CRTC this update touches, if there is exactly one
    pub fn latch_crtc(&self) -> Option<&Arc<Crtc>> {
        match &self.latch {
            Latch::Crtc(crtc) => Some(crtc),
            _ => None,
        }
    }

    fn push_assignment(&mut self, mut assignment: PlaneAssignment) -> &mut PlaneAssignment {
        let plane_id = assignment.plane.id();
        let device = assignment.plane.device();
        if let Some(index) = self
            .plane_assignments
            .iter()
            .position(|a| a.plane.id() == plane_id && a.plane.device() == device)
        {
            let old = self.plane_assignments.remove(index);
            if !old.flags.contains(AssignPlaneFlags::FB_UNCHANGED) {
                assignment.flags.remove(AssignPlaneFlags::FB_UNCHANGED);
            }
        }
        self.latch_on(&assignment.crtc);
        self.plane_assignments.push(assignment);
        let last = self.plane_assignments.len() - 1;
        &mut self.plane_assignments[last]
    }

    /// Show `buffer` on `plane`. Assigning a plane twice replaces the
    /// earlier assignment.
    pub fn assign_plane(
        &mut self,
        crtc: &Arc<Crtc>,
        plane: &Arc<Plane>,
        buffer: Arc<ScanoutBuffer>,
        src: Rectangle<f64, Buffer>,
        dst: Rectangle<i32, Physical>,
        flags: AssignPlaneFlags,
    ) -> &mut PlaneAssignment {
        self.push_assignment(PlaneAssignment {
            crtc: crtc.clone(),
            plane: plane.clone(),
            buffer: Some(buffer),
            src,
            dst,
            flags,
            rotation: None,
            fb_damage: None,
            cursor_hotspot: None,
        })
    }

    /// Turn `plane` off
    pub fn unassign_plane(&mut self, crtc: &Arc<Crtc>, plane: &Arc<Plane>) -> &mut PlaneAssignment {
        self.push_assignment(PlaneAssignment {
            crtc: crtc.clone(),
            plane: plane.clone(),
            buffer: None,
            src: Rectangle::default(),
            dst: Rectangle::default(),
            flags: AssignPlaneFlags::empty(),
            rotation: None,
            fb_damage: None,
            cursor_hotspot: None,
        })
    }

    pub fn mode_set(
        &mut self,
        crtc: &Arc<Crtc>,
        connectors: &[Arc<Connector>],
        mode: Option<Mode>,
    ) {
        self.mode_sets
            .retain(|ms| !(ms.crtc.id() == crtc.id() && ms.crtc.device() == crtc.device()));
        self.mode_sets.push(ModeSet {
            crtc: crtc.clone(),
            connectors: connectors.to_vec(),
            mode,
        });
    }

    fn connector_update(&mut self, connector: &Arc<Connector>) -> &mut ConnectorUpdate {
        let index = match self.connector_updates.iter().position(|u| {
            u.connector.id() == connector.id() && u.connector.device() == connector.device()
        }) {
            Some(index) => index,
            None => {
                self.connector_updates
                    .push(ConnectorUpdate::new(connector.clone()));
                self.connector_updates.len() - 1
            }
        };
        &mut self.connector_updates[index]
    }

    pub fn set_underscanning(&mut self, connector: &Arc<Connector>, hborder: u64, vborder: u64) {
        self.connector_update(connector).underscan = Some(Underscan::On { hborder, vborder });
    }

    pub fn unset_underscanning(&mut self, connector: &Arc<Connector>) {
        self.connector_update(connector).underscan = Some(Underscan::Off);
    }

    pub fn set_privacy_screen(&mut self, connector: &Arc<Connector>, enabled: bool) {
        self.connector_update(connector).privacy_screen = Some(enabled);
    }

    pub fn set_max_bpc(&mut self, connector: &Arc<Connector>, max_bpc: u64) {
        self.connector_update(connector).max_bpc = Some(max_bpc);
    }

    pub fn set_colorspace(&mut self, connector: &Arc<Connector>, colorspace: Colorspace) {
        self.connector_update(connector).colorspace = Some(colorspace);
    }

    /// Changing HDR metadata requires a mode set
    pub fn set_hdr_metadata(&mut self, connector: &Arc<Connector>, metadata: Option<HdrMetadata>) {
        self.connector_update(connector).hdr = Some(metadata);
        self.needs_modeset = true;
    }

    pub fn set_broadcast_rgb(&mut self, connector: &Arc<Connector>, broadcast_rgb: BroadcastRgb) {
        self.connector_update(connector).broadcast_rgb = Some(broadcast_rgb);
    }

    /// Set the gamma ramp, resampled to the CRTC's LUT size. `None` bypasses
    /// gamma correction.
    pub fn set_crtc_gamma(&mut self, crtc: &Arc<Crtc>, gamma: Option<&GammaLut>) {
        let gamma = gamma.map(|lut| lut.resized(crtc.gamma_size() as usize));
        self.crtc_color_updates
            .retain(|u| !(u.crtc.id() == crtc.id() && u.crtc.device() == crtc.device()));
        self.crtc_color_updates.push(CrtcColorUpdate {
            crtc: crtc.clone(),
            gamma,
        });
        self.latch_on(crtc);
    }

    pub fn set_vrr(&mut self, crtc: &Arc<Crtc>, enabled: bool) {
        self.crtc_updates
            .retain(|u| !(u.crtc.id() == crtc.id() && u.crtc.device() == crtc.device()));
        self.crtc_updates.push(CrtcUpdate {
            crtc: crtc.clone(),
            vrr: Some(enabled),
        });
    }

    pub fn add_page_flip_listener(
        &mut self,
        crtc: &Arc<Crtc>,
        listener: Arc<dyn PageFlipListener>,
        context: CallbackContext,
    ) {
        self.page_flip_listeners.push(PageFlipListenerEntry {
            crtc: crtc.clone(),
            listener,
            context,
        });
    }

    pub fn add_result_listener(
        &mut self,
        context: CallbackContext,
        callback: impl FnOnce(&Feedback) + Send + 'static,
    ) {
        self.result_listeners
            .push(ResultListener::new(context, callback));
    }

    pub fn set_custom_page_flip(
        &mut self,
        crtc: &Arc<Crtc>,
        func: impl FnMut(&dyn KernelDevice, &Crtc) -> io::Result<()> + Send + 'static,
    ) {
        self.custom_page_flip = Some(CustomPageFlip {
            crtc: crtc.clone(),
            func: Box::new(func),
        });
    }

    /// Fold `other` into `self`. Entries of `other` replace ours per
    /// CRTC/plane; connector changes merge field by field; listeners are
    /// appended.
    pub fn merge_from(&mut self, other: Update) {
        let Update {
            mode_sets,
            plane_assignments,
            connector_updates,
            crtc_color_updates,
            crtc_updates,
            page_flip_listeners,
            result_listeners,
            custom_page_flip,
            latch,
            needs_modeset,
        } = other;

        for mode_set in mode_sets {
            self.mode_set(&mode_set.crtc, &mode_set.connectors, mode_set.mode);
        }
        for assignment in plane_assignments {
            self.push_assignment(assignment);
        }
        for update in connector_updates {
            let connector = update.connector.clone();
            self.connector_update(&connector).merge(update);
        }
        for update in crtc_color_updates {
            self.crtc_color_updates.retain(|u| {
                !(u.crtc.id() == update.crtc.id() && u.crtc.device() == update.crtc.device())
            });
            self.latch_on(&update.crtc);
            self.crtc_color_updates.push(update);
        }
        for update in crtc_updates {
            self.crtc_updates.retain(|u| {
                !(u.crtc.id() == update.crtc.id() && u.crtc.device() == update.crtc.device())
            });
            self.crtc_updates.push(update);
        }
        self.page_flip_listeners.extend(page_flip_listeners);
        self.result_listeners.extend(result_listeners);
        if custom_page_flip.is_some() {
            self.custom_page_flip = custom_page_flip;
        }
        if matches!(latch, Latch::Unlatchable) {
            self.latch = Latch::Unlatchable;
        }
        self.needs_modeset |= needs_modeset;
    }

    /// Devices this update touches, in first-seen order
    pub fn devices(&self) -> Vec<DeviceId> {
        let mut devices = Vec::new();
        let ids = self
            .mode_sets
            .iter()
            .map(|ms| ms.crtc.device())
            .chain(self.plane_assignments.iter().map(|a| a.crtc.device()))
            .chain(self.connector_updates.iter().map(|u| u.connector.device()))
            .chain(self.crtc_color_updates.iter().map(|u| u.crtc.device()))
            .chain(self.crtc_updates.iter().map(|u| u.crtc.device()))
            .chain(self.page_flip_listeners.iter().map(|l| l.crtc.device()));
        for id in ids {
            if !devices.contains(&id) {
                devices.push(id);
            }
        }
        devices
    }

    /// One update per device. Result listeners stay behind; they belong to
    /// the combined outcome.
    pub fn split_by_device(&mut self) -> IndexMap<DeviceId, Update> {
        let mut split: IndexMap<DeviceId, Update> = self
            .devices()
            .into_iter()
            .map(|device| (device, Update::new()))
            .collect();

        for ms in self.mode_sets.drain(..) {
            if let Some(update) = split.get_mut(&ms.crtc.device()) {
                update.mode_sets.push(ms);
            }
        }
        for assignment in self.plane_assignments.drain(..) {
            if let Some(update) = split.get_mut(&assignment.crtc.device()) {
                update.latch_on(&assignment.crtc);
                update.plane_assignments.push(assignment);
            }
        }
        for connector_update in self.connector_updates.drain(..) {
            if let Some(update) = split.get_mut(&connector_update.connector.device()) {
                if connector_update.hdr.is_some() {
                    update.needs_modeset = true;
                }
                update.connector_updates.push(connector_update);
            }
        }
        for color in self.crtc_color_updates.drain(..) {
            if let Some(update) = split.get_mut(&color.crtc.device()) {
                update.latch_on(&color.crtc);
                update.crtc_color_updates.push(color);
            }
        }
        for crtc_update in self.crtc_updates.drain(..) {
            if let Some(update) = split.get_mut(&crtc_update.crtc.device()) {
                update.crtc_updates.push(crtc_update);
            }
        }
        for listener in self.page_flip_listeners.drain(..) {
            if let Some(update) = split.get_mut(&listener.crtc.device()) {
                update.page_flip_listeners.push(listener);
            }
        }
        if let Some(custom) = self.custom_page_flip.take() {
            if let Some(update) = split.get_mut(&custom.crtc.device()) {
                update.custom_page_flip = Some(custom);
            }
        }
        self.latch = Latch::Unset;
        self.needs_modeset = false;
        split
    }

    /// Nothing that would reach the kernel
    pub fn is_empty(&self) -> bool {
        self.mode_sets.is_empty()
            && self.plane_assignments.is_empty()
            && self.connector_updates.is_empty()
            && self.crtc_color_updates.is_empty()
            && self.crtc_updates.is_empty()
    }

    pub fn needs_modeset(&self) -> bool {
        self.needs_modeset || !self.mode_sets.is_empty()
    }

    pub fn mode_sets(&self) -> &[ModeSet] {
        &self.mode_sets
    }

    pub fn mode_set_for(&self, crtc: &Crtc) -> Option<&ModeSet> {
        self.mode_sets
            .iter()
            .find(|ms| ms.crtc.id() == crtc.id() && ms.crtc.device() == crtc.device())
    }

    pub fn plane_assignments(&self) -> &[PlaneAssignment] {
        &self.plane_assignments
    }

    pub fn plane_assignment(&self, plane: &Plane) -> Option<&PlaneAssignment> {
        self.plane_assignments
            .iter()
            .find(|a| a.plane.id() == plane.id() && a.plane.device() == plane.device())
    }

    pub fn connector_updates(&self) -> &[ConnectorUpdate] {
        &self.connector_updates
    }

    pub fn crtc_color_updates(&self) -> &[CrtcColorUpdate] {
        &self.crtc_color_updates
    }

    pub fn crtc_updates(&self) -> &[CrtcUpdate] {
        &self.crtc_updates
    }

    pub fn page_flip_listeners(&self) -> &[PageFlipListenerEntry] {
        &self.page_flip_listeners
    }

    pub fn has_result_listeners(&self) -> bool {
        !self.result_listeners.is_empty()
    }

    pub fn take_page_flip_listeners(&mut self) -> Vec<PageFlipListenerEntry> {
        std::mem::take(&mut self.page_flip_listeners)
    }

    pub fn take_result_listeners(&mut self) -> Vec<ResultListener> {
        std::mem::take(&mut self.result_listeners)
    }

    pub fn take_custom_page_flip(&mut self) -> Option<CustomPageFlip> {
        self.custom_page_flip.take()
    }

    pub fn has_custom_page_flip(&self) -> bool {
        self.custom_page_flip.is_some()
    }
}

impl fmt::Debug for Update {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Update")
            .field("mode_sets", &self.mode_sets)
            .field("plane_assignments", &self.plane_assignments)
            .field("connector_updates", &self.connector_updates)
            .field("color_updates", &self.crtc_color_updates.len())
            .field("crtc_updates", &self.crtc_updates.len())
            .field("page_flip_listeners", &self.page_flip_listeners.len())
            .field("result_listeners", &self.result_listeners.len())
            .field("needs_modeset", &self.needs_modeset())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::{testing::*, *};
    use crate::backend::kms::{
        kernel::mock::MockResources, page_flip::testing::RecordingListener,
        resources::DeviceResources,
    };
    use smithay::utils::{Point, Size};

    fn resources(device: u32) -> DeviceResources {
        DeviceResources::from_raw(DeviceId(device), &MockResources::dual_output().build())
    }

    #[test]
    fn reassigning_a_plane_replaces_and_clears_fb_unchanged() {
        let res = resources(0);
        let crtc = &res.crtcs[0];
        let plane = res.primary_plane_for(crtc).unwrap();
        let (src, dst) = full_rects((1920, 1080));

        let mut update = Update::new();
        let buf = buffer(DeviceId(0), (1920, 1080));
        update.assign_plane(crtc, plane, buf, src, dst, AssignPlaneFlags::empty());
        update.assign_plane(
            crtc,
            plane,
            buffer(DeviceId(0), (1920, 1080)),
            src,
            dst,
            AssignPlaneFlags::FB_UNCHANGED,
        );
        assert_eq!(update.plane_assignments().len(), 1);
        assert!(!update.plane_assignments()[0]
            .flags
            .contains(AssignPlaneFlags::FB_UNCHANGED));

        let mut update = Update::new();
        for _ in 0..2 {
            update.assign_plane(
                crtc,
                plane,
                buffer(DeviceId(0), (1920, 1080)),
                src,
                dst,
                AssignPlaneFlags::FB_UNCHANGED,
            );
        }
        assert!(update.plane_assignments()[0]
            .flags
            .contains(AssignPlaneFlags::FB_UNCHANGED));
    }

    #[test]
    fn latch_follows_the_single_touched_crtc() {
        let res = resources(0);
        let (a, b) = (&res.crtcs[0], &res.crtcs[1]);
        let (src, dst) = full_rects((64, 64));

        let mut update = Update::new();
        assert!(update.latch_crtc().is_none());
        update.assign_plane(
            a,
            res.cursor_plane_for(a).unwrap(),
            cursor_buffer(DeviceId(0)),
            src,
            dst,
            AssignPlaneFlags::empty(),
        );
        update.set_crtc_gamma(a, None);
        assert_eq!(update.latch_crtc().map(|c| c.id()), Some(a.id()));

        update.unassign_plane(b, res.cursor_plane_for(b).unwrap());
        assert!(update.latch_crtc().is_none());
    }

    #[test]
    fn gamma_is_resampled_to_crtc_size() {
        let res = resources(0);
        let crtc = &res.crtcs[0];
        let lut = GammaLut::identity(1024);

        let mut update = Update::new();
        update.set_crtc_gamma(crtc, Some(&lut));
        let gamma = update.crtc_color_updates()[0].gamma.as_ref().unwrap();
        assert_eq!(gamma.len(), crtc.gamma_size() as usize);
        assert_eq!(gamma.red[0], 0);
        assert_eq!(*gamma.red.last().unwrap(), u16::MAX);
        assert_eq!(gamma.to_blob_data().len(), 256 * 8);
    }

    #[test]
    fn hdr_metadata_forces_modeset() {
        let res = resources(0);
        let connector = &res.connectors[0];
        let metadata = HdrMetadata {
            eotf: Eotf::Pq,
            display_primaries: [(34000, 16000), (13250, 34500), (7500, 3000)],
            white_point: (15635, 16450),
            max_mastering_luminance: 1000,
            min_mastering_luminance: 50,
            max_cll: 1000,
            max_fall: 400,
        };

        let mut update = Update::new();
        update.set_max_bpc(connector, 10);
        assert!(!update.needs_modeset());
        assert!(!update.is_empty());
        update.set_hdr_metadata(connector, Some(metadata));
        assert!(update.needs_modeset());
        assert_eq!(update.connector_updates().len(), 1);
        assert_eq!(update.connector_updates()[0].max_bpc, Some(10));

        let blob = metadata.to_blob_data();
        assert_eq!(blob.len(), HDR_METADATA_SIZE);
        assert_eq!(blob[4], Eotf::Pq as u8);
    }

    #[test]
    fn listeners_alone_are_an_empty_update() {
        let res = resources(0);
        let mut update = Update::new();
        update.add_page_flip_listener(
            &res.crtcs[0],
            RecordingListener::new(),
            CallbackContext::MAIN,
        );
        update.add_result_listener(CallbackContext::MAIN, |_| {});
        assert!(update.is_empty());
        assert!(update.has_result_listeners());
    }

    #[test]
    fn merge_replaces_per_object_and_appends_listeners() {
        let res = resources(0);
        let crtc = &res.crtcs[0];
        let connector = &res.connectors[0];
        let plane = res.primary_plane_for(crtc).unwrap();
        let (src, dst) = full_rects((1920, 1080));

        let mut first = Update::new();
        first.mode_set(crtc, &[connector.clone()], Some(MockResources::mode_720p()));
        first.set_privacy_screen(connector, true);
        let small = buffer(DeviceId(0), (1280, 720));
        first.assign_plane(crtc, plane, small, src, dst, AssignPlaneFlags::empty());
        first.add_page_flip_listener(crtc, RecordingListener::new(), CallbackContext::MAIN);

        let mut second = Update::new();
        second.mode_set(crtc, &[connector.clone()], Some(MockResources::mode_1080p()));
        second.set_broadcast_rgb(connector, BroadcastRgb::Full);
        let large = buffer(DeviceId(0), (1920, 1080));
        second.assign_plane(crtc, plane, large, src, dst, AssignPlaneFlags::empty());
        second.add_page_flip_listener(crtc, RecordingListener::new(), CallbackContext::MAIN);

        first.merge_from(second);
        assert_eq!(first.mode_sets().len(), 1);
        assert_eq!(first.mode_sets()[0].mode, Some(MockResources::mode_1080p()));
        assert_eq!(first.plane_assignments().len(), 1);
        assert_eq!(first.plane_assignments()[0].buffer.as_ref().unwrap().width(), 1920);
        let connector_update = &first.connector_updates()[0];
        assert_eq!(connector_update.privacy_screen, Some(true));
        assert_eq!(connector_update.broadcast_rgb, Some(BroadcastRgb::Full));
        assert_eq!(first.page_flip_listeners().len(), 2);
    }

    #[test]
    fn split_by_device_keeps_result_listeners_behind() {
        let res0 = resources(0);
        let res1 = resources(1);
        let mut update = Update::new();
        update.set_vrr(&res0.crtcs[0], true);
        update.set_max_bpc(&res1.connectors[0], 8);
        update.add_page_flip_listener(
            &res1.crtcs[0],
            RecordingListener::new(),
            CallbackContext::MAIN,
        );
        update.add_result_listener(CallbackContext::MAIN, |_| {});

        let split = update.split_by_device();
        assert_eq!(split.keys().copied().collect::<Vec<_>>(), vec![DeviceId(0), DeviceId(1)]);
        assert_eq!(split[&DeviceId(0)].crtc_updates().len(), 1);
        assert_eq!(split[&DeviceId(1)].connector_updates().len(), 1);
        assert_eq!(split[&DeviceId(1)].page_flip_listeners().len(), 1);
        assert!(update.is_empty());
        assert_eq!(update.take_result_listeners().len(), 1);
    }

    #[test]
    fn damage_blob_uses_corner_coordinates() {
        let res = resources(0);
        let crtc = &res.crtcs[0];
        let (src, dst) = full_rects((1920, 1080));
        let mut update = Update::new();
        let assignment = update.assign_plane(
            crtc,
            res.primary_plane_for(crtc).unwrap(),
            buffer(DeviceId(0), (1920, 1080)),
            src,
            dst,
            AssignPlaneFlags::empty(),
        );
        assignment.set_fb_damage(vec![Rectangle::new(Point::from((10, 20)), Size::from((30, 40)))]);
        let blob = assignment.fb_damage_blob().unwrap();
        assert_eq!(blob.len(), 16);
        assert_eq!(&blob[8..12], &40i32.to_ne_bytes());
        assert_eq!(&blob[12..16], &60i32.to_ne_bytes());
    }

    #[test]
    fn feedback_merge_fails_if_any_failed() {
        let passed = Feedback::passed(Vec::new());
        let failed = Feedback::failed(Vec::new(), KmsError::failed("nope"));
        assert!(!passed.clone().merge(failed.clone()).is_passed());
        assert!(!failed.merge(passed.clone()).is_passed());
        assert!(passed.clone().merge(passed).is_passed());
    }
}
