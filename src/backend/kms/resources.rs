// SPDX-License-Identifier: GPL-3.0-only

//! Kernel display objects as seen by the rest of the backend.
//!
//! Every object is an immutable snapshot shared through `Arc`. A hot-plug
//! refresh builds new snapshots instead of mutating the old ones, so an
//! `Update` holding a handle never observes a half-refreshed table.

use bitflags::bitflags;
use indexmap::IndexMap;
use std::{
    collections::HashMap,
    fmt,
    hash::Hash,
    sync::{Arc, OnceLock},
};

use super::{
    drm_helpers,
    error::{KmsError, KmsResult},
    kernel::{RawConnector, RawCrtc, RawPlane, RawProperty, RawResources},
};

/// Identifies one device inside a `Kms` instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device{}", self.0)
    }
}

/// A property enum whose variants map onto kernel property names
pub trait PropName: Copy + Eq + Hash + fmt::Debug + 'static {
    const ALL: &'static [Self];
    fn name(self) -> &'static str;
}

macro_rules! kernel_props {
    ($(#[$meta:meta])* $ty:ident { $($variant:ident => $name:literal,)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $ty {
            $($variant,)*
        }

        impl PropName for $ty {
            const ALL: &'static [Self] = &[$($ty::$variant,)*];

            fn name(self) -> &'static str {
                match self {
                    $($ty::$variant => $name,)*
                }
            }
        }
    };
}

kernel_props!(
    /// CRTC properties we know how to drive
    CrtcProp {
        ModeId => "MODE_ID",
        Active => "ACTIVE",
        GammaLut => "GAMMA_LUT",
        GammaLutSize => "GAMMA_LUT_SIZE",
        VrrEnabled => "VRR_ENABLED",
    }
);

kernel_props!(
    /// Plane properties we know how to drive
    PlaneProp {
        Type => "type",
        FbId => "FB_ID",
        CrtcId => "CRTC_ID",
        SrcX => "SRC_X",
        SrcY => "SRC_Y",
        SrcW => "SRC_W",
        SrcH => "SRC_H",
        CrtcX => "CRTC_X",
        CrtcY => "CRTC_Y",
        CrtcW => "CRTC_W",
        CrtcH => "CRTC_H",
        Rotation => "rotation",
        FbDamageClips => "FB_DAMAGE_CLIPS",
        HotspotX => "HOTSPOT_X",
        HotspotY => "HOTSPOT_Y",
        InFormats => "IN_FORMATS",
    }
);

kernel_props!(
    /// Connector properties we know how to drive
    ConnectorProp {
        CrtcId => "CRTC_ID",
        Dpms => "DPMS",
        Underscan => "underscan",
        UnderscanHBorder => "underscan hborder",
        UnderscanVBorder => "underscan vborder",
        PrivacyScreenSwState => "privacy-screen sw-state",
        PrivacyScreenHwState => "privacy-screen hw-state",
        MaxBpc => "max bpc",
        Colorspace => "Colorspace",
        HdrOutputMetadata => "HDR_OUTPUT_METADATA",
        BroadcastRgb => "Broadcast RGB",
        VrrCapable => "vrr_capable",
    }
);

#[derive(Debug, Clone)]
struct PropEntry {
    id: u32,
    value: u64,
    enums: Vec<(String, u64)>,
}

/// Property-name to id table, populated once from a discovery snapshot
#[derive(Clone)]
pub struct PropTable<P: PropName> {
    entries: HashMap<P, PropEntry>,
}

impl<P: PropName> PropTable<P> {
    pub fn from_raw(props: &[RawProperty]) -> Self {
        let entries = P::ALL
            .iter()
            .filter_map(|prop| {
                props
                    .iter()
                    .find(|raw| raw.name == prop.name())
                    .map(|raw| {
                        (
                            *prop,
                            PropEntry {
                                id: raw.id,
                                value: raw.value,
                                enums: raw.enums.clone(),
                            },
                        )
                    })
            })
            .collect();
        PropTable { entries }
    }

    pub fn id(&self, prop: P) -> Option<u32> {
        self.entries.get(&prop).map(|entry| entry.id)
    }

    /// Value of the property at discovery time
    pub fn value(&self, prop: P) -> Option<u64> {
        self.entries.get(&prop).map(|entry| entry.value)
    }

    /// Kernel value of an enum property's named entry
    pub fn enum_value(&self, prop: P, name: &str) -> Option<u64> {
        self.entries
            .get(&prop)?
            .enums
            .iter()
            .find(|(entry, _)| entry == name)
            .map(|(_, value)| *value)
    }

    pub fn require(&self, prop: P, object: &dyn fmt::Display) -> KmsResult<u32> {
        self.id(prop).ok_or_else(|| KmsError::MissingProperty {
            object: object.to_string(),
            prop: prop.name(),
        })
    }
}

impl<P: PropName> fmt::Debug for PropTable<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(prop, entry)| (prop.name(), entry.id)))
            .finish()
    }
}

/// Display timings
#[derive(Clone)]
pub struct Mode {
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub hskew: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vscan: u16,
    pub vrefresh: u32,
    pub flags: u32,
    pub mode_type: u32,
    pub name: String,
    blob: OnceLock<Vec<u8>>,
}

/// Size of `struct drm_mode_modeinfo`
const MODEINFO_SIZE: usize = 68;

impl Mode {
    pub fn new(
        clock: u32,
        (hdisplay, hsync_start, hsync_end, htotal): (u16, u16, u16, u16),
        (vdisplay, vsync_start, vsync_end, vtotal): (u16, u16, u16, u16),
        flags: u32,
        mode_type: u32,
        name: impl Into<String>,
    ) -> Self {
        let mut mode = Mode {
            clock,
            hdisplay,
            hsync_start,
            hsync_end,
            htotal,
            hskew: 0,
            vdisplay,
            vsync_start,
            vsync_end,
            vtotal,
            vscan: 0,
            vrefresh: 0,
            flags,
            mode_type,
            name: name.into(),
            blob: OnceLock::new(),
        };
        mode.vrefresh = (drm_helpers::calculate_refresh_rate(&mode) + 500) / 1000;
        mode
    }

    pub fn size(&self) -> (u16, u16) {
        (self.hdisplay, self.vdisplay)
    }

    /// Refresh rate in Hz
    pub fn refresh_rate(&self) -> f64 {
        drm_helpers::calculate_refresh_rate(self) as f64 / 1000.0
    }

    pub fn is_preferred(&self) -> bool {
        self.mode_type & drm_ffi::DRM_MODE_TYPE_PREFERRED != 0
    }

    /// The mode serialized as `struct drm_mode_modeinfo`, ready to be
    /// uploaded as a property blob
    pub fn blob_data(&self) -> &[u8] {
        self.blob.get_or_init(|| {
            let mut data = Vec::with_capacity(MODEINFO_SIZE);
            data.extend_from_slice(&self.clock.to_ne_bytes());
            for value in [
                self.hdisplay,
                self.hsync_start,
                self.hsync_end,
                self.htotal,
                self.hskew,
                self.vdisplay,
                self.vsync_start,
                self.vsync_end,
                self.vtotal,
                self.vscan,
            ] {
                data.extend_from_slice(&value.to_ne_bytes());
            }
            data.extend_from_slice(&self.vrefresh.to_ne_bytes());
            data.extend_from_slice(&self.flags.to_ne_bytes());
            data.extend_from_slice(&self.mode_type.to_ne_bytes());
            let mut name = [0u8; 32];
            let len = self.name.len().min(31);
            name[..len].copy_from_slice(&self.name.as_bytes()[..len]);
            data.extend_from_slice(&name);
            data
        })
    }

    pub fn to_drm(&self) -> drm::control::Mode {
        let mut name: [core::ffi::c_char; 32] = [0; 32];
        for (dst, src) in name.iter_mut().zip(self.name.bytes().take(31)) {
            *dst = src as core::ffi::c_char;
        }
        drm::control::Mode::from(drm_ffi::drm_mode_modeinfo {
            clock: self.clock,
            hdisplay: self.hdisplay,
            hsync_start: self.hsync_start,
            hsync_end: self.hsync_end,
            htotal: self.htotal,
            hskew: self.hskew,
            vdisplay: self.vdisplay,
            vsync_start: self.vsync_start,
            vsync_end: self.vsync_end,
            vtotal: self.vtotal,
            vscan: self.vscan,
            vrefresh: self.vrefresh,
            flags: self.flags,
            type_: self.mode_type,
            name,
        })
    }
}

impl From<drm::control::Mode> for Mode {
    fn from(mode: drm::control::Mode) -> Self {
        let (hdisplay, vdisplay) = mode.size();
        let (hsync_start, hsync_end, htotal) = mode.hsync();
        let (vsync_start, vsync_end, vtotal) = mode.vsync();
        Mode {
            clock: mode.clock(),
            hdisplay,
            hsync_start,
            hsync_end,
            htotal,
            hskew: mode.hskew(),
            vdisplay,
            vsync_start,
            vsync_end,
            vtotal,
            vscan: mode.vscan(),
            vrefresh: mode.vrefresh(),
            flags: mode.flags().bits(),
            mode_type: mode.mode_type().bits(),
            name: mode.name().to_string_lossy().into_owned(),
            blob: OnceLock::new(),
        }
    }
}

impl PartialEq for Mode {
    fn eq(&self, other: &Self) -> bool {
        self.clock == other.clock
            && self.hdisplay == other.hdisplay
            && self.hsync_start == other.hsync_start
            && self.hsync_end == other.hsync_end
            && self.htotal == other.htotal
            && self.hskew == other.hskew
            && self.vdisplay == other.vdisplay
            && self.vsync_start == other.vsync_start
            && self.vsync_end == other.vsync_end
            && self.vtotal == other.vtotal
            && self.vscan == other.vscan
            && self.flags == other.flags
    }
}

impl Eq for Mode {}

impl fmt::Debug for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Mode({} {}x{}@{:.3})",
            self.name,
            self.hdisplay,
            self.vdisplay,
            self.refresh_rate()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneType {
    Primary,
    Cursor,
    Overlay,
}

impl PlaneType {
    /// Maps the value of the kernel "type" property
    pub fn from_kernel(value: u64) -> Self {
        match value {
            1 => PlaneType::Primary,
            2 => PlaneType::Cursor,
            _ => PlaneType::Overlay,
        }
    }
}

bitflags! {
    /// Mirrors `DRM_MODE_ROTATE_*` and `DRM_MODE_REFLECT_*`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Rotation: u32 {
        const ROTATE_0 = 1 << 0;
        const ROTATE_90 = 1 << 1;
        const ROTATE_180 = 1 << 2;
        const ROTATE_270 = 1 << 3;
        const REFLECT_X = 1 << 4;
        const REFLECT_Y = 1 << 5;
    }
}

pub struct Crtc {
    device: DeviceId,
    id: u32,
    index: usize,
    gamma_size: u32,
    current_mode: Option<Mode>,
    props: PropTable<CrtcProp>,
}

impl Crtc {
    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn gamma_size(&self) -> u32 {
        self.gamma_size
    }

    /// Mode the CRTC was driving when it was discovered
    pub fn current_mode(&self) -> Option<&Mode> {
        self.current_mode.as_ref()
    }

    pub fn props(&self) -> &PropTable<CrtcProp> {
        &self.props
    }

    pub fn supports_vrr(&self) -> bool {
        self.props.id(CrtcProp::VrrEnabled).is_some()
    }
}

impl fmt::Display for Crtc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CRTC {}", self.id)
    }
}

impl fmt::Debug for Crtc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Crtc")
            .field("device", &self.device)
            .field("id", &self.id)
            .field("index", &self.index)
            .finish()
    }
}

pub struct Plane {
    device: DeviceId,
    id: u32,
    plane_type: PlaneType,
    possible_crtcs: u32,
    formats: IndexMap<u32, Vec<u64>>,
    rotations: Rotation,
    props: PropTable<PlaneProp>,
}

impl Plane {
    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn plane_type(&self) -> PlaneType {
        self.plane_type
    }

    pub fn props(&self) -> &PropTable<PlaneProp> {
        &self.props
    }

    pub fn is_usable_with(&self, crtc: &Crtc) -> bool {
        crtc.device == self.device && self.possible_crtcs & (1 << crtc.index) != 0
    }

    pub fn formats(&self) -> impl Iterator<Item = u32> + '_ {
        self.formats.keys().copied()
    }

    pub fn is_format_supported(&self, format: u32) -> bool {
        self.formats.contains_key(&format)
    }

    /// An empty modifier list means the plane only reported the format, in
    /// which case implicit modifiers are assumed
    pub fn is_modifier_supported(&self, format: u32, modifier: u64) -> bool {
        match self.formats.get(&format) {
            Some(modifiers) => {
                modifiers.is_empty()
                    || modifiers.contains(&modifier)
                    || modifier == drm_helpers::DRM_FORMAT_MOD_INVALID
            }
            None => false,
        }
    }

    pub fn supported_rotations(&self) -> Rotation {
        self.rotations
    }

    pub fn supports_cursor_hotspot(&self) -> bool {
        self.props.id(PlaneProp::HotspotX).is_some() && self.props.id(PlaneProp::HotspotY).is_some()
    }
}

impl fmt::Display for Plane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "plane {}", self.id)
    }
}

impl fmt::Debug for Plane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plane")
            .field("device", &self.device)
            .field("id", &self.id)
            .field("type", &self.plane_type)
            .finish()
    }
}

pub struct Connector {
    device: DeviceId,
    id: u32,
    name: String,
    connected: bool,
    modes: Vec<Mode>,
    possible_crtcs: u32,
    current_crtc: Option<u32>,
    props: PropTable<ConnectorProp>,
}

impl Connector {
    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn modes(&self) -> &[Mode] {
        &self.modes
    }

    pub fn preferred_mode(&self) -> Option<&Mode> {
        self.modes
            .iter()
            .find(|mode| mode.is_preferred())
            .or_else(|| self.modes.first())
    }

    pub fn can_drive(&self, crtc: &Crtc) -> bool {
        crtc.device == self.device && self.possible_crtcs & (1 << crtc.index) != 0
    }

    pub fn current_crtc(&self) -> Option<u32> {
        self.current_crtc
    }

    pub fn props(&self) -> &PropTable<ConnectorProp> {
        &self.props
    }
}

impl fmt::Display for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connector {} ({})", self.id, self.name)
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("device", &self.device)
            .field("id", &self.id)
            .field("name", &self.name)
            .field("connected", &self.connected)
            .finish()
    }
}

bitflags! {
    /// Which object tables changed during a hot-plug refresh
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ResourceChanges: u32 {
        const CRTCS = 1 << 0;
        const PLANES = 1 << 1;
        const CONNECTORS = 1 << 2;
    }
}

/// All display objects of one device
#[derive(Debug, Clone, Default)]
pub struct DeviceResources {
    pub crtcs: Vec<Arc<Crtc>>,
    pub planes: Vec<Arc<Plane>>,
    pub connectors: Vec<Arc<Connector>>,
}

impl DeviceResources {
    pub fn from_raw(device: DeviceId, raw: &RawResources) -> Self {
        let crtcs = raw
            .crtcs
            .iter()
            .enumerate()
            .map(|(index, crtc)| Arc::new(build_crtc(device, index, crtc)))
            .collect();
        let planes = raw
            .planes
            .iter()
            .map(|plane| Arc::new(build_plane(device, plane)))
            .collect();
        let connectors = raw
            .connectors
            .iter()
            .map(|connector| Arc::new(build_connector(device, connector)))
            .collect();
        DeviceResources {
            crtcs,
            planes,
            connectors,
        }
    }

    pub fn crtc(&self, id: u32) -> Option<&Arc<Crtc>> {
        self.crtcs.iter().find(|crtc| crtc.id == id)
    }

    pub fn plane(&self, id: u32) -> Option<&Arc<Plane>> {
        self.planes.iter().find(|plane| plane.id == id)
    }

    pub fn connector(&self, id: u32) -> Option<&Arc<Connector>> {
        self.connectors.iter().find(|connector| connector.id == id)
    }

    pub fn plane_for(&self, crtc: &Crtc, plane_type: PlaneType) -> Option<&Arc<Plane>> {
        self.planes
            .iter()
            .find(|plane| plane.plane_type == plane_type && plane.is_usable_with(crtc))
    }

    pub fn primary_plane_for(&self, crtc: &Crtc) -> Option<&Arc<Plane>> {
        self.plane_for(crtc, PlaneType::Primary)
    }

    pub fn cursor_plane_for(&self, crtc: &Crtc) -> Option<&Arc<Plane>> {
        self.plane_for(crtc, PlaneType::Cursor)
    }

    /// Compare object identities and connection state against an older snapshot
    pub fn changes_since(&self, old: &DeviceResources) -> ResourceChanges {
        let mut changes = ResourceChanges::empty();
        let crtc_ids = |res: &DeviceResources| res.crtcs.iter().map(|c| c.id).collect::<Vec<_>>();
        let plane_ids = |res: &DeviceResources| res.planes.iter().map(|p| p.id).collect::<Vec<_>>();
        let connector_state = |res: &DeviceResources| {
            res.connectors
                .iter()
                .map(|c| (c.id, c.connected, c.modes.clone()))
                .collect::<Vec<_>>()
        };
        if crtc_ids(self) != crtc_ids(old) {
            changes |= ResourceChanges::CRTCS;
        }
        if plane_ids(self) != plane_ids(old) {
            changes |= ResourceChanges::PLANES;
        }
        if connector_state(self) != connector_state(old) {
            changes |= ResourceChanges::CONNECTORS;
        }
        changes
    }
}

fn build_crtc(device: DeviceId, index: usize, raw: &RawCrtc) -> Crtc {
    let props = PropTable::from_raw(&raw.props);
    let gamma_size = props
        .value(CrtcProp::GammaLutSize)
        .map(|size| size as u32)
        .unwrap_or(raw.gamma_size);
    Crtc {
        device,
        id: raw.id,
        index,
        gamma_size,
        current_mode: raw.current_mode.clone(),
        props,
    }
}

fn build_plane(device: DeviceId, raw: &RawPlane) -> Plane {
    let props = PropTable::from_raw(&raw.props);
    let plane_type = PlaneType::from_kernel(props.value(PlaneProp::Type).unwrap_or(0));

    let mut formats: IndexMap<u32, Vec<u64>> =
        raw.formats.iter().map(|f| (*f, Vec::new())).collect();
    for (format, modifier) in &raw.format_modifiers {
        formats.entry(*format).or_default().push(*modifier);
    }

    let rotations = match props.id(PlaneProp::Rotation) {
        Some(_) => Rotation::from_bits_truncate(raw.rotations),
        None => Rotation::ROTATE_0,
    };

    Plane {
        device,
        id: raw.id,
        plane_type,
        possible_crtcs: raw.possible_crtcs,
        formats,
        rotations,
        props,
    }
}

fn build_connector(device: DeviceId, raw: &RawConnector) -> Connector {
    Connector {
        device,
        id: raw.id,
        name: raw.name.clone(),
        connected: raw.connected,
        modes: raw.modes.clone(),
        possible_crtcs: raw.possible_crtcs,
        current_crtc: raw.current_crtc,
        props: PropTable::from_raw(&raw.props),
    }
}
