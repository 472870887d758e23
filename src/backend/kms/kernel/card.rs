// SPDX-License-Identifier: GPL-3.0-only

use anyhow::{Context, Result};
use drm::{
    ClientCapability, Device as BasicDevice,
    control::{
        AtomicCommitFlags, Device as ControlDevice, Event, PageFlipFlags, RawResourceHandle,
        ResourceHandle, atomic::AtomicModeReq, connector, crtc, framebuffer, from_u32, plane,
        property,
    },
};
use std::{
    fs::OpenOptions,
    io,
    os::{
        fd::{AsFd, BorrowedFd, OwnedFd},
        unix::fs::OpenOptionsExt,
    },
    path::Path,
};
use tracing::{debug, info, warn};

use super::{
    AtomicRequest, CommitFlags, FlipEvent, KernelDevice, ObjectType, RawConnector, RawCrtc,
    RawPlane, RawProperty, RawResources,
};
use crate::backend::kms::{
    buffer::BufferLayout,
    drm_helpers,
    resources::{Mode, Rotation},
};

/// `DRM_CLIENT_CAP_CURSOR_PLANE_HOTSPOT`
const CLIENT_CAP_CURSOR_PLANE_HOTSPOT: u64 = 6;
/// `DRM_MODE_FB_MODIFIERS`
const FB_MODIFIERS: u32 = 1 << 1;

struct Card(OwnedFd);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl BasicDevice for Card {}
impl ControlDevice for Card {}

/// A real DRM card node
pub struct DrmKernel {
    card: Card,
    atomic: bool,
}

fn handle<T: From<RawResourceHandle>>(id: u32) -> io::Result<T> {
    from_u32(id).ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))
}

impl DrmKernel {
    pub fn open(path: &Path, allow_atomic: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC | libc::O_NONBLOCK)
            .open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let card = Card(file.into());

        card.set_client_capability(ClientCapability::UniversalPlanes, true)
            .context("Failed to enable universal planes")?;

        let atomic = allow_atomic
            && card
                .set_client_capability(ClientCapability::Atomic, true)
                .is_ok();
        if atomic {
            if let Err(err) =
                drm_ffi::set_capability(card.as_fd(), CLIENT_CAP_CURSOR_PLANE_HOTSPOT, true)
            {
                debug!(?err, "Cursor plane hotspots not supported");
            }
        }

        info!(
            "Opened {} using {} mode setting",
            path.display(),
            if atomic { "atomic" } else { "legacy" }
        );
        Ok(DrmKernel { card, atomic })
    }

    fn properties<T: ResourceHandle>(&self, handle: T) -> io::Result<Vec<RawProperty>> {
        let set = self.card.get_properties(handle)?;
        let (ids, values) = set.as_props_and_values();
        let mut props = Vec::with_capacity(ids.len());
        for (id, value) in ids.iter().zip(values.iter()) {
            let info = self.card.get_property(*id)?;
            let enums = match info.value_type() {
                property::ValueType::Enum(values) => values
                    .values()
                    .1
                    .iter()
                    .map(|entry| (entry.name().to_string_lossy().into_owned(), entry.value()))
                    .collect(),
                property::ValueType::Bitmask => self.bitmask_entries(*id)?,
                _ => Vec::new(),
            };
            props.push(RawProperty {
                name: info.name().to_string_lossy().into_owned(),
                id: u32::from(*id),
                value: *value,
                enums,
            });
        }
        Ok(props)
    }

    /// Entries of a bitmask property, each with its bit already shifted into place
    fn bitmask_entries(&self, prop: property::Handle) -> io::Result<Vec<(String, u64)>> {
        let mut entries = Vec::new();
        drm_ffi::mode::get_property(self.card.as_fd(), u32::from(prop), None, Some(&mut entries))?;
        Ok(entries
            .iter()
            .map(|entry| {
                let name: Vec<u8> = entry
                    .name
                    .iter()
                    .take_while(|c| **c != 0)
                    .map(|c| *c as u8)
                    .collect();
                let bit = u32::try_from(entry.value)
                    .ok()
                    .and_then(|shift| 1u64.checked_shl(shift))
                    .unwrap_or(0);
                (String::from_utf8_lossy(&name).into_owned(), bit)
            })
            .collect())
    }

    fn crtc_mask(all: &[crtc::Handle], possible: &[crtc::Handle]) -> u32 {
        all.iter()
            .enumerate()
            .filter(|(_, crtc)| possible.contains(crtc))
            .fold(0, |mask, (index, _)| mask | (1 << index))
    }

    fn in_formats(&self, props: &[RawProperty]) -> Vec<(u32, u64)> {
        let Some(blob) = props
            .iter()
            .find(|prop| prop.name == "IN_FORMATS")
            .filter(|prop| prop.value != 0)
        else {
            return Vec::new();
        };
        match self.card.get_property_blob(blob.value) {
            Ok(data) => parse_in_formats(&data),
            Err(err) => {
                warn!(?err, "Failed to read IN_FORMATS blob");
                Vec::new()
            }
        }
    }
}

/// Map the entries of a plane's `rotation` property onto [`Rotation`] bits
fn rotation_mask(entries: &[(String, u64)]) -> u32 {
    entries
        .iter()
        .filter_map(|(name, _)| match name.as_str() {
            "rotate-0" => Some(Rotation::ROTATE_0),
            "rotate-90" => Some(Rotation::ROTATE_90),
            "rotate-180" => Some(Rotation::ROTATE_180),
            "rotate-270" => Some(Rotation::ROTATE_270),
            "reflect-x" => Some(Rotation::REFLECT_X),
            "reflect-y" => Some(Rotation::REFLECT_Y),
            _ => None,
        })
        .fold(Rotation::empty(), |mask, rotation| mask | rotation)
        .bits()
}

/// Parse a `struct drm_format_modifier_blob`
fn parse_in_formats(data: &[u8]) -> Vec<(u32, u64)> {
    let read_u32 = |offset: usize| -> Option<u32> {
        data.get(offset..offset + 4)
            .map(|bytes| bytemuck::pod_read_unaligned::<u32>(bytes))
    };
    let read_u64 = |offset: usize| -> Option<u64> {
        data.get(offset..offset + 8)
            .map(|bytes| bytemuck::pod_read_unaligned::<u64>(bytes))
    };

    let header = (|| {
        Some((
            read_u32(8)? as usize,
            read_u32(12)? as usize,
            read_u32(16)? as usize,
            read_u32(20)? as usize,
        ))
    })();
    let Some((count_formats, formats_offset, count_modifiers, modifiers_offset)) = header else {
        return Vec::new();
    };

    let count_formats = count_formats.min(data.len().saturating_sub(formats_offset) / 4);
    let count_modifiers = count_modifiers.min(data.len().saturating_sub(modifiers_offset) / 24);

    let formats: Vec<u32> = (0..count_formats)
        .filter_map(|i| read_u32(formats_offset + i * 4))
        .collect();

    let mut pairs = Vec::new();
    for i in 0..count_modifiers {
        // struct drm_format_modifier { u64 formats; u32 offset; u32 pad; u64 modifier; }
        let base = modifiers_offset + i * 24;
        let (Some(mask), Some(offset), Some(modifier)) =
            (read_u64(base), read_u32(base + 8), read_u64(base + 16))
        else {
            break;
        };
        for bit in 0..64 {
            if mask & (1 << bit) != 0 {
                if let Some(format) = formats.get(offset as usize + bit) {
                    pairs.push((*format, modifier));
                }
            }
        }
    }
    pairs
}

impl KernelDevice for DrmKernel {
    fn supports_atomic(&self) -> bool {
        self.atomic
    }

    fn discover(&self) -> io::Result<RawResources> {
        let res = self.card.resource_handles()?;
        let all_crtcs = res.crtcs();

        let mut crtcs = Vec::new();
        for handle in all_crtcs {
            let info = self.card.get_crtc(*handle)?;
            crtcs.push(RawCrtc {
                id: u32::from(*handle),
                gamma_size: info.gamma_length(),
                current_mode: info.mode().map(Mode::from),
                props: self.properties(*handle)?,
            });
        }

        let mut planes = Vec::new();
        for handle in self.card.plane_handles()? {
            let info = self.card.get_plane(handle)?;
            let props = self.properties(handle)?;
            let possible = res.filter_crtcs(info.possible_crtcs());
            let rotations = props
                .iter()
                .find(|prop| prop.name == "rotation")
                .map_or(0, |prop| rotation_mask(&prop.enums));
            planes.push(RawPlane {
                id: u32::from(handle),
                possible_crtcs: Self::crtc_mask(all_crtcs, &possible),
                formats: info.formats().to_vec(),
                format_modifiers: self.in_formats(&props),
                rotations,
                props,
            });
        }

        let mut connectors = Vec::new();
        for handle in res.connectors() {
            let info = self.card.get_connector(*handle, true)?;
            let mut possible = Vec::new();
            for encoder in info.encoders() {
                if let Ok(encoder) = self.card.get_encoder(*encoder) {
                    possible.extend(res.filter_crtcs(encoder.possible_crtcs()));
                }
            }
            let current_crtc = info
                .current_encoder()
                .and_then(|encoder| self.card.get_encoder(encoder).ok())
                .and_then(|encoder| encoder.crtc())
                .map(u32::from);
            connectors.push(RawConnector {
                id: u32::from(*handle),
                name: drm_helpers::connector_name(info.interface(), info.interface_id()),
                connected: info.state() == connector::State::Connected,
                modes: info.modes().iter().copied().map(Mode::from).collect(),
                possible_crtcs: Self::crtc_mask(all_crtcs, &possible),
                current_crtc,
                props: self.properties(*handle)?,
            });
        }

        Ok(RawResources {
            crtcs,
            planes,
            connectors,
        })
    }

    fn event_fd(&self) -> Option<OwnedFd> {
        self.card.0.try_clone().ok()
    }

    fn read_events(&self) -> io::Result<Vec<FlipEvent>> {
        let events = self.card.receive_events()?;
        Ok(events
            .filter_map(|event| match event {
                Event::PageFlip(event) => Some(FlipEvent {
                    crtc_id: u32::from(event.crtc),
                    sequence: event.frame,
                    tv_sec: event.duration.as_secs() as u32,
                    tv_usec: event.duration.subsec_micros(),
                }),
                _ => None,
            })
            .collect())
    }

    fn atomic_commit(&self, request: &AtomicRequest, flags: CommitFlags) -> io::Result<()> {
        let mut req = AtomicModeReq::new();
        for (object, prop, value) in request.iter() {
            let object = RawResourceHandle::new(object)
                .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
            req.add_raw_property(object, handle::<property::Handle>(prop)?, value);
        }
        self.card
            .atomic_commit(AtomicCommitFlags::from_bits_truncate(flags.bits()), req)
    }

    fn create_blob(&self, data: &[u8]) -> io::Result<u32> {
        let mut data = data.to_vec();
        let blob = drm_ffi::mode::create_property_blob(self.card.as_fd(), &mut data)?;
        Ok(blob.blob_id)
    }

    fn destroy_blob(&self, blob_id: u32) -> io::Result<()> {
        self.card.destroy_property_blob(blob_id as u64)
    }

    fn set_crtc(
        &self,
        crtc: u32,
        fb: Option<u32>,
        pos: (u32, u32),
        connectors: &[u32],
        mode: Option<&Mode>,
    ) -> io::Result<()> {
        let connectors = connectors
            .iter()
            .map(|id| handle::<connector::Handle>(*id))
            .collect::<io::Result<Vec<_>>>()?;
        let fb = fb.map(handle::<framebuffer::Handle>).transpose()?;
        self.card.set_crtc(
            handle::<crtc::Handle>(crtc)?,
            fb,
            pos,
            &connectors,
            mode.map(Mode::to_drm),
        )
    }

    fn page_flip(&self, crtc: u32, fb: u32) -> io::Result<()> {
        self.card.page_flip(
            handle::<crtc::Handle>(crtc)?,
            handle::<framebuffer::Handle>(fb)?,
            PageFlipFlags::EVENT,
            None,
        )
    }

    fn set_cursor2(
        &self,
        crtc: u32,
        handle: u32,
        (width, height): (u32, u32),
        (hot_x, hot_y): (i32, i32),
    ) -> io::Result<()> {
        drm_ffi::mode::set_cursor2(self.card.as_fd(), crtc, handle, width, height, hot_x, hot_y)
            .map(|_| ())
    }

    fn set_cursor(&self, crtc: u32, handle: u32, (width, height): (u32, u32)) -> io::Result<()> {
        drm_ffi::mode::set_cursor(self.card.as_fd(), crtc, handle, width, height).map(|_| ())
    }

    fn move_cursor(&self, crtc: u32, (x, y): (i32, i32)) -> io::Result<()> {
        drm_ffi::mode::move_cursor(self.card.as_fd(), crtc, x, y).map(|_| ())
    }

    fn set_object_property(
        &self,
        object: u32,
        object_type: ObjectType,
        prop: u32,
        value: u64,
    ) -> io::Result<()> {
        let prop = handle::<property::Handle>(prop)?;
        match object_type {
            ObjectType::Crtc => {
                self.card
                    .set_property(handle::<crtc::Handle>(object)?, prop, value)
            }
            ObjectType::Connector => {
                self.card
                    .set_property(handle::<connector::Handle>(object)?, prop, value)
            }
            ObjectType::Plane => {
                self.card
                    .set_property(handle::<plane::Handle>(object)?, prop, value)
            }
        }
    }

    fn set_gamma(&self, crtc: u32, red: &[u16], green: &[u16], blue: &[u16]) -> io::Result<()> {
        self.card
            .set_gamma(handle::<crtc::Handle>(crtc)?, red, green, blue)
    }

    fn add_framebuffer(&self, layout: &BufferLayout) -> io::Result<u32> {
        let (modifiers, flags) = if layout.has_explicit_modifier() {
            let modifiers = layout
                .handles
                .map(|handle| if handle != 0 { layout.modifier } else { 0 });
            (modifiers, FB_MODIFIERS)
        } else {
            ([0; 4], 0)
        };
        let fb = drm_ffi::mode::add_fb2(
            self.card.as_fd(),
            layout.width,
            layout.height,
            layout.format,
            &layout.handles,
            &layout.pitches,
            &layout.offsets,
            &modifiers,
            flags,
        )?;
        Ok(fb.fb_id)
    }

    fn remove_framebuffer(&self, fb: u32) -> io::Result<()> {
        drm_ffi::mode::rm_fb(self.card.as_fd(), fb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_u32(data: &mut Vec<u8>, value: u32) {
        data.extend_from_slice(&value.to_ne_bytes());
    }

    fn push_u64(data: &mut Vec<u8>, value: u64) {
        data.extend_from_slice(&value.to_ne_bytes());
    }

    #[test]
    fn in_formats_blob_is_decoded() {
        // header: version, flags, count_formats, formats_offset, count_modifiers, modifiers_offset
        let mut data = Vec::new();
        for value in [1, 0, 2, 24, 2, 32] {
            push_u32(&mut data, value);
        }
        push_u32(&mut data, 0x3432_5258);
        push_u32(&mut data, 0x3432_5241);
        // linear for both formats, a vendor modifier for the second only
        push_u64(&mut data, 0b11);
        push_u32(&mut data, 0);
        push_u32(&mut data, 0);
        push_u64(&mut data, 0);
        push_u64(&mut data, 0b10);
        push_u32(&mut data, 0);
        push_u32(&mut data, 0);
        push_u64(&mut data, 0x0100_0000_0000_0001);

        let pairs = parse_in_formats(&data);
        assert_eq!(
            pairs,
            vec![
                (0x3432_5258, 0),
                (0x3432_5241, 0),
                (0x3432_5241, 0x0100_0000_0000_0001),
            ]
        );
    }

    #[test]
    fn counts_beyond_the_blob_are_clamped() {
        let mut data = Vec::new();
        for value in [1, 0, u32::MAX, 24, u32::MAX, 28] {
            push_u32(&mut data, value);
        }
        push_u32(&mut data, 0x3432_5258);

        // one format fits, no complete modifier entry does
        assert!(parse_in_formats(&data).is_empty());

        push_u64(&mut data, 0b1);
        push_u32(&mut data, 0);
        push_u32(&mut data, 0);
        push_u64(&mut data, 0);
        assert_eq!(parse_in_formats(&data), vec![(0x3432_5258, 0)]);
    }

    #[test]
    fn rotation_entries_map_by_name() {
        let entries: Vec<(String, u64)> = ["rotate-0", "rotate-180", "reflect-y", "bogus"]
            .into_iter()
            .enumerate()
            .map(|(bit, name)| (name.to_string(), 1 << bit))
            .collect();
        assert_eq!(
            Rotation::from_bits_truncate(rotation_mask(&entries)),
            Rotation::ROTATE_0 | Rotation::ROTATE_180 | Rotation::REFLECT_Y
        );
        assert_eq!(rotation_mask(&[]), 0);
    }

    #[test]
    fn truncated_blob_yields_nothing() {
        assert!(parse_in_formats(&[0; 10]).is_empty());
    }
}
