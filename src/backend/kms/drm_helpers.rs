// SPDX-License-Identifier: GPL-3.0-only

use drm::control::connector::Interface;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::resources::{DeviceResources, Mode};

pub const DRM_FORMAT_MOD_INVALID: u64 = 0x00ff_ffff_ffff_ffff;
pub const DRM_FORMAT_MOD_LINEAR: u64 = 0;

/// Find an initial connector -> CRTC mapping for the connected outputs
pub fn display_configuration(resources: &DeviceResources) -> IndexMap<u32, Option<u32>> {
    let mut map = IndexMap::new();

    // try to keep existing mappings to reduce flickering
    for conn in resources.connectors.iter().filter(|c| c.is_connected()) {
        if let Some(crtc) = conn.current_crtc().and_then(|id| resources.crtc(id)) {
            debug!("Found existing mapping: {} -> {}", conn.name(), crtc);
            map.insert(conn.id(), Some(crtc.id()));
        }
    }

    // match remaining connected connectors to available crtcs
    let unmatched: Vec<_> = resources
        .connectors
        .iter()
        .filter(|conn| conn.is_connected())
        .filter(|conn| !map.contains_key(&conn.id()))
        .cloned()
        .collect();

    for conn in unmatched {
        let free = resources
            .crtcs
            .iter()
            .filter(|crtc| conn.can_drive(crtc))
            .find(|crtc| !map.values().any(|v| *v == Some(crtc.id())));
        match free {
            Some(crtc) => {
                debug!("Assigning connector {} to {}", conn.name(), crtc);
                map.insert(conn.id(), Some(crtc.id()));
            }
            None => {
                map.insert(conn.id(), None);
            }
        }
    }

    map
}

/// Detect primary GPU based on boot_vga flag
pub fn find_primary_gpu(nodes: &[PathBuf]) -> Option<PathBuf> {
    for node in nodes {
        let boot_vga = sysfs_device_dir(node)
            .and_then(|dir| std::fs::read_to_string(dir.join("boot_vga")).ok())
            .and_then(|s| s.trim().parse::<i32>().ok())
            .unwrap_or(0);

        if boot_vga == 1 {
            info!("Found primary GPU with boot_vga flag: {}", node.display());
            return Some(node.clone());
        }
    }

    // fallback to first available node
    nodes.first().cloned()
}

/// List `/dev/dri/card*` nodes in a stable order
pub fn card_nodes(dri: &Path) -> Vec<PathBuf> {
    let mut nodes: Vec<_> = std::fs::read_dir(dri)
        .into_iter()
        .flatten()
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("card"))
        })
        .collect();
    nodes.sort();
    nodes
}

fn sysfs_device_dir(node: &Path) -> Option<PathBuf> {
    let name = node.file_name()?;
    Some(Path::new("/sys/class/drm").join(name).join("device"))
}

/// Get short name for connector interface type
pub fn interface_short_name(interface: Interface) -> &'static str {
    match interface {
        Interface::DVII => "DVI-I",
        Interface::DVID => "DVI-D",
        Interface::DVIA => "DVI-A",
        Interface::Composite => "Composite",
        Interface::SVideo => "S-VIDEO",
        Interface::LVDS => "LVDS",
        Interface::Component => "Component",
        Interface::NinePinDIN => "DIN",
        Interface::DisplayPort => "DP",
        Interface::HDMIA => "HDMI-A",
        Interface::HDMIB => "HDMI-B",
        Interface::TV => "TV",
        Interface::EmbeddedDisplayPort => "eDP",
        Interface::Virtual => "Virtual",
        Interface::DSI => "DSI",
        Interface::DPI => "DPI",
        Interface::Writeback => "Writeback",
        Interface::SPI => "SPI",
        _ => "Unknown",
    }
}

pub fn connector_name(interface: Interface, interface_id: u32) -> String {
    format!("{}-{}", interface_short_name(interface), interface_id)
}

/// Refresh rate of a mode in millihertz (1000 mHz = 1 Hz)
pub fn calculate_refresh_rate(mode: &Mode) -> u32 {
    let htotal = mode.htotal as u64;
    let mut vtotal = mode.vtotal as u64;
    if htotal == 0 || vtotal == 0 {
        return 0;
    }

    let mut refresh = (mode.clock as u64 * 1_000_000 / htotal + vtotal / 2) / vtotal;

    if mode.flags & drm_ffi::DRM_MODE_FLAG_INTERLACE != 0 {
        refresh *= 2;
    }
    if mode.flags & drm_ffi::DRM_MODE_FLAG_DBLSCAN != 0 {
        refresh /= 2;
    }
    if mode.vscan > 1 {
        vtotal = mode.vscan as u64;
        refresh /= vtotal;
    }

    refresh as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::kms::{kernel::mock::MockResources, resources::DeviceId};

    #[test]
    fn refresh_rate_of_common_modes() {
        let mode = MockResources::mode_1080p();
        assert_eq!(calculate_refresh_rate(&mode), 60_000);

        let mut interlaced = mode.clone();
        interlaced.flags |= drm_ffi::DRM_MODE_FLAG_INTERLACE;
        assert_eq!(calculate_refresh_rate(&interlaced), 120_000);

        let mut doublescan = mode.clone();
        doublescan.flags |= drm_ffi::DRM_MODE_FLAG_DBLSCAN;
        assert_eq!(calculate_refresh_rate(&doublescan), 30_000);
    }

    #[test]
    fn degenerate_timings_have_no_refresh() {
        let mut mode = MockResources::mode_1080p();
        mode.vtotal = 0;
        assert_eq!(calculate_refresh_rate(&mode), 0);
    }

    #[test]
    fn configuration_assigns_free_crtcs() {
        let raw = MockResources::dual_output().build();
        let res = DeviceResources::from_raw(DeviceId(0), &raw);
        let config = display_configuration(&res);
        assert_eq!(config.len(), 2);
        let crtcs: Vec<_> = config.values().flatten().copied().collect();
        assert_eq!(crtcs.len(), 2);
        assert_ne!(crtcs[0], crtcs[1]);
    }

    #[test]
    fn connector_names() {
        assert_eq!(connector_name(Interface::HDMIA, 1), "HDMI-A-1");
        assert_eq!(connector_name(Interface::EmbeddedDisplayPort, 2), "eDP-2");
    }
}
