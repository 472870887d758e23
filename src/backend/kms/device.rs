// SPDX-License-Identifier: GPL-3.0-only

use indexmap::IndexMap;
use std::{fmt, sync::Arc};

use super::{
    drm_helpers,
    resources::{Connector, Crtc, DeviceId, DeviceResources, Plane},
};

/// Caller-side view of one device.
///
/// Holds a snapshot of the device's display objects so updates can be built
/// without a round trip to the KMS thread. [`super::Kms::update_states`]
/// refreshes it.
#[derive(Clone)]
pub struct Device {
    id: DeviceId,
    path: String,
    strategy: &'static str,
    resources: DeviceResources,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("strategy", &self.strategy)
            .field("crtcs", &self.resources.crtcs.len())
            .field("planes", &self.resources.planes.len())
            .field("connectors", &self.resources.connectors.len())
            .finish()
    }
}

impl Device {
    pub(crate) fn new(
        id: DeviceId,
        path: String,
        strategy: &'static str,
        resources: DeviceResources,
    ) -> Self {
        Device {
            id,
            path,
            strategy,
            resources,
        }
    }

    pub(crate) fn set_resources(&mut self, resources: DeviceResources) {
        self.resources = resources;
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// `"atomic"` or `"simple"`
    pub fn strategy_name(&self) -> &'static str {
        self.strategy
    }

    pub fn resources(&self) -> &DeviceResources {
        &self.resources
    }

    pub fn crtcs(&self) -> &[Arc<Crtc>] {
        &self.resources.crtcs
    }

    pub fn planes(&self) -> &[Arc<Plane>] {
        &self.resources.planes
    }

    pub fn connectors(&self) -> &[Arc<Connector>] {
        &self.resources.connectors
    }

    pub fn crtc(&self, id: u32) -> Option<&Arc<Crtc>> {
        self.resources.crtc(id)
    }

    pub fn connector(&self, id: u32) -> Option<&Arc<Connector>> {
        self.resources.connector(id)
    }

    pub fn connector_by_name(&self, name: &str) -> Option<&Arc<Connector>> {
        self.resources.connectors.iter().find(|c| c.name() == name)
    }

    pub fn primary_plane_for(&self, crtc: &Crtc) -> Option<&Arc<Plane>> {
        self.resources.primary_plane_for(crtc)
    }

    pub fn cursor_plane_for(&self, crtc: &Crtc) -> Option<&Arc<Plane>> {
        self.resources.cursor_plane_for(crtc)
    }

    /// Connected connectors paired with the CRTC that should drive them
    pub fn display_configuration(&self) -> Vec<(Arc<Connector>, Arc<Crtc>)> {
        let map: IndexMap<u32, Option<u32>> = drm_helpers::display_configuration(&self.resources);
        map.into_iter()
            .filter_map(|(connector, crtc)| {
                Some((
                    self.resources.connector(connector)?.clone(),
                    self.resources.crtc(crtc?)?.clone(),
                ))
            })
            .collect()
    }
}
