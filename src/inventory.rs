//! Display hardware inventory: connectors, encoders, CRTCs, planes, and
//! their property bags.
//!
//! Everything in this module is a plain value owned by the device handle.
//! Objects reference each other by kernel handle, never by pointer, so the
//! inventory can live in flat vectors whose order is the kernel's
//! enumeration order.

use std::time::Duration;

use drm::control::{
    connector, crtc, encoder, plane, property, Device as ControlDevice, Mode, ModeFlags,
    ModeTypeFlags, PlaneType, ResourceHandle,
};
use tracing::warn;

use crate::error::{Error, Result};

/// A cached descriptor for one property of one object.
///
/// Pairs the kernel property handle with the owned name and value type so
/// that name lookups never go back to the kernel.
#[derive(Debug, Clone)]
pub struct PropertyDescriptor {
    pub(crate) handle: property::Handle,
    pub(crate) name: String,
    pub(crate) value_type: property::ValueType,
}

impl PropertyDescriptor {
    pub fn handle(&self) -> property::Handle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value_type(&self) -> &property::ValueType {
        &self.value_type
    }
}

/// The cached property set of a single DRM object.
///
/// Two parallel vectors: the kernel's (handle, current value) pairs and the
/// matching descriptors. Corresponding slots always refer to the same
/// property, so a name lookup is one scan over the descriptors.
#[derive(Debug, Clone, Default)]
pub struct PropertyBag {
    entries: Vec<(property::Handle, property::RawValue)>,
    descriptors: Vec<PropertyDescriptor>,
}

impl PropertyBag {
    pub(crate) fn new(
        entries: Vec<(property::Handle, property::RawValue)>,
        descriptors: Vec<PropertyDescriptor>,
    ) -> Self {
        debug_assert_eq!(entries.len(), descriptors.len());
        Self {
            entries,
            descriptors,
        }
    }

    /// Fetch the property set of `object` from the kernel.
    ///
    /// Issues one query for the (id, value) pairs and one per property for
    /// its descriptor.
    pub(crate) fn fetch<D: ControlDevice, H: ResourceHandle>(dev: &D, object: H) -> Result<Self> {
        let prop_vals = dev.get_properties(object).map_err(|source| Error::Access {
            op: "error getting object properties",
            source,
        })?;

        let mut entries = Vec::new();
        let mut descriptors = Vec::new();
        for (handle, value) in prop_vals {
            let info = dev.get_property(handle).map_err(|source| Error::Access {
                op: "error getting property descriptor",
                source,
            })?;

            let Ok(name) = info.name().to_str() else {
                warn!(
                    "skipping property {} with a non-UTF-8 name",
                    u32::from(handle)
                );
                continue;
            };

            entries.push((handle, value));
            descriptors.push(PropertyDescriptor {
                handle,
                name: name.to_owned(),
                value_type: info.value_type(),
            });
        }

        Ok(Self::new(entries, descriptors))
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Look up a property handle by name. Exact, case-sensitive.
    pub fn find(&self, name: &str) -> Option<property::Handle> {
        self.descriptor(name).map(|descriptor| descriptor.handle)
    }

    /// Look up a property descriptor by name. Exact, case-sensitive.
    pub fn descriptor(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.descriptors
            .iter()
            .find(|descriptor| descriptor.name == name)
    }

    /// The value the property had when the inventory was built.
    pub fn value_of(&self, name: &str) -> Option<property::RawValue> {
        let position = self
            .descriptors
            .iter()
            .position(|descriptor| descriptor.name == name)?;
        Some(self.entries[position].1)
    }

    pub fn descriptors(&self) -> &[PropertyDescriptor] {
        &self.descriptors
    }

    pub fn entries(&self) -> &[(property::Handle, property::RawValue)] {
        &self.entries
    }
}

/// A physical output port and the modes it advertises.
#[derive(Debug, Clone)]
pub struct Connector {
    pub(crate) handle: connector::Handle,
    pub(crate) state: connector::State,
    pub(crate) interface: connector::Interface,
    pub(crate) interface_id: u32,
    pub(crate) modes: Vec<Mode>,
    pub(crate) encoders: Vec<encoder::Handle>,
    pub(crate) props: PropertyBag,
}

impl Connector {
    pub fn handle(&self) -> connector::Handle {
        self.handle
    }

    pub fn state(&self) -> connector::State {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == connector::State::Connected
    }

    /// The canonical connector name, e.g. `HDMI-A-1`.
    pub fn name(&self) -> String {
        format!("{}-{}", self.interface.as_str(), self.interface_id)
    }

    pub fn modes(&self) -> &[Mode] {
        &self.modes
    }

    /// Encoders this connector can be driven by.
    pub fn encoders(&self) -> &[encoder::Handle] {
        &self.encoders
    }

    pub fn properties(&self) -> &PropertyBag {
        &self.props
    }

    /// The kernel-preferred mode with the highest refresh rate, falling back
    /// to the first advertised mode.
    pub fn preferred_mode(&self) -> Option<&Mode> {
        let mut mode: Option<&Mode> = None;

        for m in &self.modes {
            if !m.mode_type().contains(ModeTypeFlags::PREFERRED) {
                continue;
            }

            if let Some(curr) = mode {
                if curr.vrefresh() < m.vrefresh() {
                    mode = Some(m);
                }
            } else {
                mode = Some(m);
            }
        }

        mode.or_else(|| self.modes.first())
    }
}

/// A hardware block translating CRTC output into a connector-native signal.
#[derive(Debug, Clone)]
pub struct Encoder {
    pub(crate) handle: encoder::Handle,
    pub(crate) possible_crtcs: Vec<crtc::Handle>,
}

impl Encoder {
    pub fn handle(&self) -> encoder::Handle {
        self.handle
    }

    /// CRTCs this encoder can be driven by, resolved from the kernel's index
    /// bitmask at enumeration time.
    pub fn possible_crtcs(&self) -> &[crtc::Handle] {
        &self.possible_crtcs
    }

    pub fn can_use_crtc(&self, crtc: crtc::Handle) -> bool {
        self.possible_crtcs.contains(&crtc)
    }
}

/// A scanout engine.
#[derive(Debug, Clone)]
pub struct Crtc {
    pub(crate) handle: crtc::Handle,
    pub(crate) index: usize,
    pub(crate) current_mode: Option<Mode>,
    pub(crate) props: PropertyBag,
}

impl Crtc {
    pub fn handle(&self) -> crtc::Handle {
        self.handle
    }

    /// Zero-based position in the kernel resource listing. This is the bit
    /// index used by encoder and plane compatibility masks.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The mode that was active when the device was enumerated, if any.
    pub fn initial_mode(&self) -> Option<&Mode> {
        self.current_mode.as_ref()
    }

    pub fn properties(&self) -> &PropertyBag {
        &self.props
    }
}

/// A composition layer feeding a CRTC.
#[derive(Debug, Clone)]
pub struct Plane {
    pub(crate) handle: plane::Handle,
    pub(crate) possible_crtcs: Vec<crtc::Handle>,
    pub(crate) kind: PlaneType,
    pub(crate) formats: Vec<u32>,
    pub(crate) props: PropertyBag,
}

impl Plane {
    pub fn handle(&self) -> plane::Handle {
        self.handle
    }

    /// The plane's layer, discovered from its `type` property.
    pub fn kind(&self) -> PlaneType {
        self.kind
    }

    /// CRTCs this plane may attach to.
    pub fn possible_crtcs(&self) -> &[crtc::Handle] {
        &self.possible_crtcs
    }

    pub fn can_use_crtc(&self, crtc: crtc::Handle) -> bool {
        self.possible_crtcs.contains(&crtc)
    }

    /// Supported pixel formats as fourcc codes.
    pub fn formats(&self) -> &[u32] {
        &self.formats
    }

    pub fn properties(&self) -> &PropertyBag {
        &self.props
    }

    pub(crate) fn classify(props: &PropertyBag) -> Option<PlaneType> {
        match props.value_of("type")? {
            v if v == PlaneType::Overlay as u64 => Some(PlaneType::Overlay),
            v if v == PlaneType::Primary as u64 => Some(PlaneType::Primary),
            v if v == PlaneType::Cursor as u64 => Some(PlaneType::Cursor),
            _ => None,
        }
    }
}

/// Calculate the refresh interval of a mode.
pub fn refresh_interval(mode: Mode) -> Duration {
    let clock = mode.clock() as u64;
    let htotal = mode.hsync().2 as u64;
    let vtotal = mode.vsync().2 as u64;

    let mut numerator = htotal * vtotal * 1_000_000;
    let mut denominator = clock;

    if mode.flags().contains(ModeFlags::INTERLACE) {
        denominator *= 2;
    }

    if mode.flags().contains(ModeFlags::DBLSCAN) {
        numerator *= 2;
    }

    if mode.vscan() > 1 {
        numerator *= mode.vscan() as u64;
    }

    let interval = (numerator + denominator / 2) / denominator;
    Duration::from_nanos(interval)
}
