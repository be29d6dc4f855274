//! The DRM device handle.
//!
//! [`DrmDevice`] owns the DRM node, the enumerated hardware inventory, the
//! selected output pipeline with its kernel mode blob, and the userdata of
//! in-flight page flips. The inventory is immutable after construction and
//! may be read from any thread without locking; pipeline selection and the
//! request lifetime are serialized by one device-level mutex.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::mem;
use std::num::NonZeroU64;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use drm::Device;
use drm::control::{
    connector, crtc, encoder, property, Device as ControlDevice, Event, Mode, PlaneType,
};
use drm::ClientCapability;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::inventory::{Connector, Crtc, Encoder, Plane, PropertyBag};
use crate::request::AtomicRequest;

/// An owned DRM node file descriptor.
///
/// This is the type the `drm` crate's device traits hang off of; everything
/// else in the crate goes through it.
#[derive(Debug)]
pub struct DrmDeviceFd(OwnedFd);

impl AsFd for DrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl drm::Device for DrmDeviceFd {}
impl ControlDevice for DrmDeviceFd {}

impl DrmDeviceFd {
    /// Open a DRM node by path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC | libc::O_NONBLOCK)
            .open(path)
            .map_err(|source| Error::Open {
                path: path.to_owned(),
                source,
            })?;
        Ok(Self(file.into()))
    }

    /// Adopt an already-open DRM node.
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self(fd)
    }
}

/// The configured pipeline selection. Indices point into the device's
/// inventory vectors, which are stable for the device's lifetime.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Selection {
    pub(crate) connector: usize,
    pub(crate) encoder: usize,
    pub(crate) crtc: usize,
    pub(crate) mode: Mode,
}

/// Mutable device state behind the device-level mutex.
#[derive(Default)]
pub(crate) struct DeviceState {
    pub(crate) selection: Option<Selection>,
    pub(crate) mode_blob: Option<NonZeroU64>,
    pub(crate) pending_flips: HashMap<crtc::Handle, u64>,
}

/// A snapshot of the configured output pipeline.
#[derive(Debug, Clone, Copy)]
pub struct Pipeline {
    pub connector: connector::Handle,
    pub encoder: encoder::Handle,
    pub crtc: crtc::Handle,
    pub mode: Mode,
    pub mode_blob: NonZeroU64,
}

/// A candidate pipeline found by [`DrmDevice::find_connected_pipeline`],
/// ready to be passed to [`DrmDevice::configure`].
#[derive(Debug, Clone, Copy)]
pub struct PipelineTarget {
    pub connector: connector::Handle,
    pub encoder: encoder::Handle,
    pub crtc: crtc::Handle,
    pub mode: Mode,
}

/// Callbacks for events read off the DRM fd.
pub trait EventHandler {
    /// A page flip completed on `crtc`.
    ///
    /// `userdata` is the word passed to the commit that requested the flip,
    /// if that commit went through this device.
    fn page_flip(&mut self, crtc: crtc::Handle, frame: u32, time: Duration, userdata: Option<u64>);
}

/// A DRM device with its display hardware inventory.
pub struct DrmDevice {
    fd: DrmDeviceFd,
    connectors: Vec<Connector>,
    encoders: Vec<Encoder>,
    crtcs: Vec<Crtc>,
    planes: Vec<Plane>,
    state: Mutex<DeviceState>,
}

impl DrmDevice {
    /// Open a DRM node and enumerate its display hardware.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("opening DRM device {path:?}");
        Self::with_fd(DrmDeviceFd::open(path)?)
    }

    /// Build a device from an already-open DRM node.
    pub fn from_fd(fd: OwnedFd) -> Result<Self> {
        Self::with_fd(DrmDeviceFd::from_fd(fd))
    }

    fn with_fd(fd: DrmDeviceFd) -> Result<Self> {
        let _span = tracy_client::span!("DrmDevice::with_fd");

        // Universal planes must be on before atomic; both are mandatory.
        for cap in [ClientCapability::UniversalPlanes, ClientCapability::Atomic] {
            fd.set_client_capability(cap, true)
                .map_err(|source| Error::CapabilityUnsupported { cap, source })?;
        }

        let resources = fd.resource_handles().map_err(|source| Error::Access {
            op: "error getting resource handles",
            source,
        })?;
        let plane_handles = fd.plane_handles().map_err(|source| Error::Access {
            op: "error getting plane resource handles",
            source,
        })?;

        let mut connectors = Vec::with_capacity(resources.connectors().len());
        for &handle in resources.connectors() {
            let info = fd
                .get_connector(handle, false)
                .map_err(|source| Error::Access {
                    op: "error getting connector",
                    source,
                })?;
            let props = PropertyBag::fetch(&fd, handle)?;
            connectors.push(Connector {
                handle,
                state: info.state(),
                interface: info.interface(),
                interface_id: info.interface_id(),
                modes: info.modes().to_vec(),
                encoders: info.encoders().to_vec(),
                props,
            });
        }

        let mut encoders = Vec::with_capacity(resources.encoders().len());
        for &handle in resources.encoders() {
            let info = fd.get_encoder(handle).map_err(|source| Error::Access {
                op: "error getting encoder",
                source,
            })?;
            encoders.push(Encoder {
                handle,
                possible_crtcs: resources.filter_crtcs(info.possible_crtcs()),
            });
        }

        let mut crtcs = Vec::with_capacity(resources.crtcs().len());
        for (index, &handle) in resources.crtcs().iter().enumerate() {
            let info = fd.get_crtc(handle).map_err(|source| Error::Access {
                op: "error getting crtc",
                source,
            })?;
            let props = PropertyBag::fetch(&fd, handle)?;
            crtcs.push(Crtc {
                handle,
                index,
                current_mode: info.mode(),
                props,
            });
        }

        let mut planes = Vec::with_capacity(plane_handles.len());
        for &handle in &plane_handles {
            let info = fd.get_plane(handle).map_err(|source| Error::Access {
                op: "error getting plane",
                source,
            })?;
            let props = PropertyBag::fetch(&fd, handle)?;
            let kind = Plane::classify(&props).unwrap_or_else(|| {
                warn!(
                    "plane {} has no usable type property, treating it as an overlay",
                    u32::from(handle)
                );
                PlaneType::Overlay
            });
            planes.push(Plane {
                handle,
                possible_crtcs: resources.filter_crtcs(info.possible_crtcs()),
                kind,
                formats: info.formats().to_vec(),
                props,
            });
        }

        debug!(
            "enumerated {} connectors, {} encoders, {} crtcs, {} planes",
            connectors.len(),
            encoders.len(),
            crtcs.len(),
            planes.len(),
        );

        Ok(Self {
            fd,
            connectors,
            encoders,
            crtcs,
            planes,
            state: Mutex::new(DeviceState::default()),
        })
    }

    pub fn connectors(&self) -> &[Connector] {
        &self.connectors
    }

    pub fn encoders(&self) -> &[Encoder] {
        &self.encoders
    }

    pub fn crtcs(&self) -> &[Crtc] {
        &self.crtcs
    }

    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    /// Select and lock an output pipeline.
    ///
    /// The mode must appear, field for field, in the connector's mode list.
    /// On success a fresh mode blob is published and the previous one (if
    /// any) is destroyed; on failure the prior selection stays intact.
    pub fn configure(
        &self,
        connector: connector::Handle,
        encoder: encoder::Handle,
        crtc: crtc::Handle,
        mode: Mode,
    ) -> Result<()> {
        let _span = tracy_client::span!("DrmDevice::configure");

        let (connector_idx, encoder_idx, crtc_idx) = resolve_selection(
            &self.connectors,
            &self.encoders,
            &self.crtcs,
            connector,
            encoder,
            crtc,
            &mode,
        )?;

        let value = self
            .fd
            .create_property_blob(&mode)
            .map_err(|source| Error::Access {
                op: "error creating mode property blob",
                source,
            })?;
        let blob = match value {
            property::Value::Blob(id) => NonZeroU64::new(id),
            _ => None,
        }
        .expect("MODE_CREATEPROPBLOB returned no blob id");

        let mut state = self.state.lock().unwrap();
        state.selection = Some(Selection {
            connector: connector_idx,
            encoder: encoder_idx,
            crtc: crtc_idx,
            mode,
        });
        if let Some(old) = mem::replace(&mut state.mode_blob, Some(blob)) {
            if let Err(err) = self.fd.destroy_property_blob(old.get()) {
                warn!("error destroying previous mode blob: {err:?}");
            }
        }

        debug!(
            "configured pipeline: connector {} encoder {} crtc {}",
            u32::from(connector),
            u32::from(encoder),
            u32::from(crtc),
        );

        Ok(())
    }

    /// Whether a pipeline has been configured.
    pub fn is_configured(&self) -> bool {
        self.state.lock().unwrap().selection.is_some()
    }

    /// A snapshot of the configured pipeline.
    pub fn pipeline(&self) -> Option<Pipeline> {
        let state = self.state.lock().unwrap();
        let selection = state.selection?;
        Some(Pipeline {
            connector: self.connectors[selection.connector].handle(),
            encoder: self.encoders[selection.encoder].handle(),
            crtc: self.crtcs[selection.crtc].handle(),
            mode: selection.mode,
            mode_blob: state.mode_blob?,
        })
    }

    pub fn selected_connector(&self) -> Option<&Connector> {
        let selection = self.state.lock().unwrap().selection?;
        Some(&self.connectors[selection.connector])
    }

    pub fn selected_encoder(&self) -> Option<&Encoder> {
        let selection = self.state.lock().unwrap().selection?;
        Some(&self.encoders[selection.encoder])
    }

    pub fn selected_crtc(&self) -> Option<&Crtc> {
        let selection = self.state.lock().unwrap().selection?;
        Some(&self.crtcs[selection.crtc])
    }

    /// Find the first connected connector that has a compatible encoder and
    /// CRTC, paired with its preferred mode.
    pub fn find_connected_pipeline(&self) -> Option<PipelineTarget> {
        for connector in &self.connectors {
            if !connector.is_connected() {
                continue;
            }
            let Some(&mode) = connector.preferred_mode() else {
                continue;
            };

            for &encoder in connector.encoders() {
                let Some(encoder) = self.encoders.iter().find(|e| e.handle() == encoder) else {
                    continue;
                };
                if let Some(&crtc) = encoder.possible_crtcs().first() {
                    return Some(PipelineTarget {
                        connector: connector.handle(),
                        encoder: encoder.handle(),
                        crtc,
                        mode,
                    });
                }
            }
        }

        None
    }

    /// Start an atomic request against this device.
    ///
    /// The device lock is held for the whole lifetime of the returned
    /// request, so at most one request exists per device at any instant;
    /// this call blocks while another request is alive.
    pub fn atomic_request(&self) -> AtomicRequest<'_> {
        AtomicRequest::new(self, self.state.lock().unwrap())
    }

    /// Drain pending events off the DRM fd.
    ///
    /// Call when the fd polls readable. Page-flip events are joined with the
    /// userdata recorded by the commit that requested them. Must not be
    /// called from a thread that holds a live atomic request.
    pub fn dispatch_events(&self, handler: &mut dyn EventHandler) -> Result<()> {
        let events = self.fd.receive_events().map_err(|source| Error::Access {
            op: "error reading DRM events",
            source,
        })?;

        for event in events {
            match event {
                Event::PageFlip(flip) => {
                    let userdata =
                        complete_flip(&mut self.state.lock().unwrap().pending_flips, flip.crtc);
                    trace!("page flip on crtc {}", u32::from(flip.crtc));
                    handler.page_flip(flip.crtc, flip.frame, flip.duration, userdata);
                }
                _ => trace!("ignoring unrelated DRM event"),
            }
        }

        Ok(())
    }

    pub(crate) fn fd(&self) -> &DrmDeviceFd {
        &self.fd
    }

    pub(crate) fn connector_at(&self, index: usize) -> &Connector {
        &self.connectors[index]
    }

    pub(crate) fn crtc_at(&self, index: usize) -> &Crtc {
        &self.crtcs[index]
    }

    #[cfg(test)]
    pub(crate) fn with_inventory(
        fd: DrmDeviceFd,
        connectors: Vec<Connector>,
        encoders: Vec<Encoder>,
        crtcs: Vec<Crtc>,
        planes: Vec<Plane>,
    ) -> Self {
        Self {
            fd,
            connectors,
            encoders,
            crtcs,
            planes,
            state: Mutex::new(DeviceState::default()),
        }
    }

    #[cfg(test)]
    pub(crate) fn select_for_tests(&self, selection: Selection, mode_blob: NonZeroU64) {
        let mut state = self.state.lock().unwrap();
        state.selection = Some(selection);
        state.mode_blob = Some(mode_blob);
    }
}

impl Drop for DrmDevice {
    fn drop(&mut self) {
        let Ok(state) = self.state.get_mut() else {
            return;
        };
        if let Some(blob) = state.mode_blob.take() {
            if let Err(err) = self.fd.destroy_property_blob(blob.get()) {
                warn!("error destroying mode blob: {err:?}");
            }
        }
    }
}

/// Pair a completed flip with the userdata recorded at commit time.
///
/// Delivery is one-shot: the entry is removed, so a second flip on the same
/// CRTC (or a flip this device did not request) reads as `None`.
fn complete_flip(
    pending_flips: &mut HashMap<crtc::Handle, u64>,
    crtc: crtc::Handle,
) -> Option<u64> {
    pending_flips.remove(&crtc)
}

/// Resolve a (connector, encoder, crtc, mode) tuple against the inventory
/// and check that it forms a legal pipeline.
fn resolve_selection(
    connectors: &[Connector],
    encoders: &[Encoder],
    crtcs: &[Crtc],
    connector: connector::Handle,
    encoder: encoder::Handle,
    crtc: crtc::Handle,
    mode: &Mode,
) -> Result<(usize, usize, usize)> {
    let connector_idx = connectors
        .iter()
        .position(|c| c.handle() == connector)
        .ok_or(Error::UnknownId {
            kind: "connector",
            id: u32::from(connector),
        })?;
    let encoder_idx = encoders
        .iter()
        .position(|e| e.handle() == encoder)
        .ok_or(Error::UnknownId {
            kind: "encoder",
            id: u32::from(encoder),
        })?;
    let crtc_idx = crtcs
        .iter()
        .position(|c| c.handle() == crtc)
        .ok_or(Error::UnknownId {
            kind: "crtc",
            id: u32::from(crtc),
        })?;

    if !connectors[connector_idx].encoders().contains(&encoder) {
        return Err(Error::EncoderMismatch {
            connector: u32::from(connector),
            encoder: u32::from(encoder),
        });
    }

    if !encoders[encoder_idx].can_use_crtc(crtc) {
        return Err(Error::CrtcMismatch {
            encoder: u32::from(encoder),
            crtc: u32::from(crtc),
        });
    }

    if !connectors[connector_idx].modes().contains(mode) {
        return Err(Error::UnknownMode {
            connector: u32::from(connector),
            mode: mode.name().to_string_lossy().into_owned(),
        });
    }

    Ok((connector_idx, encoder_idx, crtc_idx))
}
