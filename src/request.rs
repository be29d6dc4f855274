//! Atomic request construction and submission.
//!
//! An [`AtomicRequest`] is a pending set of property changes bound to its
//! device. Creating a request takes the device lock and holds it until the
//! request is committed or dropped, so at most one request exists per
//! device at any instant.

use std::sync::MutexGuard;

use drm::control::atomic::AtomicModeReq;
use drm::control::{
    connector, crtc, plane, property, AtomicCommitFlags, Device as ControlDevice,
};
use tracing::trace;

use crate::device::{DeviceState, DrmDevice};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy)]
enum ObjectHandle {
    Connector(connector::Handle),
    Crtc(crtc::Handle),
    Plane(plane::Handle),
}

#[derive(Debug, Clone, Copy)]
struct PendingProperty {
    object: ObjectHandle,
    property: property::Handle,
    value: u64,
}

/// A pending, not-yet-submitted atomic request.
///
/// Committing consumes the request; dropping it discards the pending set.
/// Either way the device lock is released.
pub struct AtomicRequest<'dev> {
    device: &'dev DrmDevice,
    state: MutexGuard<'dev, DeviceState>,
    pending: Vec<PendingProperty>,
}

impl<'dev> AtomicRequest<'dev> {
    pub(crate) fn new(device: &'dev DrmDevice, state: MutexGuard<'dev, DeviceState>) -> Self {
        Self {
            device,
            state,
            pending: Vec::new(),
        }
    }

    /// Number of property changes queued so far.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Queue a property change on the selected connector.
    pub fn set_connector_property(&mut self, name: &str, value: u64) -> Result<()> {
        let device = self.device;
        let selection = self.state.selection.ok_or(Error::NotConfigured)?;
        let connector = device.connector_at(selection.connector);

        let property = connector
            .properties()
            .find(name)
            .ok_or_else(|| Error::PropertyNotFound {
                object: "connector",
                id: u32::from(connector.handle()),
                name: name.to_owned(),
            })?;

        self.pending.push(PendingProperty {
            object: ObjectHandle::Connector(connector.handle()),
            property,
            value,
        });
        Ok(())
    }

    /// Queue a property change on the selected CRTC.
    pub fn set_crtc_property(&mut self, name: &str, value: u64) -> Result<()> {
        let device = self.device;
        let selection = self.state.selection.ok_or(Error::NotConfigured)?;
        let crtc = device.crtc_at(selection.crtc);

        let property = crtc
            .properties()
            .find(name)
            .ok_or_else(|| Error::PropertyNotFound {
                object: "crtc",
                id: u32::from(crtc.handle()),
                name: name.to_owned(),
            })?;

        self.pending.push(PendingProperty {
            object: ObjectHandle::Crtc(crtc.handle()),
            property,
            value,
        });
        Ok(())
    }

    /// Queue a property change on an explicit plane.
    pub fn set_plane_property(&mut self, plane: plane::Handle, name: &str, value: u64) -> Result<()> {
        let device = self.device;
        let plane = device
            .planes()
            .iter()
            .find(|p| p.handle() == plane)
            .ok_or(Error::UnknownId {
                kind: "plane",
                id: u32::from(plane),
            })?;

        let property = plane
            .properties()
            .find(name)
            .ok_or_else(|| Error::PropertyNotFound {
                object: "plane",
                id: u32::from(plane.handle()),
                name: name.to_owned(),
            })?;

        self.pending.push(PendingProperty {
            object: ObjectHandle::Plane(plane.handle()),
            property,
            value,
        });
        Ok(())
    }

    /// Queue the minimum property set that activates the selected pipeline:
    /// the connector's `CRTC_ID`, and the CRTC's `MODE_ID` and `ACTIVE`.
    ///
    /// `ALLOW_MODESET` is OR-ed into `flags` so the kernel will accept the
    /// mode change on commit.
    pub fn set_modeset_properties(&mut self, flags: &mut AtomicCommitFlags) -> Result<()> {
        let device = self.device;
        let selection = self.state.selection.ok_or(Error::NotConfigured)?;
        let mode_blob = self.state.mode_blob.ok_or(Error::NotConfigured)?;
        let crtc = device.crtc_at(selection.crtc);

        self.set_connector_property("CRTC_ID", u64::from(u32::from(crtc.handle())))?;
        self.set_crtc_property("MODE_ID", mode_blob.get())?;
        self.set_crtc_property("ACTIVE", 1)?;

        *flags |= AtomicCommitFlags::ALLOW_MODESET;
        Ok(())
    }

    /// Submit the request to the kernel.
    ///
    /// The request is consumed whether the commit succeeds or fails, and the
    /// device lock is released either way. When `flags` carries
    /// `PAGE_FLIP_EVENT`, `userdata` is delivered through
    /// [`crate::DrmDevice::dispatch_events`] once the flip completes.
    pub fn commit(mut self, flags: AtomicCommitFlags, userdata: u64) -> Result<()> {
        let _span = tracy_client::span!("AtomicRequest::commit");

        trace!(
            "committing {} property changes with flags {flags:?}",
            self.pending.len()
        );

        let mut req = AtomicModeReq::new();
        for pending in &self.pending {
            let value = property::Value::Unknown(pending.value);
            match pending.object {
                ObjectHandle::Connector(handle) => {
                    req.add_property(handle, pending.property, value)
                }
                ObjectHandle::Crtc(handle) => req.add_property(handle, pending.property, value),
                ObjectHandle::Plane(handle) => req.add_property(handle, pending.property, value),
            }
        }

        self.device
            .fd()
            .atomic_commit(flags, req)
            .map_err(|source| Error::CommitFailed { source })?;

        if flags.contains(AtomicCommitFlags::PAGE_FLIP_EVENT) {
            if let Some(selection) = self.state.selection {
                let crtc = self.device.crtc_at(selection.crtc).handle();
                self.state.pending_flips.insert(crtc, userdata);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU64;

    use super::*;
    use crate::device::Selection;
    use crate::inventory::{Connector, Crtc, Encoder, Plane};
    use crate::test_util::{
        connector_handle, crtc_handle, encoder_handle, mode_with, plane_handle, property_bag,
        property_handle, test_fd,
    };

    fn device() -> DrmDevice {
        let mode = mode_with(1920, 1080, 60, 0);
        let connectors = vec![Connector {
            handle: connector_handle(31),
            state: drm::control::connector::State::Connected,
            interface: drm::control::connector::Interface::HDMIA,
            interface_id: 1,
            modes: vec![mode],
            encoders: vec![encoder_handle(41)],
            props: property_bag(&[(100, "CRTC_ID", 0)]),
        }];
        let encoders = vec![Encoder {
            handle: encoder_handle(41),
            possible_crtcs: vec![crtc_handle(51)],
        }];
        let crtcs = vec![Crtc {
            handle: crtc_handle(51),
            index: 0,
            current_mode: None,
            props: property_bag(&[(110, "MODE_ID", 0), (111, "ACTIVE", 0)]),
        }];
        let planes = vec![Plane {
            handle: plane_handle(61),
            possible_crtcs: vec![crtc_handle(51)],
            kind: drm::control::PlaneType::Primary,
            formats: vec![0x3432_5258],
            props: property_bag(&[(120, "type", 1), (121, "FB_ID", 0)]),
        }];

        DrmDevice::with_inventory(test_fd(), connectors, encoders, crtcs, planes)
    }

    fn configured_device() -> DrmDevice {
        let device = device();
        let mode = device.connectors()[0].modes()[0];
        device.select_for_tests(
            Selection {
                connector: 0,
                encoder: 0,
                crtc: 0,
                mode,
            },
            NonZeroU64::new(77).unwrap(),
        );
        device
    }

    #[test]
    fn puts_require_configuration() {
        let device = device();
        let mut request = device.atomic_request();

        assert!(matches!(
            request.set_connector_property("CRTC_ID", 51),
            Err(Error::NotConfigured)
        ));
        assert!(matches!(
            request.set_crtc_property("ACTIVE", 1),
            Err(Error::NotConfigured)
        ));
        let mut flags = AtomicCommitFlags::empty();
        assert!(matches!(
            request.set_modeset_properties(&mut flags),
            Err(Error::NotConfigured)
        ));
        assert!(flags.is_empty());
        assert!(request.is_empty());
    }

    #[test]
    fn unknown_property_leaves_pending_set_unchanged() {
        let device = configured_device();
        let mut request = device.atomic_request();

        let err = request
            .set_plane_property(plane_handle(61), "NOT_A_PROP", 0)
            .unwrap_err();
        assert!(matches!(err, Error::PropertyNotFound { object: "plane", .. }));
        assert!(err.os_error().is_none());
        assert!(request.is_empty());

        // Dropping an uncommitted request is fine and unlocks the device.
        drop(request);
        let request = device.atomic_request();
        assert!(request.is_empty());
    }

    #[test]
    fn unknown_plane_is_rejected() {
        let device = configured_device();
        let mut request = device.atomic_request();

        assert!(matches!(
            request.set_plane_property(plane_handle(99), "FB_ID", 0),
            Err(Error::UnknownId { kind: "plane", id: 99 })
        ));
        assert!(request.is_empty());
    }

    #[test]
    fn modeset_properties_target_the_selection() {
        let device = configured_device();
        let mut request = device.atomic_request();

        let mut flags = AtomicCommitFlags::TEST_ONLY;
        request.set_modeset_properties(&mut flags).unwrap();

        assert!(flags.contains(AtomicCommitFlags::ALLOW_MODESET));
        assert!(flags.contains(AtomicCommitFlags::TEST_ONLY));
        assert_eq!(request.len(), 3);

        let pending = &request.pending;
        assert!(matches!(pending[0].object, ObjectHandle::Connector(h) if h == connector_handle(31)));
        assert_eq!(pending[0].property, property_handle(100));
        assert_eq!(pending[0].value, 51);

        assert!(matches!(pending[1].object, ObjectHandle::Crtc(h) if h == crtc_handle(51)));
        assert_eq!(pending[1].property, property_handle(110));
        assert_eq!(pending[1].value, 77);

        assert!(matches!(pending[2].object, ObjectHandle::Crtc(h) if h == crtc_handle(51)));
        assert_eq!(pending[2].property, property_handle(111));
        assert_eq!(pending[2].value, 1);
    }

    #[test]
    fn failed_commit_consumes_request_and_unlocks() {
        let device = configured_device();
        let mut request = device.atomic_request();
        request.set_crtc_property("ACTIVE", 1).unwrap();

        // The test fd is not a DRM node, so the kernel rejects the ioctl.
        let err = request
            .commit(AtomicCommitFlags::TEST_ONLY, 0)
            .unwrap_err();
        assert!(matches!(err, Error::CommitFailed { .. }));
        assert!(err.os_error().is_some());

        // The lock must be free again.
        let request = device.atomic_request();
        drop(request);
    }
}
