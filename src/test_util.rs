//! Shared helpers for unit tests: synthetic handles, modes, and property
//! bags that do not require a live DRM device.

use std::mem;
use std::path::Path;

use drm::control::{connector, crtc, encoder, plane, property, Mode};

use crate::device::DrmDeviceFd;
use crate::inventory::{PropertyBag, PropertyDescriptor};

// DRM handles are repr(transparent) over NonZeroU32, so a raw nonzero id
// converts directly.
macro_rules! handle_fn {
    ($name:ident, $ty:ty) => {
        pub(crate) fn $name(id: u32) -> $ty {
            assert_ne!(id, 0);
            unsafe { mem::transmute::<u32, $ty>(id) }
        }
    };
}

handle_fn!(connector_handle, connector::Handle);
handle_fn!(encoder_handle, encoder::Handle);
handle_fn!(crtc_handle, crtc::Handle);
handle_fn!(plane_handle, plane::Handle);
handle_fn!(property_handle, property::Handle);

/// A mode with plausible blanking intervals around the active area.
pub(crate) fn mode_with(width: u16, height: u16, vrefresh: u32, type_: u32) -> Mode {
    Mode::from(drm_ffi::drm_mode_modeinfo {
        clock: u32::from(width) * u32::from(height) * vrefresh / 1000,
        hdisplay: width,
        hsync_start: width + 88,
        hsync_end: width + 132,
        htotal: width + 280,
        vdisplay: height,
        vsync_start: height + 4,
        vsync_end: height + 9,
        vtotal: height + 45,
        vrefresh,
        flags: 0,
        type_,
        name: [0; 32],
        hskew: 0,
        vscan: 0,
    })
}

/// The CVT 1920x1080@60 timing.
pub(crate) fn mode_1080p() -> Mode {
    Mode::from(drm_ffi::drm_mode_modeinfo {
        clock: 173_000,
        hdisplay: 1920,
        hsync_start: 2048,
        hsync_end: 2248,
        htotal: 2576,
        vdisplay: 1080,
        vsync_start: 1083,
        vsync_end: 1088,
        vtotal: 1120,
        vrefresh: 60,
        flags: 0,
        type_: 0,
        name: [0; 32],
        hskew: 0,
        vscan: 0,
    })
}

/// Build a property bag from (id, name, current value) triples.
pub(crate) fn property_bag(props: &[(u32, &str, u64)]) -> PropertyBag {
    let entries = props
        .iter()
        .map(|&(id, _, value)| (property_handle(id), value))
        .collect();
    let descriptors = props
        .iter()
        .map(|&(id, name, _)| PropertyDescriptor {
            handle: property_handle(id),
            name: name.to_owned(),
            value_type: property::ValueType::UnsignedRange(0, u64::MAX),
        })
        .collect();
    PropertyBag::new(entries, descriptors)
}

/// A descriptor that accepts ioctls but is not a DRM node, for exercising
/// kernel-rejection paths.
pub(crate) fn test_fd() -> DrmDeviceFd {
    DrmDeviceFd::open(Path::new("/dev/null")).unwrap()
}
