//! Atomic DRM/KMS modesetting core.
//!
//! This crate drives a DRM device through its atomic commit interface:
//! - [`DrmDevice`] enumerates the display hardware topology (connectors,
//!   encoders, CRTCs, planes) and caches every object's property set, so
//!   property names resolve to kernel ids without further round trips.
//! - [`DrmDevice::configure`] selects a coherent output pipeline and
//!   publishes the chosen mode as a kernel property blob.
//! - [`AtomicRequest`] collects property changes by name and submits them
//!   as a single atomic commit; page-flip completions come back through
//!   [`DrmDevice::dispatch_events`].
//!
//! The crate is configuration only: buffer allocation, rendering, and the
//! event loop belong to the embedder.

pub mod device;
pub mod error;
pub mod inventory;
pub mod request;

pub use device::{DrmDevice, DrmDeviceFd, EventHandler, Pipeline, PipelineTarget};
pub use error::{Error, Result};
pub use inventory::{
    refresh_interval, Connector, Crtc, Encoder, Plane, PropertyBag, PropertyDescriptor,
};
pub use request::AtomicRequest;

// The DRM handle, mode, and flag types that appear in the public API.
pub use drm::control::{
    connector, crtc, encoder, plane, property, AtomicCommitFlags, Mode, PlaneType,
};

#[cfg(test)]
pub(crate) mod test_util;
