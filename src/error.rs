//! Error reporting for the modesetting core.
//!
//! Every fallible operation returns [`Error`]. Variants that originate in the
//! kernel carry the underlying [`std::io::Error`] so callers that work in the
//! OS error-code space can recover the raw errno via [`Error::os_error`].

use std::io;
use std::path::PathBuf;

use drm::ClientCapability;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The DRM node could not be opened.
    #[error("error opening DRM device {path:?}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The kernel refused a client capability the core cannot work without.
    #[error("kernel refused the {cap:?} client capability")]
    CapabilityUnsupported {
        cap: ClientCapability,
        #[source]
        source: io::Error,
    },

    /// A kernel query or blob operation failed.
    #[error("{op}")]
    Access {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// An object id that is not part of the device's inventory.
    #[error("unknown {kind} id {id}")]
    UnknownId { kind: &'static str, id: u32 },

    /// The encoder is not listed among the connector's possible encoders.
    #[error("encoder {encoder} is not compatible with connector {connector}")]
    EncoderMismatch { connector: u32, encoder: u32 },

    /// The CRTC is not reachable from the encoder.
    #[error("crtc {crtc} is not reachable from encoder {encoder}")]
    CrtcMismatch { encoder: u32, crtc: u32 },

    /// The mode is not advertised by the connector.
    #[error("mode {mode:?} is not advertised by connector {connector}")]
    UnknownMode { connector: u32, mode: String },

    /// A property name that does not exist on the addressed object.
    #[error("no property named {name:?} on {object} {id}")]
    PropertyNotFound {
        object: &'static str,
        id: u32,
        name: String,
    },

    /// The selected connector/CRTC was addressed before a successful
    /// configure.
    #[error("no output pipeline has been configured")]
    NotConfigured,

    /// The kernel rejected the atomic commit. Test-only commits report their
    /// negative result through this variant as well.
    #[error("atomic commit rejected by the kernel")]
    CommitFailed {
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// The OS error code behind this error, for kernel-originated failures.
    ///
    /// Validation errors (unknown ids, bad topology, missing property names,
    /// missing configuration) have no errno and return `None`.
    pub fn os_error(&self) -> Option<i32> {
        match self {
            Error::Open { source, .. }
            | Error::CapabilityUnsupported { source, .. }
            | Error::Access { source, .. }
            | Error::CommitFailed { source } => source.raw_os_error(),
            _ => None,
        }
    }
}
