use thiserror::Error;

use crate::assembler::CancelReason;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MirrorError {
    #[error("Failed to allocate frame with {objects} buffer objects")]
    AllocationFailure { objects: u32 },

    #[error("Capture protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    #[error("Buffer import failed: {reason}")]
    ImportFailed { reason: String },

    #[error("Capture cancelled ({0})")]
    CaptureCancelled(CancelReason),

    #[error("Compositor doesn't support {interface}")]
    UnsupportedCapability { interface: String },

    #[error("Unable to find output with ID {id}")]
    SourceUnavailable { id: u32 },

    #[error("A capture request is already outstanding")]
    RequestInFlight,

    #[error("Capture session has terminated")]
    SessionTerminated,
}

impl MirrorError {
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::ProtocolViolation { reason: reason.into() }
    }

    pub fn import(reason: impl Into<String>) -> Self {
        Self::ImportFailed { reason: reason.into() }
    }

    /// Whether this error ends the capture loop.
    ///
    /// Import failures only cost one frame and transient cancellations are
    /// retried; everything else halts the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::ImportFailed { .. } | Self::CaptureCancelled(CancelReason::Transient)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality() {
        assert!(!MirrorError::import("bad modifier").is_fatal());
        assert!(!MirrorError::CaptureCancelled(CancelReason::Transient).is_fatal());
        assert!(MirrorError::CaptureCancelled(CancelReason::Permanent).is_fatal());
        assert!(MirrorError::protocol("ready without frame").is_fatal());
        assert!(MirrorError::AllocationFailure { objects: 4 }.is_fatal());
    }

    #[test]
    fn test_messages() {
        let err = MirrorError::UnsupportedCapability {
            interface: "zwlr_export_dmabuf_manager_v1".into(),
        };
        assert_eq!(
            err.to_string(),
            "Compositor doesn't support zwlr_export_dmabuf_manager_v1"
        );
        assert_eq!(
            MirrorError::CaptureCancelled(CancelReason::Permanent).to_string(),
            "Capture cancelled (permanent)"
        );
    }
}
