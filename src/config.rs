//! Configuration-space collaborator (spec.md §6.4). Treated as an
//! external, read-only collaborator: the core never mutates it, only
//! reads the handful of fields it actually needs.

/// The subset of configuration-space / capability state the core
/// consumes. Exposed as a trait (rather than a concrete struct) so a
/// test harness can supply a fake without modeling a full ECAP/DVSEC
/// capability chain, which spec.md §1 places out of scope.
pub trait ConfigSpaceView {
    /// The only ATS-ECAP flag the core consumes (spec.md §4.5).
    fn ats_enabled(&self) -> bool;

    /// 16-bit Bus/Device/Function identifier used as `req_id` when
    /// `RID_CTL.valid` is not set (spec.md §6.4).
    fn endpoint_id(&self) -> u16;

    /// Max Payload Size in bytes, re-read on every DMA trigger (spec.md §6.4).
    fn max_payload_size(&self) -> u16;

    /// Max Read Request Size in bytes, re-read on every DMA trigger.
    fn max_request_size(&self) -> u16;
}

/// A plain-data stand-in for the configuration-space collaborator,
/// suitable for standalone use of the core without a full config-space
/// model wired up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExerciserConfig {
    pub ats_enabled: bool,
    pub endpoint_id: u16,
    pub max_payload_size: u16,
    pub max_request_size: u16,
}

impl Default for ExerciserConfig {
    fn default() -> Self {
        ExerciserConfig {
            ats_enabled: true,
            endpoint_id: 0,
            max_payload_size: 256,
            max_request_size: 512,
        }
    }
}

impl ConfigSpaceView for ExerciserConfig {
    fn ats_enabled(&self) -> bool {
        self.ats_enabled
    }

    fn endpoint_id(&self) -> u16 {
        self.endpoint_id
    }

    fn max_payload_size(&self) -> u16 {
        self.max_payload_size
    }

    fn max_request_size(&self) -> u16 {
        self.max_request_size
    }
}
