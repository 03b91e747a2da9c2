//! Errors surfaced by the core's own API misuse, as opposed to the
//! in-band status registers and completion `err` bits that spec.md §7
//! requires for recoverable device-level failures. Nothing in the
//! simulated device logic itself returns `Err`; this type exists for
//! conditions that indicate the wiring around the core is broken.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("bar_hit must be one-hot over {{0,1,2,3,4,5}}, got {0:#08b}")]
    MalformedBarHit(u8),

    #[error("register offset {0:#x} is not a valid DWORD offset (must be 4-byte aligned)")]
    MisalignedRegisterOffset(u32),

    #[error("tlp submitted with no beats")]
    EmptyTlp,

    #[error("beat delivered to {0} mid-packet with first=1, violating TLP atomicity")]
    UnexpectedFirstBeat(&'static str),

    #[error("beat delivered to {0} without a preceding first=1 beat")]
    MissingFirstBeat(&'static str),
}

pub type CoreResult<T> = Result<T, CoreError>;
