/*!
This crate is a behavioral model of the transaction-layer core of a BSA
(Base System Architecture) PCIe Exerciser endpoint: the same role the
`pcie_rc_tests` and `bsa-acs` test suites give the hardware IP they
drive. It is a software model of the seven engines a real Exerciser
implements behind its BAR0 control surface — BAR dispatch and
completion arbitration, a DMA engine, an MSI-X controller, an ATS
translation/invalidation subsystem, a PASID prefix injector, a
transaction monitor, and the register file tying them together — not a
synthesis artifact and not cycle-accurate with any particular RTL.

# Design consideration

1. The core should be usable standalone, with no hypervisor or root
   complex in the loop: a test can build a [`core::Core`], feed it
   [`tlp::ReqTlp`]/[`tlp::CplTlp`] values directly, and observe its BAR0
   register file and outbound TLP stream.

2. The core runs a cooperative, step-driven model of time (one
   [`core::Core::tick`] per simulated clock) rather than real threads
   racing each other. Every engine's state machine advances by exactly
   one step per tick, so a whole scenario is reproducible from nothing
   but the sequence of register writes and submitted TLPs.

3. A hypervisor-facing bridge thread is still a real need — a vCPU
   thread servicing an MMIO exit cannot single-step the device's model
   of time itself — so [`adapter::ExerciserAdapter`] spawns the core
   onto its own thread and exposes a blocking request/response API,
   the same shape as message passing between a root complex and an
   endpoint: one thread per simulated device, one channel pair between
   it and whoever drives it.

# Core components

* [`core::Core`] — the device model itself. Speaks only in whole
  [`tlp::ReqTlp`]/[`tlp::CplTlp`]/[`tlp::MsgTlp`] values and BAR0
  register reads/writes; knows nothing about threads or hypervisors.
* [`adapter::ExerciserAdapter`] — the bridge. Owns a `Core` on its own
  thread and translates blocking calls into the tick-driven API above.
* [`beat::ReqBeat`]/[`beat::CplBeat`] — the beat-level view the
  transaction monitor and PASID injector operate on; [`tlp::packetize_req`]
  and [`tlp::depacketize_req`] convert between the two representations.

# Module map

* [`error`] — the core's own API-misuse errors (not in-band device
  status, which lives in the registers themselves).
* [`beat`], [`tlp`] — the wire-level data model and its packetizer.
* [`regs`] — the BAR0 register file and its trigger/status semantics.
* [`dma_buffer`] — the BAR1 backing store shared by two access ports.
* [`msix`] — the MSI-X table and Pending Bit Array.
* [`atc`] — the single-entry Address Translation Cache.
* [`monitor`] — the transaction trace FIFO behind `TXN_TRACE`.
* [`config`] — the configuration-space collaborator the core reads from.
* [`dispatcher`] — BAR routing, the four per-BAR handlers, and the
  completion arbiter.
* [`dma_engine`], [`msix_ctrl`], [`ats_engine`], [`ats_inv`] — the four
  engines a register-file trigger or inbound message drives.
* [`injector`] — the PASID prefix injector between the packetizer and
  the TX arbiter.
* [`arbiter`] — the master (outbound request) arbiter and TX arbiter.
*/

pub mod adapter;
pub mod arbiter;
pub mod atc;
pub mod ats_engine;
pub mod ats_inv;
pub mod beat;
pub mod config;
pub mod core;
pub mod dispatcher;
pub mod dma_buffer;
pub mod dma_engine;
pub mod error;
pub mod injector;
pub mod monitor;
pub mod msix;
pub mod msix_ctrl;
pub mod regs;
pub mod tlp;

pub use adapter::ExerciserAdapter;
pub use config::{ConfigSpaceView, ExerciserConfig};
pub use core::Core;
pub use error::{CoreError, CoreResult};
pub use tlp::{CplTlp, MsgTlp, PacketType, ReqTlp, Tlp};
