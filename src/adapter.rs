//! Hypervisor-facing bridge thread (spec.md §9's adapter boundary). The
//! simulated core runs the cooperative step loop described in spec.md
//! §5 inside its own thread; [`ExerciserAdapter`] is the handle a host
//! harness uses to drive it, a full-duplex channel pair generalized
//! from a config-space-only message set to the full BAR0 register map
//! plus the BAR1 buffer.
//!
//! Every call on [`ExerciserAdapter`] is a blocking round-trip: send a
//! request, wait for the matching response. This mirrors how a vCPU
//! thread blocks on an MMIO exit until the device thread answers it.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error};

use crate::arbiter::TxFrame;
use crate::ats_inv::AtsInvalidationRequest;
use crate::config::ConfigSpaceView;
use crate::core::Core;
use crate::tlp::{CplTlp, ReqTlp};

enum AdapterRequest {
    ReadRegister(u32),
    WriteRegister(u32, u32, u8),
    ReadBar1 { offset: usize, len: usize },
    WriteBar1 { offset: usize, data: Vec<u8>, be: u8 },
    SubmitRxTlp(ReqTlp),
    SubmitCpl(CplTlp),
    SubmitAtsInvalidation(AtsInvalidationRequest),
    Tick,
    DrainTx,
}

enum AdapterResponse {
    Register(u32),
    Bar1Data(Vec<u8>),
    Tx(Option<TxFrame>),
    Ack,
}

/// Full-duplex pair of channels between the adapter handle and the
/// core's worker thread, carrying adapter requests/responses instead
/// of raw TLPs in both directions.
struct CoreLane {
    requests: Receiver<AdapterRequest>,
    responses: Sender<AdapterResponse>,
}

/// Handle to a core running in its own thread. Dropping it closes the
/// request channel, which unwinds the worker's receive loop and lets
/// the thread exit cleanly.
pub struct ExerciserAdapter {
    requests: Sender<AdapterRequest>,
    responses: Receiver<AdapterResponse>,
    worker: Option<JoinHandle<()>>,
}

impl ExerciserAdapter {
    /// Spawn a core thread wired to `cfg`'s configuration-space view.
    pub fn spawn<C>(cfg: C) -> Self
    where
        C: ConfigSpaceView + Send + 'static,
    {
        let (req_tx, req_rx) = unbounded();
        let (resp_tx, resp_rx) = unbounded();
        let lane = CoreLane {
            requests: req_rx,
            responses: resp_tx,
        };

        let worker = thread::Builder::new()
            .name("bsa-pcie-exerciser-core".into())
            .spawn(move || run_core(Core::new(cfg), lane))
            .expect("failed to spawn exerciser core thread");

        ExerciserAdapter {
            requests: req_tx,
            responses: resp_rx,
            worker: Some(worker),
        }
    }

    fn call(&self, req: AdapterRequest) -> AdapterResponse {
        self.requests
            .send(req)
            .expect("exerciser core thread terminated unexpectedly");
        self.responses
            .recv()
            .expect("exerciser core thread terminated unexpectedly")
    }

    pub fn read_register(&self, offset: u32) -> u32 {
        match self.call(AdapterRequest::ReadRegister(offset)) {
            AdapterResponse::Register(v) => v,
            _ => unreachable!("adapter protocol violation"),
        }
    }

    pub fn write_register(&self, offset: u32, value: u32, be: u8) {
        self.call(AdapterRequest::WriteRegister(offset, value, be));
    }

    pub fn read_bar1(&self, offset: usize, len: usize) -> Vec<u8> {
        match self.call(AdapterRequest::ReadBar1 { offset, len }) {
            AdapterResponse::Bar1Data(d) => d,
            _ => unreachable!("adapter protocol violation"),
        }
    }

    pub fn write_bar1(&self, offset: usize, data: Vec<u8>, be: u8) {
        self.call(AdapterRequest::WriteBar1 { offset, data, be });
    }

    pub fn submit_rx_tlp(&self, tlp: ReqTlp) {
        self.call(AdapterRequest::SubmitRxTlp(tlp));
    }

    pub fn submit_cpl(&self, cpl: CplTlp) {
        self.call(AdapterRequest::SubmitCpl(cpl));
    }

    pub fn submit_ats_invalidation(&self, req: AtsInvalidationRequest) {
        self.call(AdapterRequest::SubmitAtsInvalidation(req));
    }

    pub fn tick(&self) {
        self.call(AdapterRequest::Tick);
    }

    pub fn drain_tx(&self) -> Option<TxFrame> {
        match self.call(AdapterRequest::DrainTx) {
            AdapterResponse::Tx(frame) => frame,
            _ => unreachable!("adapter protocol violation"),
        }
    }
}

impl Drop for ExerciserAdapter {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_core<C: ConfigSpaceView>(mut core: Core<C>, lane: CoreLane) {
    for req in lane.requests.iter() {
        let resp = match req {
            AdapterRequest::ReadRegister(offset) => {
                AdapterResponse::Register(core.read_register(offset))
            }
            AdapterRequest::WriteRegister(offset, value, be) => {
                core.write_register(offset, value, be);
                AdapterResponse::Ack
            }
            AdapterRequest::ReadBar1 { offset, len } => {
                AdapterResponse::Bar1Data(core.port_b().read_bytes(offset, len))
            }
            AdapterRequest::WriteBar1 { offset, data, be } => {
                core.port_b().write_bytes(offset, &data, be);
                AdapterResponse::Ack
            }
            AdapterRequest::SubmitRxTlp(tlp) => {
                if let Err(e) = core.submit_rx_tlp(tlp) {
                    error!("rejected malformed inbound TLP: {}", e);
                }
                AdapterResponse::Ack
            }
            AdapterRequest::SubmitCpl(cpl) => {
                core.submit_cpl(cpl);
                AdapterResponse::Ack
            }
            AdapterRequest::SubmitAtsInvalidation(req) => {
                core.submit_ats_invalidation(req);
                AdapterResponse::Ack
            }
            AdapterRequest::Tick => {
                core.tick();
                AdapterResponse::Ack
            }
            AdapterRequest::DrainTx => AdapterResponse::Tx(core.drain_tx()),
        };
        if lane.responses.send(resp).is_err() {
            debug!("adapter handle dropped, shutting down core thread");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExerciserConfig;
    use crate::regs;

    #[test]
    fn register_roundtrip_through_adapter_thread() {
        let adapter = ExerciserAdapter::spawn(ExerciserConfig::default());
        adapter.write_register(regs::DMA_OFFSET, 0x1234, 0xF);
        assert_eq!(adapter.read_register(regs::DMA_OFFSET), 0x1234);
    }

    #[test]
    fn bar1_roundtrip_through_adapter_thread() {
        let adapter = ExerciserAdapter::spawn(ExerciserConfig::default());
        adapter.write_bar1(0x10, vec![0xAA, 0xBB, 0xCC, 0xDD], 0xF);
        assert_eq!(adapter.read_bar1(0x10, 4), vec![0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn tick_with_no_pending_work_drains_nothing() {
        let adapter = ExerciserAdapter::spawn(ExerciserConfig::default());
        adapter.tick();
        assert!(adapter.drain_tx().is_none());
    }
}
