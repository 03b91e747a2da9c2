//! Top-level wiring (spec.md §2): owns every component and drives them
//! through one `tick()` per model time step, in the dependency order
//! spec.md §2 lays out (leaf state first, top-level arbitration last).

use log::trace;

use crate::arbiter::{Master, MasterArbiter, TxArbiter, TxFrame};
use crate::atc::Atc;
use crate::ats_engine::AtsEngine;
use crate::ats_inv::{AtsInvalidationHandler, AtsInvalidationRequest};
use crate::config::ConfigSpaceView;
use crate::dispatcher::{self, BarBases, BarTarget, CompletionArbiter};
use crate::dma_buffer::DmaBuffer;
use crate::dma_engine::DmaEngine;
use crate::error::CoreResult;
use crate::injector::PasidInjector;
use crate::monitor::TxnMonitor;
use crate::msix::{MsixTable, Pba};
use crate::msix_ctrl::MsixController;
use crate::regs::{self, RegisterFile};
use crate::tlp::{packetize_cpl, packetize_req, CplTlp, ReqTlp};

/// The BSA PCIe Exerciser endpoint's behavioral core, generic over the
/// configuration-space collaborator (spec.md §6.4).
pub struct Core<C: ConfigSpaceView> {
    cfg: C,
    regs: RegisterFile,
    dma_buffer: DmaBuffer,
    msix_table: MsixTable,
    pba: Pba,
    atc: Atc,
    monitor: TxnMonitor,
    bases: BarBases,

    completion_arbiter: CompletionArbiter,
    dma_engine: DmaEngine,
    msix_ctrl: MsixController,
    ats_engine: AtsEngine,
    ats_inv: AtsInvalidationHandler,
    injector: PasidInjector,
    master_arbiter: MasterArbiter,
    tx_arbiter: TxArbiter,
}

impl<C: ConfigSpaceView> Core<C> {
    pub fn new(cfg: C) -> Self {
        let dma_buffer = DmaBuffer::default();
        let dma_engine = DmaEngine::new(dma_buffer.port_a(), cfg.endpoint_id());
        Core {
            cfg,
            regs: RegisterFile::new(),
            dma_buffer,
            msix_table: MsixTable::new(),
            pba: Pba::new(),
            atc: Atc::new(),
            monitor: TxnMonitor::new(),
            bases: BarBases::default(),
            completion_arbiter: CompletionArbiter::new(),
            dma_engine,
            msix_ctrl: MsixController::new(),
            ats_engine: AtsEngine::new(),
            ats_inv: AtsInvalidationHandler::new(),
            injector: PasidInjector::new(),
            master_arbiter: MasterArbiter::new(),
            tx_arbiter: TxArbiter::new(),
        }
    }

    pub fn with_bar_bases(mut self, bases: BarBases) -> Self {
        self.bases = bases;
        self
    }

    pub fn with_dma_timeout_ticks(mut self, ticks: u32) -> Self {
        self.dma_engine = DmaEngine::new(self.dma_buffer.port_a(), self.cfg.endpoint_id())
            .with_timeout_ticks(ticks);
        self
    }

    /// Direct BAR0 register access, independent of the TLP path — the
    /// convenience surface a host-side driver or test harness uses
    /// instead of constructing a Memory Read/Write TLP by hand.
    pub fn read_register(&mut self, offset: u32) -> u32 {
        if offset == regs::TXN_TRACE {
            self.monitor.read_trace_dword()
        } else {
            self.regs.read32(offset)
        }
    }

    pub fn write_register(&mut self, offset: u32, value: u32, be: u8) {
        self.regs.write32(offset, value, be);
        if offset == regs::TXN_CTRL && self.regs.take_txn_clear() {
            self.monitor.clear();
        }
    }

    pub fn port_b(&self) -> crate::dma_buffer::PortB {
        self.dma_buffer.port_b()
    }

    /// Submit one whole inbound request TLP (spec.md §4.1). The
    /// transaction monitor taps every accepted beat before routing, so
    /// it sees requests regardless of which BAR (or none) they hit.
    pub fn submit_rx_tlp(&mut self, tlp: ReqTlp) -> CoreResult<()> {
        let beats = packetize_req(&tlp);
        if let Some(first) = beats.first() {
            self.monitor.capture(first, self.regs.txn_enable());
            self.regs.set_txn_overflow(self.monitor.overflow());
        }

        match dispatcher::route(tlp.bar_hit)? {
            BarTarget::Bar0 => {
                if let Some(cpl) =
                    dispatcher::handle_bar0(&mut self.regs, &mut self.monitor, self.bases.bar0, 0, &tlp)
                {
                    self.completion_arbiter.push_bar0(cpl);
                }
            }
            BarTarget::Bar1 => {
                let port_b = self.dma_buffer.port_b();
                let cpls = dispatcher::handle_bar1(
                    &port_b,
                    self.bases.bar1,
                    self.cfg.max_payload_size(),
                    0,
                    &tlp,
                );
                self.completion_arbiter.push_bar1(cpls);
            }
            BarTarget::Bar2 => {
                if let Some(cpl) =
                    dispatcher::handle_bar2(&mut self.msix_table, self.bases.bar2, 0, &tlp)
                {
                    self.completion_arbiter.push_bar2(cpl);
                }
            }
            BarTarget::Bar5 => {
                if let Some(cpl) = dispatcher::handle_bar5(&self.pba, self.bases.bar5, 0, &tlp) {
                    self.completion_arbiter.push_bar5(cpl);
                }
            }
            BarTarget::Stub => {
                if let Some(cpl) = dispatcher::handle_stub(0, &tlp) {
                    self.completion_arbiter.push_stub(cpl);
                }
            }
        }
        Ok(())
    }

    /// Submit one whole inbound completion TLP, routed by tag to
    /// whichever internal master is awaiting it (spec.md §4.4, §4.5).
    pub fn submit_cpl(&mut self, cpl: CplTlp) {
        if self.dma_engine.has_pending_tag(cpl.tag) {
            self.dma_engine.on_completion(&cpl);
        } else if self.ats_engine.state() == crate::ats_engine::AtsState::WaitCpl {
            self.ats_engine.on_completion(&mut self.regs, &mut self.atc, &cpl);
        } else {
            trace!("dropping completion for unmatched tag {}", cpl.tag);
        }
    }

    /// Queue an inbound ATS Invalidation Request (spec.md §4.6).
    pub fn submit_ats_invalidation(&mut self, req: AtsInvalidationRequest) {
        self.ats_inv.submit(req);
    }

    /// Advance the whole core by one model tick (spec.md §5).
    pub fn tick(&mut self) {
        self.msix_table.tick();

        // spec.md §4.5: "with ATS disabled the engine refuses new
        // triggers and clears any cached state" — a disabled ATS-ECAP
        // bit invalidates any translation the ATC is still holding.
        if !self.cfg.ats_enabled() && self.atc.is_valid() {
            self.atc.clear();
        }

        if let Some(tlp) = self.dma_engine.tick(&mut self.regs, &self.atc, &self.cfg) {
            self.master_arbiter.push(Master::Dma, tlp);
        }
        if let Some(tlp) =
            self.msix_ctrl
                .tick(&mut self.regs, &self.msix_table, &mut self.pba, self.cfg.endpoint_id())
        {
            self.master_arbiter.push(Master::MsiX, tlp);
        }
        if let Some(tlp) = self.ats_engine.tick(&mut self.regs, &self.cfg) {
            self.master_arbiter.push(Master::Ats, tlp);
        }

        if let Some((_master, tlp)) = self.master_arbiter.grant() {
            let beats = packetize_req(&tlp);
            let beats = self.injector.process(beats);
            self.tx_arbiter.push_main(TxFrame::Req(beats));
        }

        if let Some(cpl) = self.completion_arbiter.drain_one() {
            let beats = packetize_cpl(&cpl);
            self.tx_arbiter.push_main(TxFrame::Cpl(beats));
        }

        if let Some(msg) = self.ats_inv.tick(
            &mut self.regs,
            &mut self.atc,
            &mut self.ats_engine,
            &self.dma_engine,
        ) {
            self.tx_arbiter.push_raw(msg);
        }

        if self.regs.take_ats_clear_atc() {
            self.atc.clear();
        }
    }

    /// Advance by `n` ticks with no inputs submitted in between.
    pub fn advance_time(&mut self, n: u32) {
        for _ in 0..n {
            self.tick();
        }
    }

    /// Drain one outbound TX-stream frame, if any is ready.
    pub fn drain_tx(&mut self) -> Option<TxFrame> {
        self.tx_arbiter.drain_one()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beat::{AddressType, Attr, PasidMeta};
    use crate::config::ExerciserConfig;
    use crate::tlp::PacketType;

    fn bar0_write(core: &mut Core<ExerciserConfig>, offset: u32, value: u32) {
        let tlp = ReqTlp {
            kind: PacketType::MemoryWrite,
            adr: core.bases.bar0 + offset as u64,
            len: 1,
            tag: 0,
            req_id: 0x0100,
            first_be: 0xF,
            last_be: 0,
            attr: Attr::default(),
            at: AddressType::Default,
            pasid: PasidMeta::default(),
            bar_hit: 0b1,
            payload: vec![value],
        };
        core.submit_rx_tlp(tlp).unwrap();
    }

    fn bar0_read(core: &mut Core<ExerciserConfig>, offset: u32) -> u32 {
        let tlp = ReqTlp {
            kind: PacketType::MemoryRead,
            adr: core.bases.bar0 + offset as u64,
            len: 1,
            tag: 0,
            req_id: 0x0100,
            first_be: 0xF,
            last_be: 0,
            attr: Attr::default(),
            at: AddressType::Default,
            pasid: PasidMeta::default(),
            bar_hit: 0b1,
            payload: vec![],
        };
        core.submit_rx_tlp(tlp).unwrap();
        match core.drain_tx() {
            Some(TxFrame::Cpl(beats)) => beats[0].dat,
            other => panic!("expected a completion frame, got {:?}", other),
        }
    }

    #[test]
    fn bar0_roundtrip_through_core() {
        let mut core = Core::new(ExerciserConfig::default());
        bar0_write(&mut core, regs::DMA_OFFSET, 0xAAAA);
        core.tick();
        let value = bar0_read(&mut core, regs::DMA_OFFSET);
        assert_eq!(value, 0xAAAA);
    }

    #[test]
    fn dma_read_trigger_produces_outbound_request_via_tick() {
        let mut core = Core::new(ExerciserConfig::default());
        bar0_write(&mut core, regs::DMA_BUS_ADDR_LO, 0x5000);
        bar0_write(&mut core, regs::DMA_LEN, 16);
        bar0_write(&mut core, regs::DMACTL, 0x1); // direction=read, trigger=1
        core.tick();

        match core.drain_tx() {
            Some(TxFrame::Req(beats)) => assert!(!beats.is_empty()),
            other => panic!("expected a request frame, got {:?}", other),
        }
    }

    #[test]
    fn dma_write_trigger_emits_on_the_second_tick() {
        let mut core = Core::new(ExerciserConfig::default());
        bar0_write(&mut core, regs::DMA_BUS_ADDR_LO, 0x5000);
        bar0_write(&mut core, regs::DMA_LEN, 16);
        bar0_write(&mut core, regs::DMACTL, 0x11); // direction=write, trigger=1
        core.tick(); // consumes the LOAD_DATA step
        core.tick(); // ISSUE_WR actually emits the TLP

        match core.drain_tx() {
            Some(TxFrame::Req(beats)) => assert!(!beats.is_empty()),
            other => panic!("expected a request frame, got {:?}", other),
        }
    }

    #[test]
    fn unmatched_completion_tag_is_dropped_without_panic() {
        let mut core = Core::new(ExerciserConfig::default());
        core.submit_cpl(CplTlp {
            cmp_id: 0,
            req_id: 0,
            tag: 99,
            err: false,
            lower_addr: 0,
            payload: vec![],
        });
    }
}
