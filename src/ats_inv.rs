//! ATS invalidation handler (spec.md §4.6): answers Invalidation
//! Request messages by clearing any overlapping `Atc` entry and
//! replying with a raw Invalidation Completion message, deferring the
//! invalidation while a racing ATS translation or DMA transfer targets
//! an overlapping range so a completion can never be stored after the
//! range it covers was supposedly already invalidated. While parked in
//! `WaitAts` it also marks the in-flight translation for retry
//! (`AtsEngine::request_retry`), so that even if its completion arrives
//! before the invalidation resolves, the result is discarded rather
//! than stored with `ATSCTL.success=1`.

use std::collections::VecDeque;

use log::{debug, trace};

use crate::atc::Atc;
use crate::ats_engine::AtsEngine;
use crate::dma_engine::DmaEngine;
use crate::regs::RegisterFile;
use crate::tlp::MsgTlp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvState {
    Idle,
    Receive,
    Check,
    WaitAts,
    WaitDma,
    Invalidate,
    SendCpl,
}

impl Default for InvState {
    fn default() -> Self {
        InvState::Idle
    }
}

/// One inbound ATS Invalidation Request (spec.md §4.6), already
/// depacketized from its Message TLP by an external collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtsInvalidationRequest {
    pub req_id: u16,
    pub tag: u8,
    pub addr: u64,
    pub range_size: u64,
    /// Global invalidations (the common case for a single-entry ATC)
    /// skip the PASID comparison entirely; non-global ones must match
    /// the cached entry's PASID to apply (spec.md §4.6 "PASID mismatch
    /// on a non-global invalidation").
    pub global: bool,
    pub pasid_valid: bool,
    pub pasid_val: u32,
}

#[derive(Debug, Default)]
pub struct AtsInvalidationHandler {
    state: InvState,
    queue: VecDeque<AtsInvalidationRequest>,
    current: Option<AtsInvalidationRequest>,
}

fn ranges_overlap(a_start: u64, a_len: u64, b_start: u64, b_len: u64) -> bool {
    if a_len == 0 || b_len == 0 {
        return false;
    }
    let a_end = a_start.saturating_add(a_len);
    let b_end = b_start.saturating_add(b_len);
    a_start < b_end && b_start < a_end
}

impl AtsInvalidationHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> InvState {
        self.state
    }

    pub fn submit(&mut self, req: AtsInvalidationRequest) {
        debug!("queuing ats invalidation request: {:?}", req);
        self.queue.push_back(req);
    }

    /// Advance by one tick. Returns the completion message once an
    /// in-progress invalidation resolves.
    pub fn tick(
        &mut self,
        regs: &mut RegisterFile,
        atc: &mut Atc,
        ats: &mut AtsEngine,
        dma: &DmaEngine,
    ) -> Option<MsgTlp> {
        if self.current.is_none() {
            self.current = self.queue.pop_front();
            if self.current.is_some() {
                self.state = InvState::Receive;
            }
        }
        let req = (*self.current.as_ref()?);
        self.state = InvState::Check;

        let pasid_mismatch = !req.global
            && (atc.pasid_valid() != req.pasid_valid
                || (req.pasid_valid && atc.pasid_val() != req.pasid_val));
        let applies = atc.is_valid() && atc.overlaps(req.addr, req.range_size) && !pasid_mismatch;

        if !applies {
            trace!("invalidation does not apply to the cached atc entry, skipping straight to completion");
            self.state = InvState::SendCpl;
            let msg = MsgTlp::ats_invalidation_completion(req.req_id, req.tag);
            self.current = None;
            self.state = InvState::Idle;
            return Some(msg);
        }

        if let Some((addr, _pasid_en, _pasid_val)) = ats.in_flight_target() {
            if ranges_overlap(req.addr, req.range_size.max(1), addr, 1) {
                trace!("invalidation waiting on in-flight ats translation, marking it for retry");
                ats.request_retry();
                self.state = InvState::WaitAts;
                return None;
            }
        }

        if dma.uses_atc() {
            if let Some((bus_addr, len)) = dma.in_flight_range() {
                if ranges_overlap(req.addr, req.range_size.max(1), bus_addr, len) {
                    trace!("invalidation waiting on in-flight dma transfer using the atc");
                    self.state = InvState::WaitDma;
                    return None;
                }
            }
        }

        self.state = InvState::Invalidate;
        atc.clear();
        regs.set_ats_invalidated();

        self.state = InvState::SendCpl;
        let msg = MsgTlp::ats_invalidation_completion(req.req_id, req.tag);
        self.current = None;
        self.state = InvState::Idle;
        Some(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atc::AtcPermissions;
    use crate::config::ExerciserConfig;

    #[test]
    fn invalidates_overlapping_atc_entry_and_replies() {
        let mut regs = RegisterFile::new();
        let mut atc = Atc::new();
        atc.store(0x1000, 0x9000, 0x1000, AtcPermissions::default(), false, 0);
        let mut ats = AtsEngine::new();
        let dma = DmaEngine::new(crate::dma_buffer::DmaBuffer::new(4096).port_a(), 0);
        let mut handler = AtsInvalidationHandler::new();

        handler.submit(AtsInvalidationRequest {
            req_id: 0x0100,
            tag: 7,
            addr: 0x1500,
            range_size: 0x100,
            global: true,
            pasid_valid: false,
            pasid_val: 0,
        });

        let msg = handler.tick(&mut regs, &mut atc, &mut ats, &dma).unwrap();
        assert_eq!(msg.tag, 7);
        assert!(!atc.is_valid());
    }

    #[test]
    fn non_overlapping_invalidation_leaves_atc_untouched() {
        let mut regs = RegisterFile::new();
        let mut atc = Atc::new();
        atc.store(0x1000, 0x9000, 0x1000, AtcPermissions::default(), false, 0);
        let mut ats = AtsEngine::new();
        let dma = DmaEngine::new(crate::dma_buffer::DmaBuffer::new(4096).port_a(), 0);
        let mut handler = AtsInvalidationHandler::new();

        handler.submit(AtsInvalidationRequest {
            req_id: 0x0100,
            tag: 1,
            addr: 0x50000,
            range_size: 0x100,
            global: true,
            pasid_valid: false,
            pasid_val: 0,
        });
        handler.tick(&mut regs, &mut atc, &mut ats, &dma).unwrap();
        assert!(atc.is_valid());
    }

    #[test]
    fn waits_while_dma_transfer_overlaps_range() {
        let mut regs = RegisterFile::new();
        let mut atc = Atc::new();
        atc.store(0x2000, 0x9000, 64, AtcPermissions::default(), false, 0);
        let mut ats = AtsEngine::new();
        let buf = crate::dma_buffer::DmaBuffer::new(4096);
        let mut dma = DmaEngine::new(buf.port_a(), 0);
        let cfg = ExerciserConfig::default();
        dma.accept_trigger(
            &mut regs,
            crate::regs::DmaTriggerLatch {
                direction_write: true,
                no_snoop: false,
                pasid_en: false,
                privileged: false,
                instruction: false,
                use_atc: true,
                addr_type: crate::beat::AddressType::Default,
                bus_addr: 0x2000,
                offset: 0,
                length: 64,
                pasid_val: 0,
                rid_override: None,
            },
        );
        let _ = cfg;

        let mut handler = AtsInvalidationHandler::new();
        handler.submit(AtsInvalidationRequest {
            req_id: 0x0100,
            tag: 2,
            addr: 0x2000,
            range_size: 64,
            global: true,
            pasid_valid: false,
            pasid_val: 0,
        });
        assert!(handler.tick(&mut regs, &mut atc, &mut ats, &dma).is_none());
        assert_eq!(handler.state(), InvState::WaitDma);
    }

    #[test]
    fn pasid_scoped_invalidation_skips_mismatched_entry() {
        let mut regs = RegisterFile::new();
        let mut atc = Atc::new();
        atc.store(0x1000, 0x9000, 0x1000, AtcPermissions::default(), true, 5);
        let mut ats = AtsEngine::new();
        let dma = DmaEngine::new(crate::dma_buffer::DmaBuffer::new(4096).port_a(), 0);
        let mut handler = AtsInvalidationHandler::new();

        handler.submit(AtsInvalidationRequest {
            req_id: 0x0100,
            tag: 3,
            addr: 0x1500,
            range_size: 0x100,
            global: false,
            pasid_valid: true,
            pasid_val: 9,
        });

        handler.tick(&mut regs, &mut atc, &mut ats, &dma).unwrap();
        assert!(atc.is_valid());
    }

    #[test]
    fn waits_on_in_flight_ats_translation_and_discards_its_completion() {
        let mut regs = RegisterFile::new();
        let mut atc = Atc::new();
        let mut ats = AtsEngine::new();
        let dma = DmaEngine::new(crate::dma_buffer::DmaBuffer::new(4096).port_a(), 0);
        let mut handler = AtsInvalidationHandler::new();
        let cfg = ExerciserConfig::default();

        regs.write32(crate::regs::DMA_BUS_ADDR_LO, 0x3000, 0xF);
        regs.write32(crate::regs::ATSCTL, 1, 0xF);
        let tlp = ats.tick(&mut regs, &cfg).unwrap();

        handler.submit(AtsInvalidationRequest {
            req_id: 0x0100,
            tag: 5,
            addr: 0x3000,
            range_size: 0x100,
            global: true,
            pasid_valid: false,
            pasid_val: 0,
        });
        assert!(handler.tick(&mut regs, &mut atc, &mut ats, &dma).is_none());
        assert_eq!(handler.state(), InvState::WaitAts);

        // The completion for the in-flight translation now arrives —
        // it must be discarded, not stored, since the invalidation
        // already claimed the range.
        let cpl = crate::tlp::CplTlp {
            cmp_id: 0,
            req_id: tlp.req_id,
            tag: tlp.tag,
            err: false,
            lower_addr: 0,
            payload: vec![0x9000, 0, 0x1000, 0b111, 1],
        };
        ats.on_completion(&mut regs, &mut atc, &cpl);
        assert!(!atc.is_valid());
        assert_eq!(regs.read32(crate::regs::ATSCTL) & (1 << 7), 0);
    }
}
