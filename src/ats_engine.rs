//! ATS translation engine (spec.md §4.5): issues an ATS Translation
//! Request for a host-triggered `ATSCTL` write, waits for its
//! completion, and stores the result in both `RegisterFile` and the
//! `Atc`. Gated entirely by [`ConfigSpaceView::ats_enabled`].

use log::{debug, warn};

use crate::atc::{Atc, AtcPermissions};
use crate::beat::{AddressType, Attr, PasidMeta};
use crate::config::ConfigSpaceView;
use crate::regs::{AtsPerm, AtsTriggerLatch, RegisterFile};
use crate::tlp::{CplTlp, PacketType, ReqTlp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtsState {
    Idle,
    IssueReq,
    WaitCpl,
    Store,
    Fail,
}

impl Default for AtsState {
    fn default() -> Self {
        AtsState::Idle
    }
}

#[derive(Debug, Default)]
pub struct AtsEngine {
    state: AtsState,
    latched: Option<AtsTriggerLatch>,
    tag: u8,
    next_tag: u8,
    /// Set by the invalidation handler when an overlapping invalidation
    /// arrives while this translation is still in flight (spec.md
    /// §4.5/§4.6); the next completion is discarded rather than stored,
    /// and `ATSCTL.success` is forced to 0.
    must_retry: bool,
}

/// Decode the wire layout [`AtsPerm::bits`] produces.
fn decode_perm(bits: u32) -> AtsPerm {
    AtsPerm {
        exec: bits & 0b1 != 0,
        write: bits & 0b10 != 0,
        read: bits & 0b100 != 0,
        exec_priv: bits & 0b1000 != 0,
        write_priv: bits & 0b1_0000 != 0,
        read_priv: bits & 0b100_0000 != 0,
    }
}

impl AtsEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> AtsState {
        self.state
    }

    /// The address/PASID of the currently in-flight request, consulted
    /// by the invalidation handler to decide whether it must wait for
    /// this translation to resolve before invalidating the same range
    /// (spec.md §4.6, avoiding a stale ATC store racing an invalidation).
    pub fn in_flight_target(&self) -> Option<(u64, bool, u32)> {
        if self.state != AtsState::WaitCpl {
            return None;
        }
        self.latched
            .as_ref()
            .map(|l| (l.bus_addr, l.pasid_en, l.pasid_val))
    }

    /// Called by the invalidation handler while it is parked in
    /// `WaitAts` on this engine's in-flight request (spec.md §4.6):
    /// the translation the handler is waiting to invalidate must not
    /// be allowed to land in the ATC once its completion arrives.
    pub fn request_retry(&mut self) {
        self.must_retry = true;
    }

    pub fn tick(&mut self, regs: &mut RegisterFile, cfg: &dyn ConfigSpaceView) -> Option<ReqTlp> {
        if self.state == AtsState::Idle {
            if let Some(latch) = regs.take_ats_trigger() {
                if !cfg.ats_enabled() {
                    warn!("ats trigger ignored: ATS capability disabled");
                    regs.set_ats_result(false, false);
                    regs.set_ats_in_flight(false);
                    return None;
                }
                debug!("ats engine accepting trigger: {:?}", latch);
                self.latched = Some(latch);
                self.tag = self.next_tag;
                self.next_tag = self.next_tag.wrapping_add(1);
                regs.set_ats_in_flight(true);
                self.state = AtsState::IssueReq;
            }
        }

        match self.state {
            AtsState::IssueReq => {
                let latch = self.latched?;
                let tlp = ReqTlp {
                    kind: PacketType::AtsTranslationRequest,
                    adr: latch.bus_addr,
                    len: 1,
                    tag: self.tag,
                    req_id: regs.rid_override().unwrap_or(0),
                    first_be: 0xF,
                    last_be: 0,
                    attr: Attr::default(),
                    at: AddressType::Untranslated,
                    pasid: PasidMeta {
                        pasid_en: latch.pasid_en,
                        pasid_val: latch.pasid_val,
                        privileged: latch.privileged,
                        execute: latch.exec_req,
                    },
                    bar_hit: 0,
                    payload: Vec::new(),
                };
                self.state = AtsState::WaitCpl;
                Some(tlp)
            }
            _ => None,
        }
    }

    /// Consume the ATS Translation Completion. Expected payload layout:
    /// `[addr_lo, addr_hi, range_size, perm_bits, cacheable]`.
    pub fn on_completion(&mut self, regs: &mut RegisterFile, atc: &mut Atc, cpl: &CplTlp) {
        if self.state != AtsState::WaitCpl || cpl.tag != self.tag {
            return;
        }
        let latch = match self.latched.take() {
            Some(l) => l,
            None => return,
        };

        if std::mem::replace(&mut self.must_retry, false) {
            warn!("ats translation completion discarded: an overlapping invalidation arrived while the request was in flight");
            self.state = AtsState::Fail;
            regs.set_ats_result(false, false);
            regs.set_ats_in_flight(false);
            self.state = AtsState::Idle;
            return;
        }

        if cpl.err || cpl.payload.len() < 5 {
            warn!("ats translation request failed or malformed completion");
            self.state = AtsState::Fail;
            regs.set_ats_result(false, false);
            regs.set_ats_in_flight(false);
            self.state = AtsState::Idle;
            return;
        }

        let addr = (cpl.payload[0] as u64) | ((cpl.payload[1] as u64) << 32);
        let range_size = cpl.payload[2];
        let perm = decode_perm(cpl.payload[3]);
        let cacheable = cpl.payload[4] != 0;

        self.state = AtsState::Store;
        regs.set_ats_translation(addr, range_size, perm);
        regs.set_ats_result(true, cacheable);
        regs.set_ats_in_flight(false);

        if cacheable {
            atc.store(
                latch.bus_addr,
                addr,
                range_size,
                AtcPermissions {
                    read: perm.read || perm.read_priv,
                    write: perm.write || perm.write_priv,
                    execute: perm.exec || perm.exec_priv,
                },
                latch.pasid_en,
                latch.pasid_val,
            );
        }
        self.state = AtsState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExerciserConfig;
    use crate::regs::{self, ATSCTL};

    fn trigger(regs: &mut RegisterFile) {
        regs.write32(ATSCTL, 1, 0xF);
    }

    #[test]
    fn disabled_ats_fails_immediately_no_tlp() {
        let mut regs = RegisterFile::new();
        let cfg = ExerciserConfig {
            ats_enabled: false,
            ..Default::default()
        };
        let mut engine = AtsEngine::new();
        trigger(&mut regs);
        assert!(engine.tick(&mut regs, &cfg).is_none());
        assert_eq!(regs.read32(regs::ATSCTL) & (1 << 7), 0); // success bit clear
    }

    #[test]
    fn successful_translation_stores_atc_and_registers() {
        let mut regs = RegisterFile::new();
        let cfg = ExerciserConfig::default();
        let mut engine = AtsEngine::new();
        let mut atc = Atc::new();

        regs.write32(regs::DMA_BUS_ADDR_LO, 0x2000, 0xF);
        trigger(&mut regs);
        let tlp = engine.tick(&mut regs, &cfg).unwrap();
        assert_eq!(tlp.adr, 0x2000);

        let cpl = CplTlp {
            cmp_id: 0,
            req_id: tlp.req_id,
            tag: tlp.tag,
            err: false,
            lower_addr: 0,
            payload: vec![0x9000, 0, 0x1000, 0b111, 1],
        };
        engine.on_completion(&mut regs, &mut atc, &cpl);

        assert!(atc.is_valid());
        assert_eq!(regs.read32(regs::ATS_ADDR_LO), 0x9000);
        assert_ne!(regs.read32(ATSCTL) & (1 << 7), 0); // success
    }

    #[test]
    fn retry_requested_discards_completion_and_forces_success_clear() {
        let mut regs = RegisterFile::new();
        let cfg = ExerciserConfig::default();
        let mut engine = AtsEngine::new();
        let mut atc = Atc::new();

        regs.write32(regs::DMA_BUS_ADDR_LO, 0x2000, 0xF);
        trigger(&mut regs);
        let tlp = engine.tick(&mut regs, &cfg).unwrap();

        engine.request_retry();

        let cpl = CplTlp {
            cmp_id: 0,
            req_id: tlp.req_id,
            tag: tlp.tag,
            err: false,
            lower_addr: 0,
            payload: vec![0x9000, 0, 0x1000, 0b111, 1],
        };
        engine.on_completion(&mut regs, &mut atc, &cpl);

        assert!(!atc.is_valid());
        assert_eq!(regs.read32(ATSCTL) & (1 << 7), 0); // success forced clear
        assert!(!regs.ats_in_flight());
    }

    #[test]
    fn failed_completion_clears_in_flight_without_atc_store() {
        let mut regs = RegisterFile::new();
        let cfg = ExerciserConfig::default();
        let mut engine = AtsEngine::new();
        let mut atc = Atc::new();
        trigger(&mut regs);
        let tlp = engine.tick(&mut regs, &cfg).unwrap();
        let cpl = CplTlp {
            cmp_id: 0,
            req_id: tlp.req_id,
            tag: tlp.tag,
            err: true,
            lower_addr: 0,
            payload: vec![],
        };
        engine.on_completion(&mut regs, &mut atc, &cpl);
        assert!(!atc.is_valid());
        assert!(!regs.ats_in_flight());
    }
}
