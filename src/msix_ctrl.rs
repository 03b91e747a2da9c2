//! MSI-X controller (spec.md §4.3): consumes `MSICTL` trigger writes,
//! reads the MSI-X table's internal (delayed) view, and either sets the
//! pending bit (vector masked) or issues a single-beat posted Memory
//! Write carrying the vector's message address/data (vector unmasked).

use log::{debug, trace};

use crate::beat::{AddressType, Attr, PasidMeta};
use crate::msix::{MsixTable, Pba};
use crate::regs::RegisterFile;
use crate::tlp::{PacketType, ReqTlp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsixCtrlState {
    Idle,
    ReadTable,
    Masked,
    IssueWrite,
}

#[derive(Debug, Default)]
pub struct MsixController {
    state: MsixCtrlState,
}

impl Default for MsixCtrlState {
    fn default() -> Self {
        MsixCtrlState::Idle
    }
}

impl MsixController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MsixCtrlState {
        self.state
    }

    /// Advance by one tick. Returns an outbound request TLP on the tick
    /// a trigger resolves to an unmasked, deliverable interrupt.
    pub fn tick(
        &mut self,
        regs: &mut RegisterFile,
        table: &MsixTable,
        pba: &mut Pba,
        endpoint_id: u16,
    ) -> Option<ReqTlp> {
        let latch = regs.take_msi_trigger()?;
        self.state = MsixCtrlState::ReadTable;
        let vector = latch.vector_id as usize;

        let entry = match table.internal_read(vector) {
            Some(e) => e,
            None => {
                trace!("msi-x trigger for out-of-range vector {}", vector);
                self.state = MsixCtrlState::Idle;
                return None;
            }
        };

        if entry.masked() {
            debug!("msi-x vector {} triggered while masked, setting PBA", vector);
            pba.set(vector);
            self.state = MsixCtrlState::Masked;
            self.state = MsixCtrlState::Idle;
            return None;
        }

        // Vector was masked when a prior trigger arrived; now it is
        // unmasked and this trigger delivers, so the pending bit clears.
        pba.clear(vector);
        self.state = MsixCtrlState::IssueWrite;

        let req_id = regs.rid_override().unwrap_or(endpoint_id);
        let tlp = ReqTlp {
            kind: PacketType::MemoryWrite,
            adr: entry.msg_addr(),
            len: 1,
            tag: 0,
            req_id,
            first_be: 0xF,
            last_be: 0,
            attr: Attr::default(),
            at: AddressType::Default,
            pasid: PasidMeta::default(),
            bar_hit: 0,
            payload: vec![entry.msg_data],
        };
        self.state = MsixCtrlState::Idle;
        Some(tlp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::{self, MSICTL};

    fn trigger(regs: &mut RegisterFile, vector: u16) {
        regs.write32(MSICTL, 0x8000_0000 | vector as u32, 0xF);
    }

    #[test]
    fn masked_vector_sets_pba_emits_no_tlp() {
        let mut regs = RegisterFile::new();
        let table = MsixTable::new(); // reset state: all masked
        let mut pba = Pba::new();
        let mut ctrl = MsixController::new();

        trigger(&mut regs, 2);
        let out = ctrl.tick(&mut regs, &table, &mut pba, 0x0100);
        assert!(out.is_none());
        assert!(pba.get(2));
    }

    #[test]
    fn unmasked_vector_emits_write_and_clears_pba() {
        let mut regs = RegisterFile::new();
        let mut table = MsixTable::new();
        table.write(4, 0x0, 0x1_0000, 0xF); // addr_lo
        table.write(4, 0x8, 0xCAFEBABE, 0xF); // data
        table.write(4, 0xC, 0x0, 0xF); // unmask
        for _ in 0..3 {
            table.tick();
        }
        let mut pba = Pba::new();
        pba.set(4);
        let mut ctrl = MsixController::new();

        trigger(&mut regs, 4);
        let tlp = ctrl.tick(&mut regs, &table, &mut pba, 0x0100).unwrap();
        assert_eq!(tlp.adr, 0x1_0000);
        assert_eq!(tlp.payload[0], 0xCAFEBABE);
        assert!(!pba.get(4));
    }

    #[test]
    fn rid_override_applies_to_msix_writes() {
        let mut regs = RegisterFile::new();
        let mut table = MsixTable::new();
        table.write(0, 0xC, 0x0, 0xF);
        for _ in 0..3 {
            table.tick();
        }
        regs.write32(regs::RID_CTL, 0xBEEF | (1 << 31), 0xF);
        let mut pba = Pba::new();
        let mut ctrl = MsixController::new();
        trigger(&mut regs, 0);
        let tlp = ctrl.tick(&mut regs, &table, &mut pba, 0x0100).unwrap();
        assert_eq!(tlp.req_id, 0xBEEF);
    }
}
