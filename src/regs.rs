//! BAR0 register file (spec.md §4.2, §6.1) — the observable control
//! surface of the whole core. Every offset not enumerated here reads
//! as 0 (spec.md §3 invariant); self-clearing and W1C bits clear
//! observably after the triggering write, modeled with the
//! "pending-clear drained by the consumer" pattern from spec.md §9.

use crate::beat::AddressType;

pub const MSICTL: u32 = 0x000;
pub const INTXCTL: u32 = 0x004;
pub const DMACTL: u32 = 0x008;
pub const DMA_OFFSET: u32 = 0x00C;
pub const DMA_BUS_ADDR_LO: u32 = 0x010;
pub const DMA_BUS_ADDR_HI: u32 = 0x014;
pub const DMA_LEN: u32 = 0x018;
pub const DMASTATUS: u32 = 0x01C;
pub const PASID_VAL: u32 = 0x020;
pub const ATSCTL: u32 = 0x024;
pub const ATS_ADDR_LO: u32 = 0x028;
pub const ATS_ADDR_HI: u32 = 0x02C;
pub const ATS_RANGE_SIZE: u32 = 0x030;
pub const ATS_PERM: u32 = 0x038;
pub const RID_CTL: u32 = 0x03C;
pub const TXN_TRACE: u32 = 0x040;
pub const TXN_CTRL: u32 = 0x044;
pub const ID: u32 = 0x048;

const DEVICE_ID: u32 = 0xED01_13B5;

/// The values a `DMACTL` trigger write latches for the DMA engine,
/// captured at the moment the register file observes the write
/// (spec.md §4.4: "On accepting the trigger, the engine latches...").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaTriggerLatch {
    pub direction_write: bool,
    pub no_snoop: bool,
    pub pasid_en: bool,
    pub privileged: bool,
    pub instruction: bool,
    pub use_atc: bool,
    pub addr_type: AddressType,
    pub bus_addr: u64,
    pub offset: u32,
    pub length: u32,
    pub pasid_val: u32,
    pub rid_override: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsiXTriggerLatch {
    pub vector_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtsTriggerLatch {
    pub privileged: bool,
    pub no_write: bool,
    pub pasid_en: bool,
    pub exec_req: bool,
    pub bus_addr: u64,
    pub pasid_val: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AtsPerm {
    pub exec: bool,
    pub write: bool,
    pub read: bool,
    pub exec_priv: bool,
    pub write_priv: bool,
    pub read_priv: bool,
}

impl AtsPerm {
    pub fn bits(self) -> u32 {
        (self.exec as u32)
            | ((self.write as u32) << 1)
            | ((self.read as u32) << 2)
            | ((self.exec_priv as u32) << 3)
            | ((self.write_priv as u32) << 4)
            | ((self.read_priv as u32) << 6)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaStatus {
    Ok = 0,
    Range = 1,
    Internal = 2,
}

#[derive(Debug)]
pub struct RegisterFile {
    // MSICTL
    msictl_vector_id: u16,
    msi_pending_trigger: Option<MsiXTriggerLatch>,

    // INTXCTL
    intxctl_assert: bool,

    // DMACTL persistent config (everything but the trigger nibble)
    dma_direction_write: bool,
    dma_no_snoop: bool,
    dma_pasid_en: bool,
    dma_privileged: bool,
    dma_instruction: bool,
    dma_use_atc: bool,
    dma_addr_type: AddressType,
    dma_pending_trigger: Option<DmaTriggerLatch>,

    dma_offset: u32,
    dma_bus_addr_lo: u32,
    dma_bus_addr_hi: u32,
    dma_len: u32,

    dma_status: DmaStatus,

    pasid_val: u32,

    // ATSCTL
    ats_privileged: bool,
    ats_no_write: bool,
    ats_pasid_en: bool,
    ats_exec_req: bool,
    ats_in_flight: bool,
    ats_success: bool,
    ats_cacheable: bool,
    ats_invalidated: bool,
    ats_pending_trigger: Option<AtsTriggerLatch>,
    ats_pending_clear_atc: bool,

    ats_addr_lo: u32,
    ats_addr_hi: u32,
    ats_range_size: u32,
    ats_perm: AtsPerm,

    rid_req_id: u16,
    rid_valid: bool,

    txn_enable: bool,
    txn_overflow: bool,
    txn_pending_clear: bool,
}

impl Default for RegisterFile {
    fn default() -> Self {
        RegisterFile {
            msictl_vector_id: 0,
            msi_pending_trigger: None,
            intxctl_assert: false,
            dma_direction_write: false,
            dma_no_snoop: false,
            dma_pasid_en: false,
            dma_privileged: false,
            dma_instruction: false,
            dma_use_atc: false,
            dma_addr_type: AddressType::Default,
            dma_pending_trigger: None,
            dma_offset: 0,
            dma_bus_addr_lo: 0,
            dma_bus_addr_hi: 0,
            dma_len: 0,
            dma_status: DmaStatus::Ok,
            pasid_val: 0,
            ats_privileged: false,
            ats_no_write: false,
            ats_pasid_en: false,
            ats_exec_req: false,
            ats_in_flight: false,
            ats_success: false,
            ats_cacheable: false,
            ats_invalidated: false,
            ats_pending_trigger: None,
            ats_pending_clear_atc: false,
            ats_addr_lo: 0,
            ats_addr_hi: 0,
            ats_range_size: 0,
            ats_perm: AtsPerm::default(),
            rid_req_id: 0,
            rid_valid: false,
            txn_enable: false,
            txn_overflow: false,
            txn_pending_clear: false,
        }
    }
}

/// Applies a 4-bit byte-enable mask to a read-modify-write of `reg`.
fn apply_be(reg: u32, value: u32, be: u8) -> u32 {
    let mut mask = 0u32;
    for i in 0..4u32 {
        if be & (1 << i) != 0 {
            mask |= 0xFF << (i * 8);
        }
    }
    (reg & !mask) | (value & mask)
}

impl RegisterFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a BAR0 DWORD. Offsets not enumerated in spec.md §6.1 read
    /// as 0, including TXN_TRACE/TXN_CTRL which are handled by `Core`
    /// directly since they require the transaction monitor's FIFO.
    pub fn read32(&self, offset: u32) -> u32 {
        match offset {
            MSICTL => self.msictl_vector_id as u32, // trigger bit always reads 0 (self-clears on write)
            INTXCTL => self.intxctl_assert as u32,
            DMACTL => {
                (self.dma_direction_write as u32) << 4
                    | (self.dma_no_snoop as u32) << 5
                    | (self.dma_pasid_en as u32) << 6
                    | (self.dma_privileged as u32) << 7
                    | (self.dma_instruction as u32) << 8
                    | (self.dma_use_atc as u32) << 9
                    | (self.dma_addr_type.bits() as u32) << 10
            }
            DMA_OFFSET => self.dma_offset,
            DMA_BUS_ADDR_LO => self.dma_bus_addr_lo,
            DMA_BUS_ADDR_HI => self.dma_bus_addr_hi,
            DMA_LEN => self.dma_len,
            DMASTATUS => self.dma_status as u32,
            PASID_VAL => self.pasid_val & 0xF_FFFF,
            ATSCTL => {
                (self.ats_privileged as u32) << 1
                    | (self.ats_no_write as u32) << 2
                    | (self.ats_pasid_en as u32) << 3
                    | (self.ats_exec_req as u32) << 4
                    | (self.ats_in_flight as u32) << 6
                    | (self.ats_success as u32) << 7
                    | (self.ats_cacheable as u32) << 8
                    | (self.ats_invalidated as u32) << 9
            }
            ATS_ADDR_LO => self.ats_addr_lo,
            ATS_ADDR_HI => self.ats_addr_hi,
            ATS_RANGE_SIZE => self.ats_range_size,
            ATS_PERM => self.ats_perm.bits(),
            RID_CTL => self.rid_req_id as u32 | ((self.rid_valid as u32) << 31),
            TXN_CTRL => (self.txn_enable as u32) | ((self.txn_overflow as u32) << 2),
            ID => DEVICE_ID,
            _ => 0,
        }
    }

    /// Write a BAR0 DWORD honoring byte enables, RO bit protection and
    /// W1C/self-clear semantics. `TXN_TRACE`/`TXN_CTRL.clear` are
    /// intercepted by `Core` before reaching this method.
    pub fn write32(&mut self, offset: u32, value: u32, be: u8) {
        match offset {
            MSICTL => {
                let cur = self.msictl_vector_id as u32;
                let merged = apply_be(cur, value, be);
                self.msictl_vector_id = (merged & 0x7FF) as u16;
                // bit 31 (trigger) is write-only from the host's perspective:
                // capture it immediately so a following read never observes it set.
                let trigger_byte_written = be & 0b1000 != 0;
                if trigger_byte_written && (value & (1 << 31)) != 0 {
                    self.msi_pending_trigger = Some(MsiXTriggerLatch {
                        vector_id: self.msictl_vector_id,
                    });
                }
            }
            INTXCTL => {
                let cur = self.intxctl_assert as u32;
                self.intxctl_assert = apply_be(cur, value, be) & 1 != 0;
            }
            DMACTL => {
                let cur = self.read32(DMACTL);
                let merged = apply_be(cur, value, be);
                self.dma_direction_write = merged & (1 << 4) != 0;
                self.dma_no_snoop = merged & (1 << 5) != 0;
                self.dma_pasid_en = merged & (1 << 6) != 0;
                self.dma_privileged = merged & (1 << 7) != 0;
                self.dma_instruction = merged & (1 << 8) != 0;
                self.dma_use_atc = merged & (1 << 9) != 0;
                self.dma_addr_type = AddressType::from_bits(((merged >> 10) & 0b11) as u8);

                let trigger_nibble = apply_be(0, value, be & 0b1) & 0xF;
                if trigger_nibble & 0x1 != 0 {
                    self.dma_pending_trigger = Some(DmaTriggerLatch {
                        direction_write: self.dma_direction_write,
                        no_snoop: self.dma_no_snoop,
                        pasid_en: self.dma_pasid_en,
                        privileged: self.dma_privileged,
                        instruction: self.dma_instruction,
                        use_atc: self.dma_use_atc,
                        addr_type: self.dma_addr_type,
                        bus_addr: ((self.dma_bus_addr_hi as u64) << 32) | self.dma_bus_addr_lo as u64,
                        offset: self.dma_offset,
                        length: self.dma_len,
                        pasid_val: self.pasid_val,
                        rid_override: if self.rid_valid { Some(self.rid_req_id) } else { None },
                    });
                }
            }
            DMA_OFFSET => self.dma_offset = apply_be(self.dma_offset, value, be),
            DMA_BUS_ADDR_LO => self.dma_bus_addr_lo = apply_be(self.dma_bus_addr_lo, value, be),
            DMA_BUS_ADDR_HI => self.dma_bus_addr_hi = apply_be(self.dma_bus_addr_hi, value, be),
            DMA_LEN => self.dma_len = apply_be(self.dma_len, value, be),
            DMASTATUS => {
                // bits [1:0] are RO from the host; bit 2 (clear) is W1C.
                if be & 0b1 != 0 && value & (1 << 2) != 0 {
                    self.dma_status = DmaStatus::Ok;
                }
            }
            PASID_VAL => self.pasid_val = apply_be(self.pasid_val, value, be) & 0xF_FFFF,
            ATSCTL => {
                let cur = self.read32(ATSCTL);
                let merged = apply_be(cur, value, be);
                self.ats_privileged = merged & (1 << 1) != 0;
                self.ats_no_write = merged & (1 << 2) != 0;
                self.ats_pasid_en = merged & (1 << 3) != 0;
                self.ats_exec_req = merged & (1 << 4) != 0;
                // bits 6/7/8 (in_flight/success/cacheable) are RO, ignored on write.

                if be & 0b1 != 0 && value & 1 != 0 {
                    self.ats_pending_trigger = Some(AtsTriggerLatch {
                        privileged: self.ats_privileged,
                        no_write: self.ats_no_write,
                        pasid_en: self.ats_pasid_en,
                        exec_req: self.ats_exec_req,
                        bus_addr: ((self.dma_bus_addr_hi as u64) << 32) | self.dma_bus_addr_lo as u64,
                        pasid_val: self.pasid_val,
                    });
                }
                if value & (1 << 5) != 0 {
                    self.ats_pending_clear_atc = true;
                }
                if value & (1 << 9) != 0 {
                    self.ats_invalidated = false;
                }
            }
            RID_CTL => {
                let cur = self.rid_req_id as u32 | ((self.rid_valid as u32) << 31);
                let merged = apply_be(cur, value, be);
                self.rid_req_id = (merged & 0xFFFF) as u16;
                self.rid_valid = merged & (1 << 31) != 0;
            }
            TXN_CTRL => {
                if be & 0b1 != 0 {
                    self.txn_enable = value & 1 != 0;
                }
                if value & (1 << 1) != 0 {
                    self.txn_pending_clear = true;
                }
                // bit 2 (overflow) is RO.
            }
            // INTXCTL's RO siblings, ATS_ADDR_*, ATS_PERM, ID, and TXN_TRACE
            // are all read-only or monitor-owned; writes are silently dropped.
            _ => {}
        }
    }

    pub fn take_msi_trigger(&mut self) -> Option<MsiXTriggerLatch> {
        self.msi_pending_trigger.take()
    }

    pub fn take_dma_trigger(&mut self) -> Option<DmaTriggerLatch> {
        self.dma_pending_trigger.take()
    }

    pub fn take_ats_trigger(&mut self) -> Option<AtsTriggerLatch> {
        self.ats_pending_trigger.take()
    }

    pub fn take_ats_clear_atc(&mut self) -> bool {
        std::mem::replace(&mut self.ats_pending_clear_atc, false)
    }

    pub fn take_txn_clear(&mut self) -> bool {
        std::mem::replace(&mut self.txn_pending_clear, false)
    }

    pub fn txn_enable(&self) -> bool {
        self.txn_enable
    }

    pub fn set_txn_overflow(&mut self, overflow: bool) {
        self.txn_overflow = overflow;
    }

    pub fn set_dma_status(&mut self, status: DmaStatus) {
        self.dma_status = status;
    }

    pub fn dma_status(&self) -> DmaStatus {
        self.dma_status
    }

    pub fn set_ats_in_flight(&mut self, in_flight: bool) {
        self.ats_in_flight = in_flight;
    }

    pub fn ats_in_flight(&self) -> bool {
        self.ats_in_flight
    }

    pub fn set_ats_result(&mut self, success: bool, cacheable: bool) {
        self.ats_success = success;
        self.ats_cacheable = cacheable;
    }

    pub fn set_ats_translation(&mut self, addr: u64, range_size: u32, perm: AtsPerm) {
        self.ats_addr_lo = addr as u32;
        self.ats_addr_hi = (addr >> 32) as u32;
        self.ats_range_size = range_size;
        self.ats_perm = perm;
    }

    pub fn set_ats_invalidated(&mut self) {
        self.ats_invalidated = true;
    }

    pub fn rid_override(&self) -> Option<u16> {
        if self.rid_valid {
            Some(self.rid_req_id)
        } else {
            None
        }
    }

    pub fn dma_use_atc(&self) -> bool {
        self.dma_use_atc
    }
}
