//! DMA engine (spec.md §4.4) — the most intricate component. Splits a
//! host-triggered transfer into MPS/MRRS-bounded chunks, resolves each
//! chunk's address through the ATC when `use_atc=1`, and tracks
//! in-flight read completions by tag with a per-request timeout.

use std::collections::HashMap;

use log::{debug, trace, warn};

use crate::atc::Atc;
use crate::beat::{encode_len, AddressType, Attr, PasidMeta};
use crate::config::ConfigSpaceView;
use crate::dma_buffer::PortA;
use crate::regs::{DmaStatus, DmaTriggerLatch, RegisterFile};
use crate::tlp::{CplTlp, PacketType, ReqTlp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaState {
    Idle,
    Setup,
    IssueRd,
    WaitCpl,
    LoadData,
    IssueWr,
    Complete,
}

/// Default per-request read-completion timeout, expressed in model
/// ticks (spec.md §4.4 "default: 1ms ... model-defined in simulated
/// ticks" — see SPEC_FULL.md Open Question #5).
pub const DEFAULT_TIMEOUT_TICKS: u32 = 1_000;

#[derive(Debug)]
struct PendingRead {
    buffer_offset: usize,
    bytes_written: usize,
    expected_bytes: usize,
    ticks_left: u32,
}

#[derive(Debug)]
pub struct DmaEngine {
    state: DmaState,
    latched: Option<DmaTriggerLatch>,
    length_remaining: u32,
    cur_bus_addr: u64,
    cur_buf_offset: u32,
    next_tag: u8,
    pending: HashMap<u8, PendingRead>,
    failed_internal: bool,
    range_error: bool,
    timeout_ticks: u32,
    port_a: PortA,
    endpoint_id: u16,
}

/// Computes DWORD count + byte enables for a (possibly misaligned)
/// byte range, per conventional PCIe requester encoding: the first
/// DWORD's enables cover the bytes from the start offset to the
/// DWORD boundary, the last DWORD's enables cover the remaining
/// trailing bytes, and every DWORD in between is fully enabled. This
/// always produces a valid encoding for any in-bounds byte range, so
/// (per DESIGN.md) the "cannot encode" Range-error clause in spec.md
/// §4.4 never triggers in this model.
fn byte_enables(start_addr: u64, length_bytes: u32) -> (u32, u8, u8) {
    if length_bytes == 0 {
        return (0, 0, 0);
    }
    let start_off = (start_addr & 0x3) as u32;
    let first_dword_bytes = (4 - start_off).min(length_bytes);

    if length_bytes <= first_dword_bytes {
        let mut fb = 0u8;
        for i in start_off..start_off + length_bytes {
            fb |= 1 << i;
        }
        return (1, fb, 0);
    }

    let mut first_be = 0u8;
    for i in start_off..4 {
        first_be |= 1 << i;
    }
    let remaining_after_first = length_bytes - first_dword_bytes;
    let last_dword_bytes = if remaining_after_first % 4 == 0 {
        4
    } else {
        remaining_after_first % 4
    };
    let mut last_be = 0u8;
    for i in 0..last_dword_bytes {
        last_be |= 1 << i;
    }
    let dword_count = 1 + (remaining_after_first + 3) / 4;
    (dword_count, first_be, last_be)
}

impl DmaEngine {
    pub fn new(port_a: PortA, endpoint_id: u16) -> Self {
        DmaEngine {
            state: DmaState::Idle,
            latched: None,
            length_remaining: 0,
            cur_bus_addr: 0,
            cur_buf_offset: 0,
            next_tag: 0,
            pending: HashMap::new(),
            failed_internal: false,
            range_error: false,
            timeout_ticks: DEFAULT_TIMEOUT_TICKS,
            port_a,
            endpoint_id,
        }
    }

    pub fn with_timeout_ticks(mut self, ticks: u32) -> Self {
        self.timeout_ticks = ticks;
        self
    }

    pub fn state(&self) -> DmaState {
        self.state
    }

    /// The bus-address range this transfer still has outstanding,
    /// consulted by the invalidation handler so it can wait for a
    /// racing DMA transfer before invalidating the same range
    /// (spec.md §4.6).
    pub fn in_flight_range(&self) -> Option<(u64, u64)> {
        if matches!(self.state, DmaState::Idle | DmaState::Complete) {
            return None;
        }
        self.latched
            .as_ref()
            .map(|l| (l.bus_addr, l.length as u64))
    }

    /// Whether the in-flight transfer (if any) is using the ATC for
    /// address translation, consulted by the invalidation handler
    /// (spec.md §4.6: "DMA engine is busy AND has use_atc=1").
    pub fn uses_atc(&self) -> bool {
        !matches!(self.state, DmaState::Idle | DmaState::Complete)
            && self.latched.as_ref().map(|l| l.use_atc).unwrap_or(false)
    }

    fn alloc_tag(&mut self) -> u8 {
        let t = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(1);
        t
    }

    fn req_id(&self) -> u16 {
        self.latched
            .as_ref()
            .and_then(|l| l.rid_override)
            .unwrap_or(self.endpoint_id)
    }

    /// Accept a pending `DMACTL` trigger, validating range and the
    /// `use_atc & addr_type=Translated` conflict before committing to
    /// the transfer (spec.md §4.4, §7).
    pub fn accept_trigger(&mut self, regs: &mut RegisterFile, latch: DmaTriggerLatch) {
        debug!("dma engine accepting trigger: {:?}", latch);
        self.pending.clear();
        self.failed_internal = false;
        self.range_error = false;

        if latch.use_atc && latch.addr_type == AddressType::Translated {
            warn!("dma trigger combined use_atc=1 with addr_type=Translated");
            self.failed_internal = true;
            regs.set_dma_status(DmaStatus::Internal);
            self.state = DmaState::Complete;
            self.latched = Some(latch);
            return;
        }

        if latch.offset as u64 + latch.length as u64 > self.port_a.len() as u64 {
            warn!(
                "dma range error: offset {} + length {} exceeds buffer {}",
                latch.offset,
                latch.length,
                self.port_a.len()
            );
            self.range_error = true;
            regs.set_dma_status(DmaStatus::Range);
            self.state = DmaState::Complete;
            self.latched = Some(latch);
            return;
        }

        self.cur_bus_addr = latch.bus_addr;
        self.cur_buf_offset = latch.offset;
        self.length_remaining = latch.length;
        self.latched = Some(latch);

        if latch.length == 0 {
            // B1: zero-length transfer completes immediately with no TLPs.
            regs.set_dma_status(DmaStatus::Ok);
            self.state = DmaState::Complete;
            return;
        }

        self.state = if latch.direction_write {
            DmaState::LoadData
        } else {
            DmaState::IssueRd
        };
    }

    fn pasid_meta(&self, latch: &DmaTriggerLatch) -> PasidMeta {
        PasidMeta {
            pasid_en: latch.pasid_en,
            pasid_val: latch.pasid_val,
            privileged: latch.privileged,
            execute: latch.instruction,
        }
    }

    fn effective_adr(&self, atc: &Atc, latch: &DmaTriggerLatch, addr: u64) -> u64 {
        if !latch.use_atc {
            return addr;
        }
        match atc.lookup(addr, latch.pasid_en, latch.pasid_val) {
            Some(hit) => hit.output_addr,
            None => addr,
        }
    }

    /// Advance the engine by one tick, consuming pending triggers from
    /// `regs`, emitting at most one outbound request TLP, and reporting
    /// status once COMPLETE is reached.
    pub fn tick(
        &mut self,
        regs: &mut RegisterFile,
        atc: &Atc,
        cfg: &dyn ConfigSpaceView,
    ) -> Option<ReqTlp> {
        if self.state == DmaState::Idle {
            if let Some(latch) = regs.take_dma_trigger() {
                self.accept_trigger(regs, latch);
            }
        }

        // Timeout bookkeeping: one tick of simulated time elapses per call.
        let mut timed_out = false;
        for p in self.pending.values_mut() {
            if p.ticks_left == 0 {
                timed_out = true;
            } else {
                p.ticks_left -= 1;
            }
        }
        if timed_out {
            warn!("dma read completion timed out; discarding stale tags");
            self.pending.clear();
            self.failed_internal = true;
            self.state = DmaState::Complete;
        }

        match self.state {
            DmaState::Idle => None,
            DmaState::Setup => None,
            DmaState::IssueRd => self.issue_read_chunk(regs, atc, cfg),
            DmaState::WaitCpl => {
                if self.pending.is_empty() {
                    trace!("dma read transfer complete, all tags resolved");
                    self.state = DmaState::Complete;
                }
                None
            }
            DmaState::LoadData => {
                self.state = DmaState::IssueWr;
                None
            }
            DmaState::IssueWr => self.issue_write_chunk(regs, atc, cfg),
            DmaState::Complete => {
                let status = if self.failed_internal {
                    DmaStatus::Internal
                } else if self.range_error {
                    DmaStatus::Range
                } else {
                    DmaStatus::Ok
                };
                regs.set_dma_status(status);
                self.state = DmaState::Idle;
                self.latched = None;
                None
            }
        }
    }

    fn chunk_len(&self, cfg_limit: u16) -> u32 {
        self.length_remaining.min(cfg_limit.max(4) as u32)
    }

    fn issue_read_chunk(
        &mut self,
        regs: &mut RegisterFile,
        atc: &Atc,
        cfg: &dyn ConfigSpaceView,
    ) -> Option<ReqTlp> {
        let latch = *self.latched.as_ref()?;
        if self.length_remaining == 0 {
            self.state = if self.pending.is_empty() {
                DmaState::Complete
            } else {
                DmaState::WaitCpl
            };
            return None;
        }

        let chunk_bytes = self.chunk_len(cfg.max_request_size());
        let (dwords, first_be, last_be) = byte_enables(self.cur_bus_addr, chunk_bytes);
        let tag = self.alloc_tag();
        let adr = self.effective_adr(atc, &latch, self.cur_bus_addr);

        let tlp = ReqTlp {
            kind: PacketType::MemoryRead,
            adr,
            len: encode_len(dwords),
            tag,
            req_id: self.req_id(),
            first_be,
            last_be,
            attr: Attr {
                no_snoop: latch.no_snoop,
                relaxed_ordering: false,
                ido: false,
            },
            at: latch.addr_type,
            pasid: self.pasid_meta(&latch),
            bar_hit: 0,
            payload: Vec::new(),
        };

        self.pending.insert(
            tag,
            PendingRead {
                buffer_offset: self.cur_buf_offset as usize,
                bytes_written: 0,
                expected_bytes: chunk_bytes as usize,
                ticks_left: self.timeout_ticks,
            },
        );

        self.cur_bus_addr += chunk_bytes as u64;
        self.cur_buf_offset += chunk_bytes;
        self.length_remaining -= chunk_bytes;

        if self.length_remaining == 0 {
            self.state = DmaState::WaitCpl;
        }
        let _ = regs;
        Some(tlp)
    }

    fn issue_write_chunk(
        &mut self,
        _regs: &mut RegisterFile,
        atc: &Atc,
        cfg: &dyn ConfigSpaceView,
    ) -> Option<ReqTlp> {
        let latch = *self.latched.as_ref()?;
        if self.length_remaining == 0 {
            self.state = DmaState::Complete;
            return None;
        }

        let chunk_bytes = self.chunk_len(cfg.max_payload_size());
        let (_, first_be, last_be) = byte_enables(self.cur_bus_addr, chunk_bytes);
        let tag = self.alloc_tag();
        let adr = self.effective_adr(atc, &latch, self.cur_bus_addr);

        let bytes = self.port_a.read_bytes(self.cur_buf_offset as usize, chunk_bytes as usize);
        let payload: Vec<u32> = bytes
            .chunks(4)
            .map(|c| {
                let mut b = [0u8; 4];
                b[..c.len()].copy_from_slice(c);
                u32::from_le_bytes(b)
            })
            .collect();

        let tlp = ReqTlp {
            kind: PacketType::MemoryWrite,
            adr,
            len: encode_len(payload.len() as u32),
            tag,
            req_id: self.req_id(),
            first_be,
            last_be,
            attr: Attr {
                no_snoop: latch.no_snoop,
                relaxed_ordering: false,
                ido: false,
            },
            at: latch.addr_type,
            pasid: self.pasid_meta(&latch),
            bar_hit: 0,
            payload,
        };

        self.cur_bus_addr += chunk_bytes as u64;
        self.cur_buf_offset += chunk_bytes;
        self.length_remaining -= chunk_bytes;

        if self.length_remaining == 0 {
            self.state = DmaState::Complete;
        }
        Some(tlp)
    }

    /// Whether this engine has a read chunk outstanding under `tag`,
    /// used by `Core` to route an inbound completion to the right
    /// engine when the DMA and ATS tag spaces can otherwise collide.
    pub fn has_pending_tag(&self, tag: u8) -> bool {
        self.pending.contains_key(&tag)
    }

    /// Consume an inbound read completion (spec.md §4.4 read path).
    /// Completions may arrive out of order across tags; within a tag
    /// they are expected in order (the external collaborator's
    /// contract, spec.md §5 ordering guarantee 3).
    pub fn on_completion(&mut self, cpl: &CplTlp) {
        let Some(pending) = self.pending.get_mut(&cpl.tag) else {
            trace!("dma engine dropping completion for unknown/stale tag {}", cpl.tag);
            return;
        };

        if cpl.err {
            warn!("dma read completion carried err=1 for tag {}", cpl.tag);
            self.failed_internal = true;
            self.pending.remove(&cpl.tag);
            return;
        }

        for &dw in &cpl.payload {
            if pending.bytes_written < pending.expected_bytes {
                self.port_a
                    .write_dword(pending.buffer_offset + pending.bytes_written, dw);
                pending.bytes_written += 4;
            }
        }

        if pending.bytes_written >= pending.expected_bytes {
            self.pending.remove(&cpl.tag);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExerciserConfig;
    use crate::dma_buffer::DmaBuffer;
    use crate::regs::{self, DmaTriggerLatch};

    fn latch(direction_write: bool, bus_addr: u64, offset: u32, length: u32) -> DmaTriggerLatch {
        DmaTriggerLatch {
            direction_write,
            no_snoop: false,
            pasid_en: false,
            privileged: false,
            instruction: false,
            use_atc: false,
            addr_type: AddressType::Default,
            bus_addr,
            offset,
            length,
            pasid_val: 0,
            rid_override: None,
        }
    }

    #[test]
    fn zero_length_completes_immediately_with_no_tlp() {
        let buf = DmaBuffer::new(4096);
        let mut engine = DmaEngine::new(buf.port_a(), 0x0100);
        let mut regs = RegisterFile::new();
        let atc = Atc::new();
        let cfg = ExerciserConfig::default();

        engine.accept_trigger(&mut regs, latch(true, 0x1000, 0, 0));
        assert!(engine.tick(&mut regs, &atc, &cfg).is_none());
        assert_eq!(regs.dma_status(), DmaStatus::Ok);
    }

    #[test]
    fn range_error_emits_no_tlps() {
        let buf = DmaBuffer::new(64);
        let mut engine = DmaEngine::new(buf.port_a(), 0x0100);
        let mut regs = RegisterFile::new();
        let atc = Atc::new();
        let cfg = ExerciserConfig::default();

        engine.accept_trigger(&mut regs, latch(true, 0x1000, 0, 128));
        assert!(engine.tick(&mut regs, &atc, &cfg).is_none());
        assert_eq!(regs.dma_status(), DmaStatus::Range);
    }

    #[test]
    fn write_128_bytes_one_chunk_within_mps() {
        let buf = DmaBuffer::new(4096);
        buf.port_a().write_bytes_test_helper(0, &[0xAA; 128]);
        let mut engine = DmaEngine::new(buf.port_a(), 0x0100);
        let mut regs = RegisterFile::new();
        let atc = Atc::new();
        let cfg = ExerciserConfig {
            max_payload_size: 256,
            ..Default::default()
        };

        engine.accept_trigger(&mut regs, latch(true, 0x1_0000_0000, 0, 128));
        assert!(engine.tick(&mut regs, &atc, &cfg).is_none()); // LoadData
        let tlp = engine.tick(&mut regs, &atc, &cfg).unwrap(); // IssueWr
        assert_eq!(tlp.adr, 0x1_0000_0000);
        assert_eq!(tlp.payload.len(), 32); // 128 bytes / 4
        assert!(tlp.we());
        assert!(tlp.payload.iter().all(|&dw| dw == 0xAAAA_AAAA));

        assert!(engine.tick(&mut regs, &atc, &cfg).is_none());
        assert_eq!(regs.dma_status(), DmaStatus::Ok);
    }

    #[test]
    fn read_completes_on_full_completion() {
        let buf = DmaBuffer::new(4096);
        let mut engine = DmaEngine::new(buf.port_a(), 0x0100);
        let mut regs = RegisterFile::new();
        let atc = Atc::new();
        let cfg = ExerciserConfig::default();

        engine.accept_trigger(&mut regs, latch(false, 0x2_0000_0000, 0x100, 64));
        let tlp = engine.tick(&mut regs, &atc, &cfg).unwrap();
        assert!(!tlp.we());
        assert_eq!(tlp.len, 16);

        let cpl = CplTlp {
            cmp_id: 0,
            req_id: tlp.req_id,
            tag: tlp.tag,
            err: false,
            lower_addr: 0,
            payload: vec![0x1111_1111; 16],
        };
        engine.on_completion(&cpl);
        engine.tick(&mut regs, &atc, &cfg);
        assert_eq!(regs.dma_status(), DmaStatus::Ok);
        assert_eq!(buf.port_a().read_dword(0x100), 0x1111_1111);
    }

    #[test]
    fn use_atc_with_translated_addr_type_is_internal_error() {
        let buf = DmaBuffer::new(4096);
        let mut engine = DmaEngine::new(buf.port_a(), 0x0100);
        let mut regs = RegisterFile::new();
        let mut l = latch(false, 0x1000, 0, 16);
        l.use_atc = true;
        l.addr_type = AddressType::Translated;
        engine.accept_trigger(&mut regs, l);
        assert_eq!(regs.dma_status(), DmaStatus::Internal);
    }

    #[test]
    fn success_clears_a_stale_status_left_by_a_prior_failed_transfer() {
        let buf = DmaBuffer::new(64);
        let mut engine = DmaEngine::new(buf.port_a(), 0x0100);
        let mut regs = RegisterFile::new();
        let atc = Atc::new();
        let cfg = ExerciserConfig::default();

        // Transfer A: out-of-range, leaves DMASTATUS = Range.
        engine.accept_trigger(&mut regs, latch(true, 0x1000, 0, 128));
        engine.tick(&mut regs, &atc, &cfg);
        assert_eq!(regs.dma_status(), DmaStatus::Range);

        // Transfer B: valid and in-range, completes normally.
        engine.accept_trigger(&mut regs, latch(true, 0x1_0000_0000, 0, 16));
        assert!(engine.tick(&mut regs, &atc, &cfg).is_none()); // LoadData
        let tlp = engine.tick(&mut regs, &atc, &cfg).unwrap(); // IssueWr
        assert!(tlp.we());
        assert!(engine.tick(&mut regs, &atc, &cfg).is_none()); // Complete
        assert_eq!(regs.dma_status(), DmaStatus::Ok);
    }

    #[test]
    fn max_dma_len_encoded_as_zero_dwords_on_1024_dw_chunk() {
        assert_eq!(encode_len(1024), 0);
    }

    #[test]
    fn rid_override_applies_to_emitted_requests() {
        let buf = DmaBuffer::new(4096);
        let mut engine = DmaEngine::new(buf.port_a(), 0x0100);
        let mut regs = RegisterFile::new();
        let atc = Atc::new();
        let cfg = ExerciserConfig::default();
        let mut l = latch(true, 0x1000, 0, 4);
        l.rid_override = Some(0xBEEF);
        engine.accept_trigger(&mut regs, l);
        assert!(engine.tick(&mut regs, &atc, &cfg).is_none()); // LoadData
        let tlp = engine.tick(&mut regs, &atc, &cfg).unwrap(); // IssueWr
        assert_eq!(tlp.req_id, 0xBEEF);
    }

    // Helper used only by tests in this module; DmaBuffer's real write
    // path is always through PortB (byte-enabled), but these tests seed
    // buffer contents directly for convenience.
    trait PortATestHelper {
        fn write_bytes_test_helper(&self, offset: usize, data: &[u8]);
    }
    impl PortATestHelper for PortA {
        fn write_bytes_test_helper(&self, offset: usize, data: &[u8]) {
            for (i, chunk) in data.chunks(4).enumerate() {
                let mut b = [0u8; 4];
                b[..chunk.len()].copy_from_slice(chunk);
                self.write_dword(offset + i * 4, u32::from_le_bytes(b));
            }
        }
    }
}
