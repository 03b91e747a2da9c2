//! Whole-TLP representations and the packetizer/depacketizer pure
//! functions that convert between them and the beat stream (spec.md
//! §3, §6.3, §6.4). The core's internal components build and consume
//! whole `ReqTlp`/`CplTlp`/`MsgTlp` values; only the transaction
//! monitor, PASID injector and TX arbiter operate beat-by-beat, per
//! the Open Question resolution recorded in SPEC_FULL.md.

use crate::beat::{encode_len, AddressType, Attr, CplBeat, PasidMeta, ReqBeat};
use crate::error::{CoreError, CoreResult};

/// Memory-request packet type (spec.md §6.3: request header `fmt/type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    MemoryRead,
    MemoryWrite,
    /// ATS Translation Request (spec.md §4.5). Carried through the same
    /// `ReqTlp`/beat envelope as ordinary memory requests since this
    /// model does not distinguish wire-level `fmt/type` encodings beyond
    /// read vs. write (see SPEC_FULL.md Open Question #6).
    AtsTranslationRequest,
}

/// A whole Memory Read or Memory Write request TLP.
#[derive(Debug, Clone, PartialEq)]
pub struct ReqTlp {
    pub kind: PacketType,
    pub adr: u64,
    /// DWORD count, already in the `0 == 1024` wire encoding.
    pub len: u16,
    pub tag: u8,
    pub req_id: u16,
    pub first_be: u8,
    pub last_be: u8,
    pub attr: Attr,
    pub at: AddressType,
    pub pasid: PasidMeta,
    /// One-hot BAR indicator; only meaningful on RX (spec.md §3).
    pub bar_hit: u8,
    /// Write data, one DWORD per beat. Empty for reads.
    pub payload: Vec<u32>,
}

impl ReqTlp {
    pub fn we(&self) -> bool {
        self.kind == PacketType::MemoryWrite
    }
}

/// A whole completion TLP.
#[derive(Debug, Clone, PartialEq)]
pub struct CplTlp {
    pub cmp_id: u16,
    pub req_id: u16,
    pub tag: u8,
    pub err: bool,
    pub lower_addr: u8,
    /// Read data, one DWORD per beat. Empty for a zero-length or UR completion.
    pub payload: Vec<u32>,
}

/// A raw Message TLP (spec.md §4.6: ATS Invalidation Request/Completion).
/// Message TLPs bypass the packetizer/injector path entirely and are
/// carried to the TX arbiter as a raw source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgTlp {
    pub code: u8,
    pub req_id: u16,
    pub tag: u8,
    pub dw: [u32; 4],
}

impl MsgTlp {
    /// Build the exact ATS Invalidation Completion header from spec.md §4.6:
    /// `fmt=0b001, type=0b10010`, DW0 `(fmt<<29)|(type<<24)`,
    /// DW1 `(req_id<<16)|(tag<<8)|0x02`, DW2/3 reserved.
    pub fn ats_invalidation_completion(req_id: u16, tag: u8) -> Self {
        const FMT: u32 = 0b001;
        const TYPE: u32 = 0b10010;
        let dw0 = (FMT << 29) | (TYPE << 24);
        let dw1 = ((req_id as u32) << 16) | ((tag as u32) << 8) | 0x02;
        MsgTlp {
            code: 0x02,
            req_id,
            tag,
            dw: [dw0, dw1, 0, 0],
        }
    }
}

#[derive(Debug, Clone)]
pub enum Tlp {
    Req(ReqTlp),
    Cpl(CplTlp),
    Msg(MsgTlp),
}

/// Convenient builder for assembling a request TLP field-by-field.
#[derive(Debug, Default)]
pub struct ReqTlpBuilder {
    kind: Option<PacketType>,
    adr: u64,
    tag: u8,
    req_id: u16,
    first_be: u8,
    last_be: u8,
    attr: Attr,
    at: AddressType,
    pasid: PasidMeta,
    bar_hit: u8,
    payload: Vec<u32>,
    len_hint: u32,
}

impl Default for AddressType {
    fn default() -> Self {
        AddressType::Default
    }
}

impl ReqTlpBuilder {
    pub fn memory_read(adr: u64, len_dwords: u32) -> Self {
        ReqTlpBuilder {
            kind: Some(PacketType::MemoryRead),
            adr,
            first_be: 0xF,
            last_be: if len_dwords > 1 { 0xF } else { 0x0 },
            ..Default::default()
        }
        .with_len(len_dwords)
    }

    pub fn memory_write(adr: u64, payload: Vec<u32>) -> Self {
        let len = payload.len() as u32;
        ReqTlpBuilder {
            kind: Some(PacketType::MemoryWrite),
            adr,
            first_be: 0xF,
            last_be: if len > 1 { 0xF } else { 0x0 },
            payload,
            ..Default::default()
        }
        .with_len(len)
    }

    fn with_len(mut self, _len_dwords: u32) -> Self {
        // length is derived at build() time from payload/explicit len field
        // kept separate so callers can override first_be/last_be afterwards.
        self.len_hint = _len_dwords;
        self
    }

    pub fn tag(mut self, tag: u8) -> Self {
        self.tag = tag;
        self
    }

    pub fn req_id(mut self, req_id: u16) -> Self {
        self.req_id = req_id;
        self
    }

    pub fn first_be(mut self, be: u8) -> Self {
        self.first_be = be;
        self
    }

    pub fn last_be(mut self, be: u8) -> Self {
        self.last_be = be;
        self
    }

    pub fn attr(mut self, attr: Attr) -> Self {
        self.attr = attr;
        self
    }

    pub fn at(mut self, at: AddressType) -> Self {
        self.at = at;
        self
    }

    pub fn pasid(mut self, pasid: PasidMeta) -> Self {
        self.pasid = pasid;
        self
    }

    pub fn bar_hit(mut self, bar_hit: u8) -> Self {
        self.bar_hit = bar_hit;
        self
    }

    pub fn build(self) -> ReqTlp {
        ReqTlp {
            kind: self.kind.expect("ReqTlpBuilder requires a packet kind"),
            adr: self.adr,
            len: encode_len(self.len_hint),
            tag: self.tag,
            req_id: self.req_id,
            first_be: self.first_be,
            last_be: self.last_be,
            attr: self.attr,
            at: self.at,
            pasid: self.pasid,
            bar_hit: self.bar_hit,
            payload: self.payload,
        }
    }
}

/// Split a whole request TLP into its beat stream (spec.md §6.4 packetizer).
///
/// A header-only request (a read, or a degenerate zero-payload write)
/// produces exactly one beat. A write with N payload DWORDs produces N
/// beats, one DWORD of payload per beat, with the same header metadata
/// replicated on every beat (the stream "side-channel" model spec.md §3
/// describes).
pub fn packetize_req(t: &ReqTlp) -> Vec<ReqBeat> {
    let template = |dat: u32, first: bool, last: bool| ReqBeat {
        we: t.we(),
        adr: t.adr,
        len: t.len,
        tag: t.tag,
        req_id: t.req_id,
        first_be: t.first_be,
        last_be: t.last_be,
        dat,
        be: if t.we() { 0xF } else { 0x0 },
        bar_hit: t.bar_hit,
        attr: t.attr,
        at: t.at,
        pasid: t.pasid,
        first,
        last,
    };

    if t.payload.is_empty() {
        return vec![template(0, true, true)];
    }

    let n = t.payload.len();
    t.payload
        .iter()
        .enumerate()
        .map(|(i, &dw)| template(dw, i == 0, i == n - 1))
        .collect()
}

/// Split a whole completion TLP into its beat stream.
pub fn packetize_cpl(t: &CplTlp) -> Vec<CplBeat> {
    let template = |dat: u32, rem: u16, first: bool, last: bool| CplBeat {
        cmp_id: t.cmp_id,
        req_id: t.req_id,
        tag: t.tag,
        dat,
        end: last,
        err: t.err,
        len_remaining: rem,
        first,
        last,
    };

    if t.payload.is_empty() {
        return vec![template(0, 0, true, true)];
    }

    let n = t.payload.len();
    t.payload
        .iter()
        .enumerate()
        .map(|(i, &dw)| template(dw, (n - 1 - i) as u16, i == 0, i == n - 1))
        .collect()
}

/// Reassemble a whole request TLP from a contiguous, in-order beat run
/// (spec.md §6.4 depacketizer). Returns an error if the run does not
/// start with `first=1` or is empty, per the TLP-atomicity contract
/// the dispatcher depends on (spec.md §8 I2).
pub fn depacketize_req(beats: &[ReqBeat]) -> CoreResult<ReqTlp> {
    let first = beats
        .first()
        .ok_or(CoreError::EmptyTlp)?;
    if !first.first {
        return Err(CoreError::MissingFirstBeat("depacketize_req"));
    }

    let kind = if first.we {
        PacketType::MemoryWrite
    } else {
        PacketType::MemoryRead
    };

    let payload = if first.we {
        beats.iter().map(|b| b.dat).collect()
    } else {
        Vec::new()
    };

    Ok(ReqTlp {
        kind,
        adr: first.adr,
        len: first.len,
        tag: first.tag,
        req_id: first.req_id,
        first_be: first.first_be,
        last_be: first.last_be,
        attr: first.attr,
        at: first.at,
        pasid: first.pasid,
        bar_hit: first.bar_hit,
        payload,
    })
}
