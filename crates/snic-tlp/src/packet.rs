//! TLP framing.
//!
//! Every datagram starts with a 6-byte encapsulation header (sequence and
//! adapter timestamp, both big-endian) followed by one TLP. Header fields
//! are big-endian; payloads are raw bytes. Memory requests use a 3-dword
//! header for 32-bit addresses and a 4-dword header above 4 GiB. Sub-dword
//! precision is carried by the first/last byte-enable nibbles, exactly as
//! on a real link.

use crate::TlpError;

/// Encapsulation header size.
pub const ENCAP_SIZE: usize = 6;

/// fmt/type bytes.
const FMT_TYPE_MRD_3DW: u8 = 0x00;
const FMT_TYPE_MRD_4DW: u8 = 0x20;
const FMT_TYPE_MWR_3DW: u8 = 0x40;
const FMT_TYPE_MWR_4DW: u8 = 0x60;
const FMT_TYPE_CPL: u8 = 0x0a;
const FMT_TYPE_CPLD: u8 = 0x4a;

/// Completion status codes (3-bit field).
pub const CPL_STATUS_SC: u8 = 0;
pub const CPL_STATUS_UR: u8 = 1;
pub const CPL_STATUS_CA: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Encap {
    pub seq: u16,
    /// Hardware timestamp; zero when the sender is software.
    pub tstamp: u32,
}

/// A byte-precise memory request (the dword address and byte enables of
/// the wire form are folded together).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRequest {
    pub requester: u16,
    pub tag: u8,
    pub addr: u64,
    pub len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub completer: u16,
    pub requester: u16,
    pub tag: u8,
    pub status: u8,
    /// Bytes remaining in the transaction, this completion included.
    pub byte_count: u16,
    /// Low 7 bits of the address of the first byte in this completion.
    pub lower_addr: u8,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Tlp<'a> {
    MemWrite { req: MemRequest, payload: &'a [u8] },
    MemRead { req: MemRequest },
    /// A completion; `payload` is empty for Cpl without data.
    Completion { cpl: Completion, payload: &'a [u8] },
}

/// Splits a byte-precise request into dword count and byte-enable nibbles.
fn byte_enables(addr: u64, len: usize) -> (u16, u8, u8) {
    debug_assert!(len > 0);
    let off = (addr & 3) as usize;
    let end = off + len;
    let ndw = end.div_ceil(4);
    if ndw == 1 {
        let first = (((1u16 << len) - 1) << off) as u8;
        (1, first, 0)
    } else {
        let first = (0xfu8 << off) & 0xf; // bits off..=3
        let rem = end % 4;
        let last = if rem == 0 { 0xf } else { (1u8 << rem) - 1 };
        (ndw as u16, first, last)
    }
}

/// Recovers the byte-precise offset and length from the wire form.
fn precise_len(ndw: usize, first_be: u8, last_be: u8) -> Result<(usize, usize), TlpError> {
    if first_be == 0 || first_be > 0xf || last_be > 0xf {
        return Err(TlpError::Malformed("byte enables"));
    }
    let head = first_be.trailing_zeros() as usize;
    if ndw == 1 {
        if last_be != 0 {
            return Err(TlpError::Malformed("last BE set on single-dword request"));
        }
        let hi = 7 - first_be.leading_zeros() as usize;
        Ok((head, hi - head + 1))
    } else {
        if last_be == 0 {
            return Err(TlpError::Malformed("last BE clear on multi-dword request"));
        }
        let tail = 3 - (7 - last_be.leading_zeros() as usize);
        Ok((head, ndw * 4 - head - tail))
    }
}

/// The 10-bit length field; 1024 dwords is encoded as zero.
fn encode_len_dw(ndw: u16) -> u16 {
    ndw & 0x3ff
}

fn decode_len_dw(field: u16) -> usize {
    if field == 0 {
        1024
    } else {
        field as usize
    }
}

fn push_encap(out: &mut Vec<u8>, seq: u16) {
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
}

fn push_mem_header(out: &mut Vec<u8>, data: bool, req: &MemRequest, ndw: u16, first: u8, last: u8) {
    let four_dw = req.addr > u32::MAX as u64;
    let fmt_type = match (data, four_dw) {
        (false, false) => FMT_TYPE_MRD_3DW,
        (false, true) => FMT_TYPE_MRD_4DW,
        (true, false) => FMT_TYPE_MWR_3DW,
        (true, true) => FMT_TYPE_MWR_4DW,
    };
    out.push(fmt_type);
    out.push(0);
    out.extend_from_slice(&encode_len_dw(ndw).to_be_bytes());
    out.extend_from_slice(&req.requester.to_be_bytes());
    out.push(req.tag);
    out.push(last << 4 | first);
    let dw_addr = req.addr & !3;
    if four_dw {
        out.extend_from_slice(&((dw_addr >> 32) as u32).to_be_bytes());
        out.extend_from_slice(&(dw_addr as u32).to_be_bytes());
    } else {
        out.extend_from_slice(&(dw_addr as u32).to_be_bytes());
    }
}

/// Builds a Memory Read request.
pub fn build_mrd(seq: u16, req: &MemRequest) -> Vec<u8> {
    let (ndw, first, last) = byte_enables(req.addr, req.len);
    let mut out = Vec::with_capacity(ENCAP_SIZE + 16);
    push_encap(&mut out, seq);
    push_mem_header(&mut out, false, req, ndw, first, last);
    out
}

/// Builds a Memory Write carrying `payload` at the request's address.
pub fn build_mwr(seq: u16, req: &MemRequest, payload: &[u8]) -> Vec<u8> {
    debug_assert_eq!(req.len, payload.len());
    let (ndw, first, last) = byte_enables(req.addr, req.len);
    let head = (req.addr & 3) as usize;
    let mut out = Vec::with_capacity(ENCAP_SIZE + 16 + ndw as usize * 4);
    push_encap(&mut out, seq);
    push_mem_header(&mut out, true, req, ndw, first, last);
    // Disabled bytes in the first and last dword go out as zeros.
    out.extend_from_slice(&[0u8; 4][..head]);
    out.extend_from_slice(payload);
    let tail = ndw as usize * 4 - head - payload.len();
    out.extend_from_slice(&[0u8; 4][..tail]);
    out
}

/// Builds a completion-with-data for a read. `lower_addr` is the low 7 bits
/// of the first byte's address; `byte_count` counts the bytes remaining in
/// the transaction including `data`.
pub fn build_cpld(
    seq: u16,
    cpl: &Completion,
    data: &[u8],
) -> Vec<u8> {
    let head = (cpl.lower_addr & 3) as usize;
    let ndw = (head + data.len()).div_ceil(4);
    let mut out = Vec::with_capacity(ENCAP_SIZE + 12 + ndw * 4);
    push_encap(&mut out, seq);
    out.push(FMT_TYPE_CPLD);
    out.push(0);
    out.extend_from_slice(&encode_len_dw(ndw as u16).to_be_bytes());
    out.extend_from_slice(&cpl.completer.to_be_bytes());
    out.push(cpl.status << 5 | ((cpl.byte_count >> 8) & 0xf) as u8);
    out.push((cpl.byte_count & 0xff) as u8);
    out.extend_from_slice(&cpl.requester.to_be_bytes());
    out.push(cpl.tag);
    out.push(cpl.lower_addr & 0x7f);
    out.extend_from_slice(&[0u8; 4][..head]);
    out.extend_from_slice(data);
    let tail = ndw * 4 - head - data.len();
    out.extend_from_slice(&[0u8; 4][..tail]);
    out
}

/// Builds a completion without data (error completions).
pub fn build_cpl(seq: u16, cpl: &Completion) -> Vec<u8> {
    let mut out = Vec::with_capacity(ENCAP_SIZE + 12);
    push_encap(&mut out, seq);
    out.push(FMT_TYPE_CPL);
    out.push(0);
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&cpl.completer.to_be_bytes());
    out.push(cpl.status << 5 | ((cpl.byte_count >> 8) & 0xf) as u8);
    out.push((cpl.byte_count & 0xff) as u8);
    out.extend_from_slice(&cpl.requester.to_be_bytes());
    out.push(cpl.tag);
    out.push(cpl.lower_addr & 0x7f);
    out
}

/// Parses one encapsulated TLP.
pub fn parse(buf: &[u8]) -> Result<(Encap, Tlp<'_>), TlpError> {
    if buf.len() < ENCAP_SIZE + 12 {
        return Err(TlpError::Malformed("datagram too short"));
    }
    let encap = Encap {
        seq: u16::from_be_bytes(buf[0..2].try_into().unwrap()),
        tstamp: u32::from_be_bytes(buf[2..6].try_into().unwrap()),
    };
    let tlp = &buf[ENCAP_SIZE..];
    let fmt_type = tlp[0];
    let len_dw = decode_len_dw(u16::from_be_bytes(tlp[2..4].try_into().unwrap()) & 0x3ff);
    match fmt_type {
        FMT_TYPE_MRD_3DW | FMT_TYPE_MRD_4DW | FMT_TYPE_MWR_3DW | FMT_TYPE_MWR_4DW => {
            let data = fmt_type & 0x40 != 0;
            let four_dw = fmt_type & 0x20 != 0;
            let hdr_len = if four_dw { 16 } else { 12 };
            if tlp.len() < hdr_len {
                return Err(TlpError::Malformed("truncated memory request header"));
            }
            let requester = u16::from_be_bytes(tlp[4..6].try_into().unwrap());
            let tag = tlp[6];
            let first_be = tlp[7] & 0xf;
            let last_be = tlp[7] >> 4;
            let raw_addr = if four_dw {
                (u32::from_be_bytes(tlp[8..12].try_into().unwrap()) as u64) << 32
                    | u32::from_be_bytes(tlp[12..16].try_into().unwrap()) as u64
            } else {
                u32::from_be_bytes(tlp[8..12].try_into().unwrap()) as u64
            };
            let dw_addr = raw_addr & !3;
            let (head, len) = precise_len(len_dw, first_be, last_be)?;
            let req = MemRequest {
                requester,
                tag,
                addr: dw_addr + head as u64,
                len,
            };
            if !data {
                return Ok((encap, Tlp::MemRead { req }));
            }
            let payload = tlp
                .get(hdr_len + head..hdr_len + head + len)
                .ok_or(TlpError::Malformed("truncated write payload"))?;
            Ok((encap, Tlp::MemWrite { req, payload }))
        }
        FMT_TYPE_CPL | FMT_TYPE_CPLD => {
            let cpl = Completion {
                completer: u16::from_be_bytes(tlp[4..6].try_into().unwrap()),
                status: tlp[6] >> 5,
                byte_count: u16::from(tlp[6] & 0xf) << 8 | u16::from(tlp[7]),
                requester: u16::from_be_bytes(tlp[8..10].try_into().unwrap()),
                tag: tlp[10],
                lower_addr: tlp[11] & 0x7f,
            };
            if fmt_type == FMT_TYPE_CPL {
                return Ok((encap, Tlp::Completion { cpl, payload: &[] }));
            }
            let head = (cpl.lower_addr & 3) as usize;
            let avail = tlp.len().saturating_sub(12);
            if avail < len_dw * 4 {
                return Err(TlpError::Malformed("truncated completion payload"));
            }
            // The useful bytes run from the head offset to the end of the
            // dword block, bounded by the remaining byte count (a 12-bit
            // field where zero stands for 4096).
            let remaining = if cpl.byte_count == 0 { 4096 } else { cpl.byte_count as usize };
            let len = (len_dw * 4 - head).min(remaining);
            let payload = &tlp[12 + head..12 + head + len];
            Ok((encap, Tlp::Completion { cpl, payload }))
        }
        _ => Err(TlpError::Malformed("unknown fmt/type")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_enables_cover_the_usual_shapes() {
        // Aligned doorbell write: one dword, all bytes.
        assert_eq!(byte_enables(0x1000, 4), (1, 0xf, 0));
        // Aligned descriptor read: two dwords.
        assert_eq!(byte_enables(0x2000, 8), (2, 0xf, 0xf));
        // Two bytes at offset 1 within one dword.
        assert_eq!(byte_enables(0x1001, 2), (1, 0b0110, 0));
        // Unaligned span ending mid-dword.
        assert_eq!(byte_enables(0x1002, 5), (2, 0b1100, 0b0111));
    }

    #[test]
    fn mwr_round_trips_byte_precise_addresses() {
        let req = MemRequest {
            requester: 0x1a00,
            tag: 3,
            addr: 0x0123_4572,
            len: 7,
        };
        let payload: Vec<u8> = (1..=7).collect();
        let wire = build_mwr(9, &req, &payload);
        let (encap, tlp) = parse(&wire).expect("parse");
        assert_eq!(encap.seq, 9);
        match tlp {
            Tlp::MemWrite { req: parsed, payload: p } => {
                assert_eq!(parsed, req);
                assert_eq!(p, &payload[..]);
            }
            other => panic!("expected MemWrite, got {other:?}"),
        }
    }

    #[test]
    fn requests_above_4gib_use_the_wide_header() {
        let req = MemRequest {
            requester: 0,
            tag: 0,
            addr: 0xdead_beef_cafe_bab8,
            len: 8,
        };
        let wire = build_mrd(0, &req);
        // 4DW header: encap + 16 bytes.
        assert_eq!(wire.len(), ENCAP_SIZE + 16);
        let (_, tlp) = parse(&wire).expect("parse");
        assert_eq!(tlp, Tlp::MemRead { req });
    }

    #[test]
    fn max_length_read_encodes_as_zero_dwords() {
        let req = MemRequest {
            requester: 0,
            tag: 1,
            addr: 0x1000,
            len: 4096,
        };
        let wire = build_mrd(0, &req);
        assert_eq!(u16::from_be_bytes([wire[ENCAP_SIZE + 2], wire[ENCAP_SIZE + 3]]), 0);
        let (_, tlp) = parse(&wire).expect("parse");
        assert_eq!(tlp, Tlp::MemRead { req });
    }

    #[test]
    fn cpld_payload_respects_lower_addr_and_byte_count() {
        let cpl = Completion {
            completer: 0x0100,
            requester: 0x1a00,
            tag: 5,
            status: CPL_STATUS_SC,
            byte_count: 6,
            lower_addr: 0x42,
        };
        let data = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];
        let wire = build_cpld(1, &cpl, &data);
        let (_, tlp) = parse(&wire).expect("parse");
        match tlp {
            Tlp::Completion { cpl: parsed, payload } => {
                assert_eq!(parsed, cpl);
                assert_eq!(payload, data);
            }
            other => panic!("expected Completion, got {other:?}"),
        }
    }

    #[test]
    fn error_completion_carries_no_data() {
        let cpl = Completion {
            completer: 0,
            requester: 0x1a00,
            tag: 2,
            status: CPL_STATUS_UR,
            byte_count: 0,
            lower_addr: 0,
        };
        let wire = build_cpl(0, &cpl);
        let (_, tlp) = parse(&wire).expect("parse");
        assert_eq!(tlp, Tlp::Completion { cpl, payload: &[] });
    }
}
