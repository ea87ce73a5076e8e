//! Bit-exact conversion between [`TlpHeader`] and the 8 DWORD header at the
//! start of a tdata beat.
//!
//! Power user (PU) headers follow the PCIe layout with DWORD lengths and byte
//! enables. Data mover (DM) requests carry byte lengths and byte addresses
//! split across DW0, DW1 and DW3. DM completions are not modelled.

use bitfield_struct::bitfield;

use crate::header::{
    vf_id, AddressType, Attr, CompletionFields, HeaderBody, Prefix, RequestFields, Routing,
    TlpHeader,
};
use crate::parser::{self, HDR_DWORDS};
use crate::wire::Flit;
use crate::UnknownFmtType;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("data mover {0} encoding is not supported")]
    UnsupportedEncoding(&'static str),
    #[error("{mode} header cannot carry a length of {len_bytes} bytes")]
    LengthOutOfRange { len_bytes: u32, mode: &'static str },
    #[error("{field} value {value:#x} does not fit its header field")]
    FieldOverflow { field: &'static str, value: u64 },
    #[error("{layout} header has no room for {field} {value:#x}")]
    NotCarried {
        layout: &'static str,
        field: &'static str,
        value: u64,
    },
    #[error("header body does not match fmt/type {0:#04x}")]
    BodyMismatch(u8),
    #[error(transparent)]
    UnknownFmtType(#[from] UnknownFmtType),
    #[error("tdata is narrower than a TLP header")]
    Truncated,
}

#[bitfield(u32)]
struct Dw0 {
    #[bits(10)]
    length: u16,
    #[bits(2)]
    at: u8,
    #[bits(2)]
    _attr_lo: u8,
    ep: bool,
    td: bool,
    th: bool,
    ln: bool,
    _attr_hi: bool,
    tag_m: bool,
    #[bits(3)]
    _tc: u8,
    tag_h: bool,
    fmt_type: u8,
}

#[bitfield(u32)]
struct PuReqDw1 {
    #[bits(4)]
    first_dw_be: u8,
    #[bits(4)]
    last_dw_be: u8,
    tag_l: u8,
    req_id: u16,
}

#[bitfield(u32)]
struct DmReqDw1 {
    _rsvd: u8,
    tag_l: u8,
    #[bits(2)]
    length_l: u8,
    #[bits(12)]
    length_h: u16,
    #[bits(2)]
    host_addr_l: u8,
}

#[bitfield(u32)]
struct AddrLoDw3 {
    #[bits(2)]
    _ph: u8,
    #[bits(30)]
    addr: u32,
}

#[bitfield(u32)]
struct PuCplDw1 {
    #[bits(12)]
    byte_count: u16,
    bcm: bool,
    #[bits(3)]
    status: u8,
    comp_id: u16,
}

#[bitfield(u32)]
struct PuCplDw2 {
    #[bits(7)]
    low_addr: u8,
    _rsvd: bool,
    tag_l: u8,
    req_id: u16,
}

#[bitfield(u32)]
struct PrefixDw4 {
    #[bits(24)]
    pref: u32,
    #[bits(5)]
    pref_type: u8,
    pref_present: bool,
    #[bits(2)]
    _rsvd: u8,
}

#[bitfield(u32)]
struct RoutingDw5 {
    #[bits(3)]
    pf_num: u8,
    #[bits(11)]
    vf_num: u16,
    vf_active: bool,
    #[bits(4)]
    _rsvd: u8,
    #[bits(5)]
    slot_num: u8,
    mm_mode: bool,
    #[bits(7)]
    bar_number: u8,
}

/// PU lengths are 10-bit DWORD counts.
const PU_LEN_LIMIT: u32 = 4096;
/// DM request lengths are 24 bits wide.
const DM_LEN_LIMIT: u32 = 1 << 24;

fn fits(field: &'static str, value: u64, bits: u32) -> Result<(), CodecError> {
    if value >> bits != 0 {
        return Err(CodecError::FieldOverflow { field, value });
    }
    Ok(())
}

/// A field the layout leaves out must already hold the value decoding
/// restores.
fn implied(
    layout: &'static str,
    field: &'static str,
    value: u64,
    restored: u64,
) -> Result<(), CodecError> {
    if value != restored {
        return Err(CodecError::NotCarried {
            layout,
            field,
            value,
        });
    }
    Ok(())
}

fn check_pu_len(len_bytes: u32) -> Result<(), CodecError> {
    if len_bytes % 4 != 0 || len_bytes >= PU_LEN_LIMIT {
        return Err(CodecError::LengthOutOfRange {
            len_bytes,
            mode: "PU",
        });
    }
    Ok(())
}

/// Writes `hdr` into a freshly cleared `flit`, marking the header bytes in
/// tkeep and the encoding in tuser bit 0. `flit.last` is left to the caller.
pub fn pack(hdr: &TlpHeader, flit: &mut Flit) -> Result<(), CodecError> {
    let mut dw = [0u32; HDR_DWORDS];
    let ft = hdr.fmt_type;

    fits("tag", hdr.tag as u64, 10)?;
    let tag_l = (hdr.tag & 0xff) as u8;
    let mut dw0 = Dw0::new()
        .with_fmt_type(ft.0)
        .with_tag_h(hdr.tag & 0x200 != 0)
        .with_tag_m(hdr.tag & 0x100 != 0)
        .with_length(((hdr.len_bytes >> 2) & 0x3ff) as u16);

    match (&hdr.body, hdr.dm_mode) {
        (HeaderBody::Request(req), dm) if ft.is_mem_req() => {
            dw0 = dw0
                .with_at(req.attr.at.bits())
                .with_ep(req.attr.ep)
                .with_td(req.attr.td)
                .with_th(req.attr.th)
                .with_ln(req.attr.ln);

            if dm {
                if hdr.len_bytes >= DM_LEN_LIMIT {
                    return Err(CodecError::LengthOutOfRange {
                        len_bytes: hdr.len_bytes,
                        mode: "DM",
                    });
                }
                let r = &hdr.routing;
                let derived = vf_id(r.vf_num, r.vf_active, r.pf_num);
                implied("DM request", "req_id", hdr.req_id as u64, derived as u64)?;
                implied("DM request", "first_dw_be", req.first_dw_be as u64, 0xf)?;
                implied("DM request", "last_dw_be", req.last_dw_be as u64, 0xf)?;
                dw[1] = DmReqDw1::new()
                    .with_tag_l(tag_l)
                    .with_length_l((hdr.len_bytes & 3) as u8)
                    .with_length_h(((hdr.len_bytes >> 12) & 0xfff) as u16)
                    .with_host_addr_l((req.addr & 3) as u8)
                    .into();
                dw[2] = (req.addr >> 32) as u32;
                dw[3] = AddrLoDw3::new()
                    .with_addr(((req.addr >> 2) & 0x3fff_ffff) as u32)
                    .into();
            } else {
                check_pu_len(hdr.len_bytes)?;
                fits("first_dw_be", req.first_dw_be as u64, 4)?;
                fits("last_dw_be", req.last_dw_be as u64, 4)?;
                dw[1] = PuReqDw1::new()
                    .with_req_id(hdr.req_id)
                    .with_tag_l(tag_l)
                    .with_last_dw_be(req.last_dw_be)
                    .with_first_dw_be(req.first_dw_be)
                    .into();
                if ft.is_addr64() {
                    fits("addr[1:0]", req.addr & 3, 0)?;
                    dw[2] = (req.addr >> 32) as u32;
                    dw[3] = AddrLoDw3::new()
                        .with_addr(((req.addr >> 2) & 0x3fff_ffff) as u32)
                        .into();
                } else {
                    fits("addr", req.addr, 32)?;
                    dw[2] = req.addr as u32;
                }
            }
        }
        (HeaderBody::Completion(_), true) if ft.is_completion() => {
            return Err(CodecError::UnsupportedEncoding("completion"));
        }
        (HeaderBody::Completion(cpl), false) if ft.is_completion() => {
            check_pu_len(hdr.len_bytes)?;
            if cpl.byte_count == 0 || cpl.byte_count > 4096 {
                return Err(CodecError::FieldOverflow {
                    field: "byte_count",
                    value: cpl.byte_count as u64,
                });
            }
            implied("PU completion", "fc", cpl.fc as u64, 0)?;
            fits("cpl_status", cpl.status as u64, 3)?;
            fits("low_addr", cpl.low_addr as u64, 7)?;
            dw[1] = PuCplDw1::new()
                .with_comp_id(cpl.comp_id)
                .with_status(cpl.status)
                .with_bcm(cpl.bcm)
                // 4096 wraps to 0
                .with_byte_count(cpl.byte_count & 0xfff)
                .into();
            dw[2] = PuCplDw2::new()
                .with_req_id(hdr.req_id)
                .with_tag_l(tag_l)
                .with_low_addr(cpl.low_addr as u8)
                .into();
        }
        (HeaderBody::Interrupt { .. }, false) if ft.is_interrupt() => {
            return Err(CodecError::UnsupportedEncoding("interrupt in PU mode, which"));
        }
        (HeaderBody::Interrupt { vector_num }, true) if ft.is_interrupt() => {
            implied("interrupt", "len_bytes", hdr.len_bytes as u64, 0)?;
            implied("interrupt", "tag", hdr.tag as u64, 0)?;
            implied("interrupt", "req_id", hdr.req_id as u64, 0)?;
            dw[2] = *vector_num as u32;
        }
        (HeaderBody::Other, _)
            if !ft.is_mem_req() && !ft.is_completion() && !ft.is_interrupt() =>
        {
            check_pu_len(hdr.len_bytes)?;
            implied("generic", "tag", hdr.tag as u64, 0)?;
            implied("generic", "req_id", hdr.req_id as u64, 0)?;
        }
        _ => return Err(CodecError::BodyMismatch(ft.0)),
    }
    dw[0] = dw0.into();

    let r = &hdr.routing;
    fits("bar_number", r.bar_number as u64, 7)?;
    fits("slot_num", r.slot_num as u64, 5)?;
    fits("vf_num", r.vf_num as u64, 11)?;
    fits("pf_num", r.pf_num as u64, 3)?;
    dw[5] = RoutingDw5::new()
        .with_bar_number(r.bar_number)
        .with_mm_mode(r.mm_mode)
        .with_slot_num(r.slot_num)
        .with_vf_active(r.vf_active)
        .with_vf_num(r.vf_num)
        .with_pf_num(r.pf_num)
        .into();

    fits("pref_type", hdr.prefix.kind as u64, 5)?;
    fits("pref", hdr.prefix.value as u64, 24)?;
    dw[4] = PrefixDw4::new()
        .with_pref_present(hdr.prefix.present)
        .with_pref_type(hdr.prefix.kind)
        .with_pref(hdr.prefix.value)
        .into();

    dw[6] = (hdr.metadata >> 32) as u32;
    dw[7] = hdr.metadata as u32;

    flit.reset();
    flit.set_dm_mode(hdr.dm_mode);
    for (idx, v) in dw.iter().enumerate() {
        flit.put_dw(idx, *v, 0xf);
    }
    Ok(())
}

/// Decodes the header at the start of `flit`.
pub fn unpack(flit: &Flit) -> Result<TlpHeader, CodecError> {
    let bytes = flit.data.as_bytes();
    let (_, dw) = parser::header_dwords(bytes).map_err(|_| CodecError::Truncated)?;
    let (_, (fmt_type, _)) =
        parser::packet_format(bytes).map_err(|_| UnknownFmtType(bytes[3]))?;

    let dm_mode = flit.dm_mode();
    let dw0 = Dw0::from(dw[0]);
    let tag_hm = ((dw0.tag_h() as u16) << 9) | ((dw0.tag_m() as u16) << 8);

    let r = RoutingDw5::from(dw[5]);
    let routing = Routing {
        bar_number: r.bar_number(),
        mm_mode: r.mm_mode(),
        slot_num: r.slot_num(),
        vf_active: r.vf_active(),
        vf_num: r.vf_num(),
        pf_num: r.pf_num(),
    };

    let p = PrefixDw4::from(dw[4]);
    let prefix = Prefix {
        present: p.pref_present(),
        kind: p.pref_type(),
        value: p.pref(),
    };

    let mut hdr = TlpHeader::new(fmt_type);
    hdr.dm_mode = dm_mode;
    hdr.routing = routing;
    hdr.prefix = prefix;
    hdr.metadata = ((dw[6] as u64) << 32) | dw[7] as u64;

    if fmt_type.is_mem_req() {
        let attr = Attr {
            ln: dw0.ln(),
            th: dw0.th(),
            td: dw0.td(),
            ep: dw0.ep(),
            at: AddressType::from_bits(dw0.at()),
        };

        let req = if dm_mode {
            let dw1 = DmReqDw1::from(dw[1]);
            hdr.tag = tag_hm | dw1.tag_l() as u16;
            hdr.len_bytes = ((dw1.length_h() as u32) << 12)
                | ((dw0.length() as u32) << 2)
                | dw1.length_l() as u32;
            // DM has no requester ID, derive one from the function.
            hdr.req_id = vf_id(routing.vf_num, routing.vf_active, routing.pf_num);
            RequestFields {
                addr: ((dw[2] as u64) << 32)
                    | ((AddrLoDw3::from(dw[3]).addr() as u64) << 2)
                    | dw1.host_addr_l() as u64,
                // DM lengths are in bytes, byte enables are unused
                first_dw_be: 0xf,
                last_dw_be: 0xf,
                attr,
            }
        } else {
            let dw1 = PuReqDw1::from(dw[1]);
            hdr.tag = tag_hm | dw1.tag_l() as u16;
            hdr.len_bytes = (dw0.length() as u32) << 2;
            hdr.req_id = dw1.req_id();
            let addr = if fmt_type.is_addr64() {
                ((dw[2] as u64) << 32) | ((AddrLoDw3::from(dw[3]).addr() as u64) << 2)
            } else {
                dw[2] as u64
            };
            RequestFields {
                addr,
                first_dw_be: dw1.first_dw_be(),
                last_dw_be: dw1.last_dw_be(),
                attr,
            }
        };
        hdr.body = HeaderBody::Request(req);
    } else if fmt_type.is_completion() {
        if dm_mode {
            return Err(CodecError::UnsupportedEncoding("completion"));
        }
        let dw1 = PuCplDw1::from(dw[1]);
        let dw2 = PuCplDw2::from(dw[2]);
        hdr.len_bytes = (dw0.length() as u32) << 2;
        hdr.req_id = dw2.req_id();
        hdr.tag = tag_hm | dw2.tag_l() as u16;
        let byte_count = match dw1.byte_count() {
            0 => 4096,
            n => n,
        };
        hdr.body = HeaderBody::Completion(CompletionFields {
            comp_id: dw1.comp_id(),
            status: dw1.status(),
            bcm: dw1.bcm(),
            byte_count,
            low_addr: dw2.low_addr() as u32,
            fc: false,
        });
    } else if fmt_type.is_interrupt() {
        if !dm_mode {
            return Err(CodecError::UnsupportedEncoding("interrupt in PU mode, which"));
        }
        hdr.body = HeaderBody::Interrupt {
            vector_num: dw[2] as u16,
        };
    } else {
        hdr.len_bytes = (dw0.length() as u32) << 2;
    }

    Ok(hdr)
}

/// Offset added to a completion's lower address for bytes masked off at the
/// start of a read. PCIe table 2-39.
pub fn lower_addr_byte_offset(first_be: u8) -> u32 {
    if first_be & 0xf == 0 {
        // fence
        return 0;
    }
    first_be.trailing_zeros()
}

/// Byte count of a read completion given the DWORD length and byte enables,
/// following PCIe table 2-38. `None` for enable/length combinations a legal
/// read cannot carry.
pub fn completion_byte_count(len_dw: u32, first_be: u8, last_be: u8) -> Option<u32> {
    let first_be = first_be & 0xf;
    let mut last_be = last_be & 0xf;

    if len_dw == 0 {
        return None;
    }

    if first_be == 0 {
        // zero-length read (fence)
        return (last_be == 0 && len_dw == 1).then_some(1);
    }

    if last_be == 0 {
        if len_dw != 1 {
            return None;
        }
        last_be = first_be;
    }

    // Drop the bytes masked off before the first and after the last enable.
    let leading = first_be.trailing_zeros();
    let trailing = last_be.leading_zeros() - 4;
    Some(len_dw * 4 - leading - trailing)
}
