//! Unpacked TLP header, the form every other module manipulates.

use std::fmt;

use crate::FmtType;

/// PCIe `AT` attribute of a memory request.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressType {
    /// IOVA, translated by the simulated IOMMU.
    #[default]
    Untranslated = 0,
    /// ATS translation request. The completion payload carries the PA.
    TranslationRequest = 1,
    /// Simulated PA handed out by an earlier translation request.
    Translated = 2,
    Reserved = 3,
}

impl AddressType {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 3 {
            0 => AddressType::Untranslated,
            1 => AddressType::TranslationRequest,
            2 => AddressType::Translated,
            _ => AddressType::Reserved,
        }
    }

    pub fn bits(self) -> u8 {
        self as u8
    }
}

/// Request attribute bits carried in DW0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Attr {
    pub ln: bool,
    pub th: bool,
    pub td: bool,
    pub ep: bool,
    pub at: AddressType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestFields {
    pub addr: u64,
    pub first_dw_be: u8,
    pub last_dw_be: u8,
    pub attr: Attr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompletionFields {
    pub comp_id: u16,
    pub status: u8,
    pub bcm: bool,
    /// Bytes remaining for the whole request, this packet included.
    pub byte_count: u16,
    pub low_addr: u32,
    /// Final completion of a data mover request.
    pub fc: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderBody {
    Request(RequestFields),
    Completion(CompletionFields),
    Interrupt { vector_num: u16 },
    /// Only the common fields are meaningful.
    Other,
}

/// DW5 function routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Routing {
    pub bar_number: u8,
    pub mm_mode: bool,
    pub slot_num: u8,
    pub vf_active: bool,
    pub vf_num: u16,
    pub pf_num: u8,
}

/// DW4 TLP prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Prefix {
    pub present: bool,
    pub kind: u8,
    pub value: u32,
}

impl Prefix {
    pub const PASID: u8 = 0b10001;

    pub fn pasid(pasid: u32) -> Self {
        Prefix {
            present: true,
            kind: Self::PASID,
            value: pasid & 0xfffff,
        }
    }
}

/// Encode PF/VF in the req_id/comp_id layout.
pub fn vf_id(vf_num: u16, vf_active: bool, pf_num: u8) -> u16 {
    (vf_num << 4) | ((vf_active as u16) << 3) | (pf_num as u16 & 0x7)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlpHeader {
    pub fmt_type: FmtType,
    /// Data mover encoding, signalled in tuser bit 0.
    pub dm_mode: bool,
    pub len_bytes: u32,
    pub req_id: u16,
    /// 10-bit tag.
    pub tag: u16,
    pub metadata: u64,
    pub routing: Routing,
    pub prefix: Prefix,
    pub body: HeaderBody,
}

impl TlpHeader {
    /// A zeroed header whose body variant follows from `fmt_type`.
    pub fn new(fmt_type: FmtType) -> Self {
        let body = if fmt_type.is_mem_req() {
            HeaderBody::Request(RequestFields::default())
        } else if fmt_type.is_completion() {
            HeaderBody::Completion(CompletionFields::default())
        } else if fmt_type.is_interrupt() {
            HeaderBody::Interrupt { vector_num: 0 }
        } else {
            HeaderBody::Other
        };

        TlpHeader {
            fmt_type,
            dm_mode: false,
            len_bytes: 0,
            req_id: 0,
            tag: 0,
            metadata: 0,
            routing: Routing::default(),
            prefix: Prefix::default(),
            body,
        }
    }

    pub fn request(&self) -> Option<&RequestFields> {
        match &self.body {
            HeaderBody::Request(req) => Some(req),
            _ => None,
        }
    }

    pub fn request_mut(&mut self) -> Option<&mut RequestFields> {
        match &mut self.body {
            HeaderBody::Request(req) => Some(req),
            _ => None,
        }
    }

    pub fn completion(&self) -> Option<&CompletionFields> {
        match &self.body {
            HeaderBody::Completion(cpl) => Some(cpl),
            _ => None,
        }
    }

    pub fn vector_num(&self) -> Option<u16> {
        match self.body {
            HeaderBody::Interrupt { vector_num } => Some(vector_num),
            _ => None,
        }
    }

    /// PASID carried in a type `0b10001` prefix.
    pub fn pasid(&self) -> Option<u32> {
        if self.prefix.present && self.prefix.kind == Prefix::PASID {
            Some(self.prefix.value & 0xfffff)
        } else {
            None
        }
    }

    pub fn len_dwords(&self) -> u32 {
        (self.len_bytes + 3) / 4
    }

    fn fmt_base(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} len_bytes 0x{:04x}",
            self.fmt_type,
            if self.dm_mode { "DM" } else { "PU" },
            self.len_bytes
        )?;
        if self.prefix.present {
            if self.prefix.kind == Prefix::PASID {
                write!(f, " [pasid 0x{:x}]", self.prefix.value)?;
            } else {
                write!(
                    f,
                    " [prefix type 0x{:x} value 0x{:x}]",
                    self.prefix.kind, self.prefix.value
                )?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for TlpHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_base(f)?;
        match &self.body {
            HeaderBody::Request(req) if self.dm_mode => write!(
                f,
                " req_id 0x{:04x} tag 0x{:02x} [AT {:x}] addr 0x{:016x}",
                self.req_id,
                self.tag,
                req.attr.at.bits(),
                req.addr
            ),
            HeaderBody::Request(req) => write!(
                f,
                " req_id 0x{:04x} tag 0x{:02x} [AT {:x}] lbe 0x{:x} fbe 0x{:x} addr 0x{:016x}",
                self.req_id,
                self.tag,
                req.attr.at.bits(),
                req.last_dw_be,
                req.first_dw_be,
                req.addr
            ),
            HeaderBody::Completion(cpl) => write!(
                f,
                " cpl_id 0x{:04x} st {:x} bcm {:x} fc {:x} bytes 0x{:03x} req_id 0x{:04x} tag 0x{:02x} low_addr 0x{:02x}",
                cpl.comp_id,
                cpl.status,
                cpl.bcm as u8,
                cpl.fc as u8,
                cpl.byte_count,
                self.req_id,
                self.tag,
                cpl.low_addr
            ),
            HeaderBody::Interrupt { vector_num } => write!(f, " vector_num 0x{:x}", vector_num),
            HeaderBody::Other => Ok(()),
        }
    }
}
