//! Command-processor packet headers.
//!
//! Only the handful of packets the control plane emits are modelled:
//!
//! | Type | Bits 31:30 | Layout                                   |
//! |------|------------|------------------------------------------|
//! | 0    | `00`       | `[29:16] count-1`, `[14:0] base register` |
//! | 2    | `10`       | filler, no payload                        |
//! | 3    | `11`       | `[29:16] count-1`, `[15:8] opcode`        |

pub const PM4_TYPE0: u32 = 0 << 30;
pub const PM4_TYPE2: u32 = 2 << 30;
pub const PM4_TYPE3: u32 = 3 << 30;

pub const PM4_ME_INIT: u32 = 0x48;
pub const PM4_NOP: u32 = 0x10;
pub const PM4_INDIRECT_BUFFER: u32 = 0x3f;
pub const PM4_INDIRECT_BUFFER_PFD: u32 = 0x37;
pub const PM4_MEM_WRITE: u32 = 0x3d;
pub const PM4_EVENT_WRITE: u32 = 0x46;
pub const PM4_INTERRUPT: u32 = 0x54;
pub const PM4_SET_PROTECTED_MODE: u32 = 0x5f;
pub const PM4_WAIT_FOR_IDLE: u32 = 0x26;

pub const EVENT_CACHE_FLUSH_TS: u32 = 4;

/// Header of a type-0 register write of `cnt` consecutive registers starting at `reg`.
#[must_use]
pub const fn type0_packet(reg: u32, cnt: u32) -> u32 {
    PM4_TYPE0 | (((cnt - 1) & 0x3fff) << 16) | (reg & 0x7fff)
}

/// Header of a type-3 packet carrying `cnt` payload dwords.
#[must_use]
pub const fn type3_packet(opcode: u32, cnt: u32) -> u32 {
    PM4_TYPE3 | (((cnt - 1) & 0x3fff) << 16) | ((opcode & 0xff) << 8)
}

/// A NOP carrying `cnt` ignored payload dwords.
#[must_use]
pub const fn nop_packet(cnt: u32) -> u32 {
    type3_packet(PM4_NOP, cnt)
}

/// A decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketHeader {
    Type0 { reg: u32, count: u32 },
    Type2,
    Type3 { opcode: u32, count: u32 },
    Invalid(u32),
}

impl PacketHeader {
    #[must_use]
    pub const fn decode(raw: u32) -> Self {
        let count = ((raw >> 16) & 0x3fff) + 1;
        match raw >> 30 {
            0 => Self::Type0 {
                reg: raw & 0x7fff,
                count,
            },
            2 => Self::Type2,
            3 => Self::Type3 {
                opcode: (raw >> 8) & 0xff,
                count,
            },
            _ => Self::Invalid(raw),
        }
    }

    /// Total packet length in dwords including the header.
    #[must_use]
    pub const fn len(&self) -> u32 {
        match *self {
            Self::Type0 { count, .. } | Self::Type3 { count, .. } => count + 1,
            Self::Type2 | Self::Invalid(_) => 1,
        }
    }

    #[must_use]
    pub const fn is_nop(&self) -> bool {
        matches!(
            *self,
            Self::Type3 {
                opcode: PM4_NOP,
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_type3() {
        let hdr = PacketHeader::decode(type3_packet(PM4_INDIRECT_BUFFER_PFD, 2));
        assert_eq!(
            hdr,
            PacketHeader::Type3 {
                opcode: PM4_INDIRECT_BUFFER_PFD,
                count: 2
            }
        );
        assert_eq!(hdr.len(), 3);
    }

    #[test]
    fn test_decode_type0() {
        let hdr = PacketHeader::decode(type0_packet(0x0042, 1));
        assert_eq!(hdr, PacketHeader::Type0 { reg: 0x42, count: 1 });
    }

    #[test]
    fn test_nop_spans_payload() {
        let hdr = PacketHeader::decode(nop_packet(211));
        assert!(hdr.is_nop());
        assert_eq!(hdr.len(), 212);
        assert_eq!(PacketHeader::decode(PM4_TYPE2).len(), 1);
    }
}
