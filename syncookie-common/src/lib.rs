// SYN cookie wire format - shared between the packet path and the control plane
// This crate is no_std compatible so it can be linked into packet-processing programs

#![cfg_attr(not(test), no_std)]

/// Length in bytes of a secret key slot
pub const KEY_LEN: usize = 16;

/// Number of secret key slots (odd/even generations)
pub const SLOT_COUNT: usize = 2;

/// Default lifetime of a secret key generation, in seconds
pub const KEY_LIFETIME_SECS: u64 = 15;

/// MSS values a cookie can carry, ascending
pub const MSS_TABLE: [u16; 8] = [216, 536, 1200, 1360, 1400, 1440, 1452, 1460];

/// Window-scale shifts a cookie can carry, ascending
pub const WSCALE_TABLE: [u8; 8] = [0, 1, 2, 4, 6, 7, 8, 14];

/// Low byte of the ISN holds the (obfuscated) cookie
pub const COOKIE_MASK: u32 = 0xff;

const SLOT_BIT: u8 = 0x01;
const SACK_BIT: u8 = 0x02;
const WSCALE_SHIFT: u8 = 2;
const MSS_SHIFT: u8 = 5;
const INDEX_MASK: u8 = 0x07;

/// Connection parameters packed into a single byte
///
/// Layout, least significant bit first:
/// - bit 0: secret slot the cookie was issued under
/// - bit 1: SACK permitted (reserved, the generator never sets it)
/// - bits 2-4: index into [`WSCALE_TABLE`]
/// - bits 5-7: index into [`MSS_TABLE`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cookie {
    pub mss_index: u8,
    pub wscale_index: u8,
    pub sack_ok: bool,
    pub slot: u8,
}

/// Concrete parameters recovered from a cookie
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CookieParams {
    pub mss: u16,
    pub wscale: u8,
    pub sack_ok: bool,
    pub slot: u8,
}

impl Cookie {
    /// Build a cookie by floor-matching the negotiated values against the tables.
    ///
    /// An absent window-scale option maps to index 0.
    pub fn new(mss: u16, wscale: Option<u8>, sack_ok: bool, slot: u8) -> Self {
        Self {
            mss_index: floor_index(&MSS_TABLE, mss),
            wscale_index: wscale.map_or(0, |ws| floor_index(&WSCALE_TABLE, ws)),
            sack_ok,
            slot: slot & SLOT_BIT,
        }
    }

    pub const fn from_byte(byte: u8) -> Self {
        Self {
            mss_index: (byte >> MSS_SHIFT) & INDEX_MASK,
            wscale_index: (byte >> WSCALE_SHIFT) & INDEX_MASK,
            sack_ok: byte & SACK_BIT != 0,
            slot: byte & SLOT_BIT,
        }
    }

    pub const fn to_byte(self) -> u8 {
        let mut byte = self.slot & SLOT_BIT;
        if self.sack_ok {
            byte |= SACK_BIT;
        }
        byte |= (self.wscale_index & INDEX_MASK) << WSCALE_SHIFT;
        byte |= (self.mss_index & INDEX_MASK) << MSS_SHIFT;
        byte
    }

    /// MSS class carried by the cookie, `None` if the index is outside the table
    pub fn mss(self) -> Option<u16> {
        MSS_TABLE.get(self.mss_index as usize).copied()
    }

    /// Window-scale class carried by the cookie, `None` if the index is outside the table
    pub fn wscale(self) -> Option<u8> {
        WSCALE_TABLE.get(self.wscale_index as usize).copied()
    }

    pub fn params(self) -> Option<CookieParams> {
        Some(CookieParams {
            mss: self.mss()?,
            wscale: self.wscale()?,
            sack_ok: self.sack_ok,
            slot: self.slot,
        })
    }
}

/// Pack connection parameters into a cookie byte
pub fn encode(mss: u16, wscale: Option<u8>, sack_ok: bool, slot: u8) -> u8 {
    Cookie::new(mss, wscale, sack_ok, slot).to_byte()
}

/// Unpack a cookie byte into concrete table values
pub fn decode(byte: u8) -> Option<CookieParams> {
    Cookie::from_byte(byte).params()
}

/// Index of the largest table entry not exceeding `value`.
///
/// Falls back to index 0 when every entry is larger. `table` must be ascending.
pub fn floor_index<T: Copy + PartialOrd>(table: &[T], value: T) -> u8 {
    let mut idx = table.len().saturating_sub(1);
    while idx > 0 && table[idx] > value {
        idx -= 1;
    }
    idx as u8
}

/// Fold a cookie byte into the low byte of a MAC value.
///
/// The cookie is XORed with the hash's top byte so it does not appear verbatim on the wire.
pub const fn embed(hash: u32, cookie: u8) -> u32 {
    (hash & !COOKIE_MASK) | ((cookie as u32) ^ (hash >> 24))
}

/// Recover the cookie byte from an ISN; needs no secret.
pub const fn extract(iss: u32) -> u8 {
    ((iss & COOKIE_MASK) ^ (iss >> 24)) as u8
}

/// Compare the authenticated top 24 bits of an acknowledged ISN against a recomputed MAC
pub const fn mac_matches(iss: u32, hash: u32) -> bool {
    (iss & !COOKIE_MASK) == (hash & !COOKIE_MASK)
}

/// Sequence number of the original SYN, given a segment from the same peer that follows it
pub const fn syn_seq(seq: u32) -> u32 {
    seq.wrapping_sub(1)
}

/// ISN we sent, given the peer's acknowledgement of it
pub const fn acked_iss(ack: u32) -> u32 {
    ack.wrapping_sub(1)
}
