use crate::packet::ConnectionDescriptor;
use crate::secret::SecretKey;
use siphasher::sip128::{Hasher128, SipHasher24};
use std::hash::Hasher;
use std::net::IpAddr;
use syncookie_common::KEY_LEN;

/// Largest message: two IPv6 addresses, two ports, a sequence number and the cookie byte
const MAX_MESSAGE_LEN: usize = 16 + 16 + 2 + 2 + 4 + 1;

/// Keyed pseudorandom function with a 128-bit output
///
/// Must be deterministic and keep no state across calls.
pub trait KeyedMac: Send + Sync {
    fn mac(&self, key: &[u8; KEY_LEN], message: &[u8]) -> [u8; 16];
}

/// SipHash-2-4 with 128-bit output
#[derive(Debug, Clone, Copy, Default)]
pub struct SipHash128;

impl KeyedMac for SipHash128 {
    fn mac(&self, key: &[u8; KEY_LEN], message: &[u8]) -> [u8; 16] {
        let mut hasher = SipHasher24::new_with_key(key);
        hasher.write(message);
        hasher.finish128().as_bytes()
    }
}

/// Reduce a 128-bit MAC to 32 bits by XOR-folding halves
pub fn fold(output: [u8; 16]) -> u32 {
    let mut lo = [0u8; 8];
    let mut hi = [0u8; 8];
    lo.copy_from_slice(&output[..8]);
    hi.copy_from_slice(&output[8..]);
    let folded = u64::from_le_bytes(lo) ^ u64::from_le_bytes(hi);
    (folded as u32) ^ ((folded >> 32) as u32)
}

/// Authentication value for a cookie issued to `conn`
///
/// Message order: source address, destination address, source port, destination port,
/// `seq`, cookie byte. Multi-byte fields are big-endian.
pub fn cookie_mac<M: KeyedMac + ?Sized>(
    prf: &M,
    conn: &ConnectionDescriptor,
    cookie: u8,
    seq: u32,
    key: &SecretKey,
) -> u32 {
    let mut message = [0u8; MAX_MESSAGE_LEN];
    let mut len = 0;

    for addr in [conn.src, conn.dst] {
        len += put_addr(&mut message[len..], addr);
    }
    message[len..len + 2].copy_from_slice(&conn.sport.to_be_bytes());
    len += 2;
    message[len..len + 2].copy_from_slice(&conn.dport.to_be_bytes());
    len += 2;
    message[len..len + 4].copy_from_slice(&seq.to_be_bytes());
    len += 4;
    message[len] = cookie;
    len += 1;

    fold(prf.mac(key.expose_secret(), &message[..len]))
}

fn put_addr(buf: &mut [u8], addr: IpAddr) -> usize {
    match addr {
        IpAddr::V4(v4) => {
            buf[..4].copy_from_slice(&v4.octets());
            4
        }
        IpAddr::V6(v6) => {
            buf[..16].copy_from_slice(&v6.octets());
            16
        }
    }
}
