use crate::mac::{cookie_mac, KeyedMac};
use crate::packet::{ConnectionDescriptor, SyntheticSegment, TcpFlags};
use crate::status::SyncookieStatus;
use std::sync::atomic::Ordering;
use syncookie_common::{acked_iss, embed, extract, mac_matches, syn_seq, Cookie};
use tracing::debug;

impl SyncookieStatus {
    /// Initial sequence number for the SYN-ACK answering `conn`.
    ///
    /// `mss` is the MSS this side advertises; the peer's window-scale option (if any) is
    /// carried as well. SACK is never encoded. Counts the cookie as in flight under the
    /// current slot.
    pub fn generate<M: KeyedMac + ?Sized>(&self, prf: &M, conn: &ConnectionDescriptor, mss: u16) -> u32 {
        let keys = self.keys.read();
        let slot = keys.current;
        let cookie = Cookie::new(mss, conn.wscale, false, slot as u8);
        let byte = cookie.to_byte();

        let hash = cookie_mac(prf, conn, byte, conn.seq, &keys.keys[slot]);
        let iss = embed(hash, byte);

        self.in_flight[slot].fetch_add(1, Ordering::SeqCst);
        self.sent.fetch_add(1, Ordering::Relaxed);

        debug!(
            src = %conn.src,
            sport = conn.sport,
            slot = slot,
            mss_index = cookie.mss_index,
            wscale_index = cookie.wscale_index,
            "Cookie generated"
        );
        iss
    }

    /// Whether the ACK in `conn` acknowledges a cookie we issued. No side effects.
    ///
    /// A slot with nothing in flight rejects before any MAC is computed.
    pub fn check<M: KeyedMac + ?Sized>(&self, prf: &M, conn: &ConnectionDescriptor) -> bool {
        let seq = syn_seq(conn.seq);
        let ack = acked_iss(conn.ack);
        let byte = extract(ack);
        let cookie = Cookie::from_byte(byte);
        let slot = cookie.slot as usize;

        if self.in_flight[slot].load(Ordering::SeqCst) == 0 {
            return false;
        }

        let keys = self.keys.read();
        let hash = cookie_mac(prf, conn, byte, seq, &keys.keys[slot]);
        mac_matches(ack, hash)
    }

    /// [`check`](Self::check), and on success retire the cookie from its slot's in-flight count
    pub fn validate<M: KeyedMac + ?Sized>(&self, prf: &M, conn: &ConnectionDescriptor) -> bool {
        if !self.check(prf, conn) {
            return false;
        }

        let slot = Cookie::from_byte(extract(acked_iss(conn.ack))).slot as usize;
        // Saturating: a duplicated ACK can pass check after the count reached zero
        let _ = self.in_flight[slot].fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            n.checked_sub(1)
        });
        self.validated.fetch_add(1, Ordering::Relaxed);
        true
    }
}

/// Rebuild the SYN that `conn`'s cookie stands for.
///
/// Only meaningful after the cookie validated. Returns `None` when a decoded table index is
/// out of range. The segment carries the `recreated` tag so the flood check skips it.
/// Window-scale class 0 is also what a SYN without the option encodes to, so it is rebuilt
/// as no option rather than an explicit shift of 0.
pub fn recreate_syn(conn: &ConnectionDescriptor, ttl: u8) -> Option<SyntheticSegment> {
    let cookie = Cookie::from_byte(extract(acked_iss(conn.ack)));
    let params = cookie.params()?;

    Some(SyntheticSegment {
        src: conn.src,
        dst: conn.dst,
        sport: conn.sport,
        dport: conn.dport,
        seq: syn_seq(conn.seq),
        ack: 0,
        flags: TcpFlags::SYN,
        window: 0,
        mss: Some(params.mss),
        wscale: (params.wscale != 0).then_some(params.wscale),
        sack_permitted: params.sack_ok,
        ttl,
        recreated: true,
    })
}
