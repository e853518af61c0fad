use crate::engine::SyncookieEngine;
use crate::handshake::HandshakeTable;
use crate::packet::{ConnectionDescriptor, SyntheticSegment, TcpFlags};
use tracing::{debug, warn};

/// What the caller does with a segment after the hook ran
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Not ours; continue with normal processing
    Continue,
    /// Consumed by the cookie path
    Drop,
    /// Cookie validated; run this SYN through normal processing in place of the ACK
    Replay(SyntheticSegment),
}

/// Run the cookie path for one TCP segment.
///
/// `has_state` tells whether the state table already matched the segment. A SYN under
/// flood is answered with a cookie and dropped. An ACK with no state that carries a valid
/// cookie is turned into the SYN it stands for.
pub fn filter_tcp(engine: &SyncookieEngine, conn: &ConnectionDescriptor, has_state: bool) -> Verdict {
    if !conn.is_inbound() {
        return Verdict::Continue;
    }

    if conn.is_syn_only() && engine.check_flood(conn).cookies_required() {
        if let Err(e) = engine.send_cookie_synack(conn) {
            warn!(error = %e, src = %conn.src, sport = conn.sport, "Failed to send cookie SYN-ACK");
        }
        return Verdict::Drop;
    }

    if conn.is_ack_only() && !has_state && engine.validate_cookie(conn) {
        return match engine.recreate_syn(conn, engine.synthetic_ttl()) {
            Some(syn) => {
                debug!(src = %conn.src, sport = conn.sport, "Replaying SYN rebuilt from cookie");
                Verdict::Replay(syn)
            }
            None => Verdict::Drop,
        };
    }

    Verdict::Continue
}

/// Whether an ACK hitting an existing, closing state is in fact a new cookie handshake
/// reusing the same tuple. No side effects.
pub fn is_state_reuse_ack(engine: &SyncookieEngine, conn: &ConnectionDescriptor) -> bool {
    conn.is_inbound() && conn.is_ack_only() && engine.check_cookie(conn)
}

/// Restore the `recreated` tag on a rebuilt SYN that came back through packet capture.
///
/// The tag does not survive the wire, so SYNs injected after a [`Verdict::Replay`] are
/// matched against the flows marked in `table`.
pub fn restore_replay_tag(table: &HandshakeTable, conn: &mut ConnectionDescriptor) {
    if conn.is_inbound()
        && conn.is_syn_only()
        && !conn.recreated
        && table.take_replayed(&conn.flow_key())
    {
        conn.recreated = true;
    }
}

/// Keep the half-open table in step with segments that reach the host stack
pub fn observe_handshake(table: &HandshakeTable, conn: &ConnectionDescriptor, verdict: &Verdict) {
    if *verdict != Verdict::Continue || !conn.is_inbound() {
        return;
    }

    if conn.is_syn_only() {
        table.record_syn(conn.flow_key());
    } else if conn.flags & (TcpFlags::ACK | TcpFlags::RST) != 0 {
        table.remove(&conn.flow_key());
    }
}
