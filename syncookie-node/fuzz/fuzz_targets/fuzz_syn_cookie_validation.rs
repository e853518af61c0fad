#![no_main]

use libfuzzer_sys::fuzz_target;
use rand::rngs::StdRng;
use rand::SeedableRng;
use syncookie_common::{MSS_TABLE, WSCALE_TABLE};
use syncookie_node::cookie::recreate_syn;
use syncookie_node::mac::SipHash128;
use syncookie_node::wire::parse_segment;
use syncookie_node::{Direction, SyncookieMode, SyncookieStatus, TcpFlags};

// Arbitrary packets run through parsing, validation and SYN reconstruction.
// None of it may panic, and a reconstructed SYN only ever carries table values.

fuzz_target!(|data: &[u8]| {
    let Some(conn) = parse_segment(data, Direction::In) else {
        return;
    };

    let status = match SyncookieStatus::new(100, 50) {
        Ok(status) => status,
        Err(_) => return,
    };
    let mut rng = StdRng::seed_from_u64(0);
    if status
        .set_mode(SyncookieMode::Always, 100, 50, &mut rng)
        .is_err()
    {
        return;
    }

    // Nothing has been issued, so nothing can validate
    let checked = status.check(&SipHash128, &conn);
    assert!(!checked, "ACK validated with no cookies in flight");
    assert!(!status.validate(&SipHash128, &conn));
    assert_eq!(status.in_flight_counts(), [0, 0]);

    if let Some(syn) = recreate_syn(&conn, 64) {
        assert_eq!(syn.flags, TcpFlags::SYN);
        assert_eq!(syn.seq, conn.seq.wrapping_sub(1));
        assert!(syn.recreated);
        assert!(syn.mss.map_or(false, |m| MSS_TABLE.contains(&m)));
        assert!(syn.wscale.map_or(true, |w| w != 0 && WSCALE_TABLE.contains(&w)));
    }
});
