#![no_main]

use libfuzzer_sys::fuzz_target;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::net::{IpAddr, Ipv4Addr};
use syncookie_common::{extract, Cookie, MSS_TABLE, WSCALE_TABLE};
use syncookie_node::mac::SipHash128;
use syncookie_node::{ConnectionDescriptor, Direction, SyncookieMode, SyncookieStatus, TcpFlags};

// Generated cookies must always carry in-table parameters and validate against
// the ACK a well-behaved peer would send.

fuzz_target!(|data: &[u8]| {
    if data.len() < 24 {
        return;
    }

    let mut seed = [0u8; 8];
    seed.copy_from_slice(&data[..8]);
    let status = match SyncookieStatus::new(100, 50) {
        Ok(status) => status,
        Err(_) => return,
    };
    let mut rng = StdRng::seed_from_u64(u64::from_le_bytes(seed));
    if status
        .set_mode(SyncookieMode::Always, 100, 50, &mut rng)
        .is_err()
    {
        return;
    }

    let syn = ConnectionDescriptor {
        src: IpAddr::V4(Ipv4Addr::new(data[8], data[9], data[10], data[11])),
        dst: IpAddr::V4(Ipv4Addr::new(data[12], data[13], data[14], data[15])),
        sport: u16::from_be_bytes([data[16], data[17]]),
        dport: u16::from_be_bytes([data[18], data[19]]),
        seq: u32::from_be_bytes([data[20], data[21], data[22], data[23]]),
        ack: 0,
        flags: TcpFlags::SYN,
        mss: data.get(24..26).map(|b| u16::from_be_bytes([b[0], b[1]])),
        wscale: data.get(26).copied(),
        sack_permitted: data.get(27).map_or(false, |b| b & 1 == 1),
        direction: Direction::In,
        recreated: false,
    };

    let mss = syn.effective_mss(536);
    let iss = status.generate(&SipHash128, &syn, mss);

    let cookie = Cookie::from_byte(extract(iss));
    assert_eq!(cookie.slot as usize, status.current_slot());
    assert!(!cookie.sack_ok, "generator must never set the SACK bit");
    let params = cookie.params().expect("cookie indices are always in range");
    assert!(MSS_TABLE.contains(&params.mss));
    assert!(WSCALE_TABLE.contains(&params.wscale));
    assert!(params.mss <= mss);

    let ack = ConnectionDescriptor {
        seq: syn.seq.wrapping_add(1),
        ack: iss.wrapping_add(1),
        flags: TcpFlags::ACK,
        ..syn.clone()
    };
    assert!(status.check(&SipHash128, &ack), "fresh cookie must validate");
});
