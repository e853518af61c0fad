//! Property tests for the cookie format and the generate/validate path

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use syncookie_common::{
    decode, embed, encode, extract, floor_index, Cookie, MSS_TABLE, WSCALE_TABLE,
};
use syncookie_node::mac::SipHash128;
use syncookie_node::{ConnectionDescriptor, Direction, SyncookieMode, SyncookieStatus, TcpFlags};

fn always_on() -> SyncookieStatus {
    let status = SyncookieStatus::new(100, 50).unwrap();
    status
        .set_mode(SyncookieMode::Always, 100, 50, &mut StdRng::seed_from_u64(42))
        .unwrap();
    status
}

fn arb_addr() -> impl Strategy<Value = IpAddr> {
    prop_oneof![
        any::<[u8; 4]>().prop_map(|o| IpAddr::V4(Ipv4Addr::from(o))),
        any::<[u8; 16]>().prop_map(|o| IpAddr::V6(Ipv6Addr::from(o))),
    ]
}

prop_compose! {
    fn arb_syn()(
        src in arb_addr(),
        dst in arb_addr(),
        sport in any::<u16>(),
        dport in any::<u16>(),
        seq in any::<u32>(),
        wscale in proptest::option::of(0u8..=14),
    ) -> ConnectionDescriptor {
        ConnectionDescriptor {
            src,
            dst,
            sport,
            dport,
            seq,
            ack: 0,
            flags: TcpFlags::SYN,
            mss: None,
            wscale,
            sack_permitted: false,
            direction: Direction::In,
            recreated: false,
        }
    }
}

fn ack_for(syn: &ConnectionDescriptor, iss: u32) -> ConnectionDescriptor {
    ConnectionDescriptor {
        seq: syn.seq.wrapping_add(1),
        ack: iss.wrapping_add(1),
        flags: TcpFlags::ACK,
        wscale: None,
        ..syn.clone()
    }
}

proptest! {
    #[test]
    fn prop_low_byte_recovers_cookie(hash in any::<u32>(), cookie in any::<u8>()) {
        let iss = embed(hash, cookie);
        prop_assert_eq!(extract(iss), cookie);
        prop_assert_eq!(iss & 0xffff_ff00, hash & 0xffff_ff00);
    }

    #[test]
    fn prop_mss_floor_match(mss in any::<u16>(), slot in 0u8..2, sack in any::<bool>()) {
        let params = decode(encode(mss, None, sack, slot)).unwrap();
        prop_assert!(MSS_TABLE.contains(&params.mss));
        if mss >= MSS_TABLE[0] {
            prop_assert!(params.mss <= mss);
            // No table entry fits between the chosen class and the real MSS
            prop_assert!(MSS_TABLE.iter().all(|&m| m <= params.mss || m > mss));
        } else {
            prop_assert_eq!(params.mss, MSS_TABLE[0]);
        }
        prop_assert_eq!(params.slot, slot);
        prop_assert_eq!(params.sack_ok, sack);
    }

    #[test]
    fn prop_wscale_floor_match(wscale in any::<u8>()) {
        let params = decode(encode(1460, Some(wscale), false, 0)).unwrap();
        prop_assert!(params.wscale <= wscale);
        prop_assert_eq!(
            params.wscale,
            WSCALE_TABLE[floor_index(&WSCALE_TABLE, wscale) as usize]
        );
    }

    #[test]
    fn prop_byte_round_trip(byte in any::<u8>()) {
        prop_assert_eq!(Cookie::from_byte(byte).to_byte(), byte);
    }

    #[test]
    fn prop_generated_cookie_validates(syn in arb_syn(), mss in 64u16..=9000) {
        let status = always_on();
        let iss = status.generate(&SipHash128, &syn, mss);
        prop_assert!(status.validate(&SipHash128, &ack_for(&syn, iss)));
    }

    #[test]
    fn prop_tampered_ack_rejected(
        syn in arb_syn(),
        delta in any::<u32>().prop_filter("must touch the MAC bits", |d| d & 0xffff_ff00 != 0),
    ) {
        let status = always_on();
        let iss = status.generate(&SipHash128, &syn, 1460);
        let mut ack = ack_for(&syn, iss);
        ack.ack ^= delta;
        prop_assert!(!status.check(&SipHash128, &ack));
    }

    #[test]
    fn prop_other_tuple_rejected(syn in arb_syn(), other in arb_syn()) {
        prop_assume!(
            (syn.src, syn.dst, syn.sport, syn.dport, syn.seq)
                != (other.src, other.dst, other.sport, other.dport, other.seq)
        );
        let status = always_on();
        let iss = status.generate(&SipHash128, &syn, 1460);
        prop_assert!(!status.check(&SipHash128, &ack_for(&other, iss)));
    }
}

#[test]
fn test_table_boundaries() {
    for (index, &mss) in MSS_TABLE.iter().enumerate() {
        assert_eq!(floor_index(&MSS_TABLE, mss) as usize, index);
        assert_eq!(decode(encode(mss + 1, None, false, 0)).unwrap().mss, mss);
    }
    assert_eq!(decode(encode(1, None, false, 0)).unwrap().mss, 216);
    assert_eq!(decode(encode(u16::MAX, None, false, 0)).unwrap().mss, 1460);
    assert_eq!(decode(encode(1460, Some(u8::MAX), false, 0)).unwrap().wscale, 14);
    assert_eq!(decode(encode(1460, Some(3), false, 0)).unwrap().wscale, 2);
}

#[test]
fn test_sack_bit_never_set_by_generator() {
    let status = always_on();
    let syn = ConnectionDescriptor {
        src: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
        dst: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
        sport: 1234,
        dport: 80,
        seq: 1,
        ack: 0,
        flags: TcpFlags::SYN,
        mss: Some(1460),
        wscale: Some(7),
        sack_permitted: true,
        direction: Direction::In,
        recreated: false,
    };
    let iss = status.generate(&SipHash128, &syn, 1460);
    assert!(!Cookie::from_byte(extract(iss)).sack_ok);
}
