//! Delivery properties over the simulated network.
//!
//! These are the transport's promises, checked end-to-end rather than per
//! module: every message arrives exactly once, intact, in order, for any
//! size and under packet loss — the loss pattern only costs time.

use std::{
    net::{Ipv4Addr, SocketAddrV4},
    time::{Duration, Instant},
};

use ames_core::{
    task::{Duct, Task},
    Ames,
};
use ames_harness::SimNet;
use ames_proto::{Lane, Plea, Ship};
use bytes::Bytes;
use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

const A: Ship = Ship(0x1_0001);
const B: Ship = Ship(0x2_0002);
const G2: Ship = Ship(0x02);

fn lane(host: u8) -> Lane {
    Lane::ipv4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, host), 9000))
}

fn duct(name: &str) -> Duct {
    Duct(vec![name.to_string()])
}

fn world() -> SimNet {
    let mut net = SimNet::new(Instant::now());
    net.add_node(Ames::new(A, 1, [0xa; 32]), lane(1));
    net.add_node(Ames::new(B, 1, [0xb; 32]), lane(2));
    net.add_node(Ames::new(G2, 1, [0x2; 32]), lane(3));
    net.introduce(A, B);
    net.introduce(B, A);
    net.introduce(B, G2);
    net.introduce(G2, B);
    net.set_auto_ack(G2, true);
    net.set_auto_ack(B, true);
    net.handle(
        B,
        Task::Plea {
            duct: duct("register"),
            ship: G2,
            plea: Plea {
                vane: "a".to_string(),
                path: vec![],
                payload: Bytes::new(),
            },
        },
    );
    net.clear_records();
    net
}

fn send(net: &mut SimNet, payload: Vec<u8>) {
    net.handle(
        A,
        Task::Plea {
            duct: duct("caller"),
            ship: B,
            plea: Plea {
                vane: "g".to_string(),
                path: vec!["p".to_string()],
                payload: Bytes::from(payload),
            },
        },
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// Any payload size round-trips intact through fragmentation,
    /// encryption, relaying, and reassembly.
    #[test]
    fn any_size_round_trips(len in 0usize..5000, seed in any::<u64>()) {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();

        let mut net = world();
        send(&mut net, payload.clone());
        net.run(Duration::from_secs(1), 30);

        prop_assert_eq!(net.delivers.len(), 1);
        prop_assert_eq!(&net.delivers[0].plea.payload[..], &payload[..]);
        prop_assert_eq!(net.dones.len(), 1);
        prop_assert!(net.dones[0].error.is_none());
    }

    /// Steady loss slows a flow down but never corrupts or reorders it.
    #[test]
    fn lossy_link_preserves_order_and_content(
        sizes in proptest::collection::vec(0usize..3000, 1..5),
        stride in 2usize..5,
    ) {
        let mut net = world();
        let mut count = 0;
        net.set_drop_filter(move |flight| {
            if flight.from != A {
                return false;
            }
            count += 1;
            count % stride == 0
        });

        for (i, len) in sizes.iter().enumerate() {
            send(&mut net, vec![i as u8; *len]);
        }
        net.run(Duration::from_secs(1), 240);

        prop_assert_eq!(net.delivers.len(), sizes.len());
        for (i, len) in sizes.iter().enumerate() {
            let plea = &net.delivers[i].plea;
            prop_assert_eq!(plea.payload.len(), *len);
            prop_assert!(plea.payload.iter().all(|b| *b == i as u8));
        }

        // the sender saw exactly one positive conclusion per message,
        // strictly in order
        let nums: Vec<u32> = net.dones.iter().map(|d| d.num).collect();
        prop_assert_eq!(nums, (0..sizes.len() as u32).collect::<Vec<_>>());
        prop_assert!(net.dones.iter().all(|d| d.error.is_none()));
    }
}

#[test]
fn interleaved_flows_do_not_order_across_each_other() {
    let mut net = world();

    // two callers, two flows
    send(&mut net, vec![1; 10]);
    net.handle(
        A,
        Task::Plea {
            duct: duct("other-caller"),
            ship: B,
            plea: Plea {
                vane: "g".to_string(),
                path: vec!["q".to_string()],
                payload: Bytes::from_static(b"second flow"),
            },
        },
    );
    net.run(Duration::from_secs(1), 30);

    // each flow concluded its own message zero
    assert_eq!(net.dones.len(), 2);
    assert!(net.dones.iter().all(|d| d.num == 0));
    let ducts: Vec<&Duct> = net.dones.iter().map(|d| &d.duct).collect();
    assert!(ducts.contains(&&duct("caller")));
    assert!(ducts.contains(&&duct("other-caller")));
}
