//! End-to-end recovery behavior over a lossy simulated wire.

mod support;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use ruda::ProtocolConfig;
use support::harness::Pair;

fn fast_profile() -> ProtocolConfig {
    ProtocolConfig {
        nodelay: true,
        interval_ms: 10,
        resend: 2,
        snd_wnd: 128,
        rcv_wnd: 128,
        ..Default::default()
    }
}

#[test]
fn delivers_everything_in_order_through_thirty_percent_loss() {
    let mut pair = Pair::new(fast_profile());
    let mut rng = StdRng::seed_from_u64(0x5eed);

    let total = 50u32;
    for i in 0..total {
        pair.a
            .send(Bytes::from(format!("message {i:03}")))
            .unwrap();
    }

    let mut got = Vec::new();
    for now in (0u32..60_000).step_by(10) {
        pair.exchange_lossy(now, &mut |_| rng.gen_bool(0.3));
        while let Some(msg) = pair.b.recv() {
            got.push(msg);
        }
        if got.len() as u32 == total {
            break;
        }
    }

    assert_eq!(got.len() as u32, total, "not everything arrived");
    for (i, msg) in got.iter().enumerate() {
        assert_eq!(&msg[..], format!("message {i:03}").as_bytes());
    }
}

#[test]
fn multi_fragment_payload_survives_loss_bit_identical() {
    let cfg = fast_profile();
    let payload: Vec<u8> = (0..cfg.mss() * 5 + 123)
        .map(|i| (i * 131 % 251) as u8)
        .collect();
    let mut pair = Pair::new(cfg);
    let mut rng = StdRng::seed_from_u64(42);

    pair.a.send(Bytes::from(payload.clone())).unwrap();

    let mut delivered = None;
    for now in (0u32..60_000).step_by(10) {
        pair.exchange_lossy(now, &mut |_| rng.gen_bool(0.2));
        if let Some(msg) = pair.b.recv() {
            delivered = Some(msg);
            break;
        }
    }
    assert_eq!(delivered.expect("payload never arrived"), Bytes::from(payload));
}

#[test]
fn lost_acks_cause_retransmits_but_never_duplicate_delivery() {
    let mut pair = Pair::new(fast_profile());

    let total = 10u32;
    for i in 0..total {
        pair.a.send(Bytes::from(vec![i as u8; 64])).unwrap();
    }

    let mut got = Vec::new();
    for now in (0u32..20_000).step_by(10) {
        // eat the reverse path for the first two seconds so every push
        // times out at least once
        let kill_acks = now < 2_000;
        pair.a.update(now);
        pair.b.update(now);
        for (dgram, _) in pair.a_out.drain() {
            let _ = pair.b.input(dgram, now);
        }
        for (dgram, _) in pair.b_out.drain() {
            if !kill_acks {
                let _ = pair.a.input(dgram, now);
            }
        }
        while let Some(msg) = pair.b.recv() {
            got.push(msg);
        }
    }

    assert!(pair.a.stats().retransmissions > 0);
    assert_eq!(got.len() as u32, total);
    for (i, msg) in got.iter().enumerate() {
        assert_eq!(&msg[..], &vec![i as u8; 64][..], "order broke at {i}");
    }
}

#[test]
fn reordered_wire_still_yields_ordered_messages() {
    let mut pair = Pair::new(fast_profile());

    for i in 0..20u8 {
        pair.a.send(Bytes::from(vec![i; 32])).unwrap();
    }

    let mut got = Vec::new();
    for now in (0u32..10_000).step_by(10) {
        pair.a.update(now);
        pair.b.update(now);
        let mut forward = pair.a_out.drain();
        forward.reverse(); // adversarial reordering every step
        for (dgram, _) in forward {
            let _ = pair.b.input(dgram, now);
        }
        for (dgram, _) in pair.b_out.drain() {
            let _ = pair.a.input(dgram, now);
        }
        while let Some(msg) = pair.b.recv() {
            got.push(msg);
        }
    }

    assert_eq!(got.len(), 20);
    for (i, msg) in got.iter().enumerate() {
        assert_eq!(&msg[..], &vec![i as u8; 32][..]);
    }
}
