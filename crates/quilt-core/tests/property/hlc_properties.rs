//! Property-based tests for the hybrid logical clock.
//!
//! The clock MUST satisfy:
//! 1. Round-trip: `from_parts(ms, c).unix_ms() == ms` over the 40-bit range
//! 2. Monotonicity: locally produced values never decrease
//! 3. Causality: a value minted after `receive(r)` is strictly greater
//!    than `r`

use proptest::prelude::*;

use quilt_core::hlc::{Hlc, HlcClock, COUNTER_MAX, HLC_EPOCH_MS};

/// One step of clock traffic: a local mint or a remote merge.
#[derive(Debug, Clone)]
enum ClockOp {
    Create { advance_ms: i64 },
    Receive { remote: Hlc },
}

fn clock_op_strategy() -> impl Strategy<Value = ClockOp> {
    prop_oneof![
        (0..1_000i64).prop_map(|advance_ms| ClockOp::Create { advance_ms }),
        ((0..10_000_000i64), (0..100i64)).prop_map(|(ms, ctr)| ClockOp::Receive {
            remote: Hlc::from_parts(HLC_EPOCH_MS + ms, ctr),
        }),
    ]
}

proptest! {
    #[test]
    fn round_trip_from_parts(ms_offset in 0..(1i64 << 40), ctr in 0..=COUNTER_MAX) {
        let ms = HLC_EPOCH_MS + ms_offset;
        let hlc = Hlc::from_parts(ms, ctr);
        prop_assert_eq!(hlc.unix_ms(), ms);
        prop_assert_eq!(hlc.counter(), ctr);
    }

    #[test]
    fn local_values_never_decrease(ops in prop::collection::vec(clock_op_strategy(), 1..200)) {
        // Wall clock moves forward; remote traffic is arbitrary, including
        // timestamps far ahead of the local wall.
        let mut clock = HlcClock::new();
        let mut wall = HLC_EPOCH_MS;
        let mut previous = Hlc(0);
        for op in ops {
            match op {
                ClockOp::Create { advance_ms } => {
                    wall += advance_ms;
                    let minted = clock.create(wall);
                    prop_assert!(minted >= previous);
                    previous = minted;
                }
                ClockOp::Receive { remote } => clock.receive(remote),
            }
        }
    }

    #[test]
    fn create_beats_every_received_value(
        ms_offsets in prop::collection::vec((0..1_000_000i64, 0..50i64), 1..50),
        local_offset in 0..1_000_000i64,
    ) {
        let mut clock = HlcClock::new();
        let mut highest = Hlc(0);
        for (ms, ctr) in ms_offsets {
            let remote = Hlc::from_parts(HLC_EPOCH_MS + ms, ctr);
            clock.receive(remote);
            highest = highest.max(remote);
        }
        let minted = clock.create(HLC_EPOCH_MS + local_offset);
        prop_assert!(minted > highest);
    }
}
