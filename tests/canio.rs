mod common;

use canbridge::canio::{self, CanIo, CanIoFlags};
use common::MockBus;

fn max_flags() -> CanIoFlags {
    CanIoFlags {
        pot: 4095,
        pot2: 4095,
        canio: 0x3F,
        cruisespeed: 16383,
        regenpreset: 255,
    }
}

#[test]
fn boundary_values_round_trip_without_overflow() {
    let packed = canio::pack(&max_flags(), 3, false);
    let (flags, counter, marker) = canio::unpack(&packed);
    assert_eq!(flags, max_flags());
    assert_eq!(counter, 3);
    assert_eq!(marker, 0);
}

#[test]
fn oversized_fields_are_clamped_not_smeared() {
    let flags = CanIoFlags {
        pot: 0xFFFF,
        pot2: 0,
        canio: 0xFF,
        cruisespeed: 0xFFFF,
        regenpreset: 255,
    };
    let packed = canio::pack(&flags, 0, false);
    let (decoded, counter, _) = canio::unpack(&packed);
    // neighbors stay clean
    assert_eq!(decoded.pot, 0xFFF);
    assert_eq!(decoded.pot2, 0);
    assert_eq!(decoded.canio, 0x3F);
    assert_eq!(decoded.cruisespeed, 0x3FFF);
    assert_eq!(counter, 0);
}

#[test]
fn crc_marker_verifies_and_detects_corruption() {
    let packed = canio::pack(&max_flags(), 1, true);
    assert!(canio::verify(&packed));

    let mut corrupted = packed;
    corrupted[0] ^= 0x01;
    assert!(!canio::verify(&corrupted));
}

#[test]
fn marker_bits_are_zero_without_crc() {
    let packed = canio::pack(&max_flags(), 2, false);
    let word = u64::from_le_bytes(packed);
    assert_eq!(word >> 54, 0);
}

fn counters_of(frames: &[canbridge::Frame]) -> Vec<u8> {
    frames
        .iter()
        .map(|f| canio::unpack(&f.data).1)
        .collect()
}

#[test]
fn counter_walks_a_permutation_starting_at_one() {
    let mut bus = MockBus::new();
    let mut canio = CanIo::new();
    canio.start(0x123, max_flags(), 10, false);
    for t in 0..4 {
        canio.send_if_due(&mut bus, 1 + t * 10);
    }
    assert_eq!(counters_of(&bus.sent()), vec![1, 2, 3, 0]);
}

#[test]
fn restart_resets_the_counter_to_one() {
    let mut bus = MockBus::new();
    let mut canio = CanIo::new();
    canio.start(0x123, max_flags(), 10, false);
    for t in 0..4 {
        canio.send_if_due(&mut bus, 1 + t * 10);
    }
    canio.stop();
    canio.start(0x123, max_flags(), 10, false);
    bus.clear_sent();
    canio.send_if_due(&mut bus, 100);
    // a replayed final frame from the previous session (counter 0) can
    // never match the first frame of this one
    assert_eq!(counters_of(&bus.sent()), vec![1]);
}

#[test]
fn update_flags_is_ignored_while_stopped() {
    let mut bus = MockBus::new();
    let mut canio = CanIo::new();
    canio.update_flags(max_flags());
    assert!(!canio.is_active());
    canio.send_if_due(&mut bus, 50);
    assert!(bus.sent().is_empty());
}

#[test]
fn update_flags_replaces_the_live_tuple() {
    let mut bus = MockBus::new();
    let mut canio = CanIo::new();
    canio.start(0x123, CanIoFlags::default(), 10, false);
    canio.update_flags(max_flags());
    canio.send_if_due(&mut bus, 20);
    let sent = bus.sent();
    let (flags, _, _) = canio::unpack(&sent[0].data);
    assert_eq!(flags, max_flags());
}

#[test]
fn respects_the_period() {
    let mut bus = MockBus::new();
    let mut canio = CanIo::new();
    canio.start(0x123, max_flags(), 100, false);
    canio.send_if_due(&mut bus, 10);
    canio.send_if_due(&mut bus, 50); // too early
    canio.send_if_due(&mut bus, 111);
    assert_eq!(bus.sent().len(), 2);
}

#[test]
fn busy_tx_does_not_burn_a_counter() {
    let mut bus = MockBus::new();
    let mut canio = CanIo::new();
    canio.start(0x123, max_flags(), 10, false);
    bus.set_tx_full(true);
    canio.send_if_due(&mut bus, 10);
    bus.set_tx_full(false);
    canio.send_if_due(&mut bus, 20);
    assert_eq!(counters_of(&bus.sent()), vec![1]);
}

#[test]
fn wire_frame_is_full_length_with_verifiable_marker() {
    let mut bus = MockBus::new();
    let mut canio = CanIo::new();
    canio.start(0x123, max_flags(), 10, true);
    canio.send_if_due(&mut bus, 10);
    let sent = bus.sent();
    assert_eq!(sent[0].dlc, 8);
    assert_eq!(sent[0].id, 0x123);
    assert!(canio::verify(&sent[0].data));
}
