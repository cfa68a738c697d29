//! Ring rotation under the manual-completion transport: a committed slot is
//! never rewritten until the device signals it reusable.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use vgc_device::{Device, EmuTransport};
use vgc_stream::{CmdStream, StreamConfig, StreamError};

fn two_slot_config() -> StreamConfig {
    StreamConfig {
        ring_slots: 2,
        slot_words: 128,
        ..StreamConfig::default()
    }
}

/// Emit words until the active window is full, so the next reserve must
/// flush and rotate.
fn fill_window(stream: &mut CmdStream) {
    let n = stream.avail();
    stream.reserve(n).unwrap();
    for i in 0..n {
        stream.emit(i);
    }
}

#[test]
fn rotation_blocks_until_the_reuse_signal_fires() {
    let emu = Arc::new(EmuTransport::manual());
    let device = Device::new(emu.clone());
    let mut stream = CmdStream::with_observer(
        device,
        StreamConfig {
            wait_timeout: Some(Duration::from_millis(20)),
            ..two_slot_config()
        },
        None,
    )
    .unwrap();

    // Fill and commit slot 0; rotation to slot 1 succeeds because fresh
    // slots start reusable.
    fill_window(&mut stream);
    stream.reserve(1).unwrap();
    assert_eq!(stream.current_slot(), 1);

    // Fill slot 1 as well; the ring is now fully in flight, so the next
    // reserve must wait for slot 0's parked commit to retire.
    fill_window(&mut stream);
    let err = stream.reserve(1).unwrap_err();
    assert!(matches!(err, StreamError::Timeout { .. }));
    assert_eq!(stream.current_slot(), 1);
    assert_eq!(emu.parked_count(), 2);
    assert_eq!(emu.completed_fence(), 0);

    // Retire slot 0's submission; the same reserve now rotates.
    assert!(emu.complete_next());
    assert_eq!(emu.completed_fence(), 1);
    stream.reserve(1).unwrap();
    assert_eq!(stream.current_slot(), 0);
    assert_eq!(stream.offset(), 8);
}

#[test]
fn slot_with_multiple_commits_is_not_reused_until_the_last_retires() {
    let emu = Arc::new(EmuTransport::manual());
    let device = Device::new(emu.clone());
    let mut stream = CmdStream::with_observer(
        device,
        StreamConfig {
            wait_timeout: Some(Duration::from_millis(20)),
            ..two_slot_config()
        },
        None,
    )
    .unwrap();

    // Partial commit of slot 0, then a second commit that fills and
    // abandons it.
    stream.reserve(1).unwrap();
    stream.emit(1);
    stream.flush().unwrap();
    fill_window(&mut stream);
    stream.reserve(1).unwrap();
    assert_eq!(stream.current_slot(), 1);

    // With the ring fully in flight, retiring only slot 0's first commit
    // must not make the slot writable: its last covering commit is still
    // parked.
    fill_window(&mut stream);
    let err = stream.reserve(1).unwrap_err();
    assert!(matches!(err, StreamError::Timeout { .. }));
    assert!(emu.complete_next());
    assert_eq!(emu.completed_fence(), 1);
    let err = stream.reserve(1).unwrap_err();
    assert!(matches!(err, StreamError::Timeout { .. }));
    assert_eq!(stream.current_slot(), 1);

    // Once the abandoning commit retires, the slot becomes reusable.
    assert!(emu.complete_next());
    assert_eq!(emu.completed_fence(), 2);
    stream.reserve(1).unwrap();
    assert_eq!(stream.current_slot(), 0);
}

#[test]
fn two_slot_ring_cycles_sixty_four_word_batches() {
    let emu = Arc::new(EmuTransport::manual());
    let device = Device::new(emu.clone());
    let mut stream = CmdStream::with_observer(
        device,
        StreamConfig {
            wait_timeout: Some(Duration::from_millis(20)),
            ..two_slot_config()
        },
        None,
    )
    .unwrap();

    // The first 64-word batch fits in slot 0's fresh window.
    stream.reserve(64).unwrap();
    for i in 0..64 {
        stream.emit(i);
    }
    assert_eq!(stream.current_slot(), 0);

    // The second batch exceeds what remains of the 128-word slot once the
    // 8/8-word margins are reserved: slot 0 is committed and the stream
    // rotates to slot 1, which is reusable from construction, so no
    // blocking.
    stream.reserve(64).unwrap();
    assert_eq!(stream.current_slot(), 1);
    for i in 0..64 {
        stream.emit(i);
    }

    // The third batch wraps the ring back to slot 0, which is still in
    // flight, so the reserve blocks until its submissions retire.
    let err = stream.reserve(64).unwrap_err();
    assert!(matches!(err, StreamError::Timeout { .. }));
    emu.complete_all();
    stream.reserve(64).unwrap();
    assert_eq!(stream.current_slot(), 0);
    assert_eq!(stream.offset(), 8);
}

#[test]
fn reset_observer_runs_after_every_rotation() {
    let emu = Arc::new(EmuTransport::immediate());
    let device = Device::new(emu.clone());
    let resets = Arc::new(AtomicUsize::new(0));
    let counter = resets.clone();
    let mut stream = CmdStream::with_observer(
        device,
        two_slot_config(),
        Some(Box::new(move |_stream| {
            counter.fetch_add(1, Ordering::SeqCst);
        })),
    )
    .unwrap();

    // The initial rotation onto slot 0 already notified.
    assert_eq!(resets.load(Ordering::SeqCst), 1);

    fill_window(&mut stream);
    stream.reserve(1).unwrap();
    assert_eq!(stream.current_slot(), 1);
    assert_eq!(resets.load(Ordering::SeqCst), 2);

    // Partial flushes within a slot do not count as rotations.
    stream.emit(0);
    stream.flush().unwrap();
    assert_eq!(resets.load(Ordering::SeqCst), 2);
}

#[test]
fn observer_may_emit_into_the_fresh_slot() {
    let emu = Arc::new(EmuTransport::immediate());
    let device = Device::new(emu.clone());
    let mut stream = CmdStream::with_observer(
        device,
        two_slot_config(),
        Some(Box::new(|stream| {
            // Re-emit invalidated state at the head of every fresh buffer.
            stream.reserve(2).unwrap();
            stream.emit(0xDEAD_0001);
            stream.emit(0xDEAD_0002);
        })),
    )
    .unwrap();

    assert_eq!(stream.offset(), 10);
    stream.flush().unwrap();
    let submissions = emu.submissions();
    let region = submissions[0].region.as_ref().unwrap();
    assert_eq!(&region.words[8..10], &[0xDEAD_0001, 0xDEAD_0002]);
}
