//! Recovery scanner behavior over fabricated and interrupted flash states.

use mmrofs_core::{
    fnv1a32, is_capacity_mask, EntryState, FileCommit, FixedClock, Flash, FsError, Mmrofs,
    RamFlash, RawEntry, CLOCK_SENTINEL, DATA_REGION_START, ENTRY_COUNT, ENTRY_NONE, ENTRY_SIZE,
    FIRST_ENTRY, MTIME_UNSET,
};
use zerocopy::AsBytes;

const PART: u32 = 0x4_0000;
const NOW: u32 = 1_700_000_000;

fn mount(flash: RamFlash) -> Mmrofs<RamFlash> {
    Mmrofs::mount(flash, Box::new(FixedClock::new(NOW))).unwrap()
}

/// Program a full record (state byte included) into a virgin slot.
fn plant_entry(flash: &mut RamFlash, index: u32, entry: &RawEntry) {
    flash
        .program(index * ENTRY_SIZE as u32, entry.as_bytes())
        .unwrap();
}

fn plant_extent(flash: &mut RamFlash, offset: u32, name: &[u8], payload: &[u8]) {
    flash.program(offset, name).unwrap();
    flash.program(offset + name.len() as u32, payload).unwrap();
}

fn live_entry(entry: &RawEntry, state: EntryState) -> RawEntry {
    let mut e = *entry;
    e.state = state as u8;
    e
}

fn create_valid(fs: &mut Mmrofs<RamFlash>, name: &[u8], data: &[u8]) -> FileCommit {
    let c = fs.create_file(name, data).unwrap();
    fs.finalize(c.entry, name.len(), c.data_size).unwrap();
    c
}

#[test]
fn test_fresh_erased_partition_mounts_empty() {
    let mut fs = mount(RamFlash::new(PART));
    let stats = fs.scan_stats().unwrap();
    assert_eq!(stats.free, ENTRY_COUNT - FIRST_ENTRY);
    assert_eq!(stats.live(), 0);
    assert!(fs.next_live_entry(0).unwrap().is_none());
    assert!(fs.lookup(b"x").unwrap().is_none());
}

#[test]
fn test_uncommitted_states_are_tombstoned() {
    let mut flash = RamFlash::new(PART);
    let base = RawEntry::new(
        3,
        fnv1a32(b"log"),
        DATA_REGION_START,
        0xFFF,
        MTIME_UNSET,
        NOW - 10,
        ENTRY_NONE,
        ENTRY_NONE,
    );
    plant_entry(&mut flash, FIRST_ENTRY, &base); // ALLOCATING
    plant_entry(
        &mut flash,
        FIRST_ENTRY + 1,
        &live_entry(&base, EntryState::PendingData),
    );

    let fs = mount(flash);
    assert_eq!(fs.entry(FIRST_ENTRY).unwrap().state, EntryState::Tombstone as u8);
    assert_eq!(
        fs.entry(FIRST_ENTRY + 1).unwrap().state,
        EntryState::Tombstone as u8
    );
}

#[test]
fn test_crash_after_pending_data_loses_file_cleanly() {
    // Find the cut point where the entry just reached PENDING_DATA and no
    // extent byte has been programmed yet, then remount over it.
    let mut k = 0;
    loop {
        let mut fs = mount(RamFlash::new(PART));
        fs.flash_mut().arm_power_cut(k);
        let err = match fs.create_file(b"log", b"payload") {
            Err(e) => e,
            Ok(_) => panic!("create completed before reaching the probed state"),
        };
        assert!(matches!(err, FsError::PowerLoss));

        let mut flash = fs.into_flash();
        flash.disarm();

        let mut raw = [0u8; ENTRY_SIZE];
        flash.read(FIRST_ENTRY * ENTRY_SIZE as u32, &mut raw).unwrap();
        if raw[0] != EntryState::PendingData as u8 {
            k += 1;
            continue;
        }

        // Extent must still be erased.
        let mut block = [0u8; 64];
        flash.read(DATA_REGION_START, &mut block).unwrap();
        assert_eq!(block, [0xFF; 64]);

        let mut fs = mount(flash);
        assert_eq!(fs.entry(FIRST_ENTRY).unwrap().state, EntryState::Tombstone as u8);
        assert!(fs.lookup(b"log").unwrap().is_none());
        return;
    }
}

#[test]
fn test_crash_after_tombstoning_old_commits_replacement() {
    // Replace "cfg" = "AA" with "BB"; interrupt right after the new entry
    // programs TOMBSTONING_OLD. Recovery must finish the commit.
    let mut k = 0;
    loop {
        let mut fs = mount(RamFlash::new(PART));
        let c = create_valid(&mut fs, b"cfg", b"AA");
        let ctime = fs.entry(c.entry).unwrap().ctime.get();

        fs.flash_mut().arm_power_cut(k);
        match fs.update_file(c.entry, b"cfg", 0, ctime, b"BB") {
            Ok(_) => panic!("update completed before reaching the probed state"),
            Err(FsError::PowerLoss) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }

        let mut flash = fs.into_flash();
        flash.disarm();

        // Probe for: new entry in TOMBSTONING_OLD, old entry untouched.
        let new_slot = (FIRST_ENTRY..ENTRY_COUNT).find(|&i| {
            let mut raw = [0u8; ENTRY_SIZE];
            flash.read(i * ENTRY_SIZE as u32, &mut raw).unwrap();
            raw[0] == EntryState::TombstoningOld as u8
        });
        let mut old_raw = [0u8; ENTRY_SIZE];
        flash
            .read(c.entry * ENTRY_SIZE as u32, &mut old_raw)
            .unwrap();
        let (Some(new_slot), true) = (new_slot, old_raw[0] == EntryState::Valid as u8) else {
            k += 1;
            continue;
        };

        let mut fs = mount(flash);
        let (idx, e) = fs.lookup(b"cfg").unwrap().unwrap();
        assert_eq!(idx, new_slot);
        assert_eq!(e.state, EntryState::Valid as u8, "recovery promoted the new version");
        assert_eq!(fs.read_payload(&e).unwrap(), b"BB");
        assert_eq!(e.mtime.get(), NOW, "mtime was unset, so set in place");
        assert_eq!(fs.entry(c.entry).unwrap().state, EntryState::Tombstone as u8);
        return;
    }
}

#[test]
fn test_capacity_masked_size_is_inferred_from_extent() {
    let mut flash = RamFlash::new(PART);
    plant_extent(&mut flash, DATA_REGION_START, b"f", b"hello");
    let e = RawEntry::new(
        1,
        fnv1a32(b"f"),
        DATA_REGION_START,
        0xFFF,
        MTIME_UNSET,
        NOW - 100,
        ENTRY_NONE,
        ENTRY_NONE,
    );
    plant_entry(&mut flash, FIRST_ENTRY, &live_entry(&e, EntryState::Active));

    let mut fs = mount(flash);
    let (_, e) = fs.lookup(b"f").unwrap().unwrap();
    assert_eq!(e.state, EntryState::Valid as u8);
    assert_eq!(e.size.get(), 6);
    assert!(!is_capacity_mask(e.size.get()));
    assert_eq!(fs.read_payload(&e).unwrap(), b"hello");
    assert_eq!(e.mtime.get(), NOW);
}

#[test]
fn test_capacity_masked_empty_payload_infers_name_only() {
    let mut flash = RamFlash::new(PART);
    plant_extent(&mut flash, DATA_REGION_START, b"empty", b"");
    let e = RawEntry::new(
        5,
        fnv1a32(b"empty"),
        DATA_REGION_START,
        0xFFF,
        MTIME_UNSET,
        NOW - 100,
        ENTRY_NONE,
        ENTRY_NONE,
    );
    plant_entry(&mut flash, FIRST_ENTRY, &live_entry(&e, EntryState::Active));

    let mut fs = mount(flash);
    let (_, e) = fs.lookup(b"empty").unwrap().unwrap();
    assert_eq!(e.size.get(), 5);
    assert_eq!(fs.read_payload(&e).unwrap(), b"");
}

#[test]
fn test_torn_exact_size_is_rewritten() {
    let mut flash = RamFlash::new(PART);
    plant_extent(&mut flash, DATA_REGION_START, b"f", b"hello");
    // Recorded size claims 14 payload bytes beyond what the extent holds.
    let e = RawEntry::new(
        1,
        fnv1a32(b"f"),
        DATA_REGION_START,
        20,
        MTIME_UNSET,
        NOW - 100,
        ENTRY_NONE,
        ENTRY_NONE,
    );
    plant_entry(&mut flash, FIRST_ENTRY, &live_entry(&e, EntryState::Active));

    let mut fs = mount(flash);
    let (_, e) = fs.lookup(b"f").unwrap().unwrap();
    assert_eq!(e.size.get(), 6);
}

#[test]
fn test_short_all_ones_tail_is_not_treated_as_torn() {
    let mut flash = RamFlash::new(PART);
    plant_extent(&mut flash, DATA_REGION_START, b"f", b"hello");
    // One trailing 0xFF below the recorded size is within tolerance.
    let e = RawEntry::new(
        1,
        fnv1a32(b"f"),
        DATA_REGION_START,
        7,
        MTIME_UNSET,
        NOW - 100,
        ENTRY_NONE,
        ENTRY_NONE,
    );
    plant_entry(&mut flash, FIRST_ENTRY, &live_entry(&e, EntryState::Active));

    let mut fs = mount(flash);
    let (_, e) = fs.lookup(b"f").unwrap().unwrap();
    assert_eq!(e.size.get(), 7);
}

#[test]
fn test_possibly_torn_mtime_reallocates_entry() {
    let mut flash = RamFlash::new(PART);
    plant_extent(&mut flash, DATA_REGION_START, b"t", b"xy");
    let e = RawEntry::new(
        1,
        fnv1a32(b"t"),
        DATA_REGION_START,
        3,
        1234, // programmed, so possibly torn
        1000,
        ENTRY_NONE,
        ENTRY_NONE,
    );
    plant_entry(&mut flash, FIRST_ENTRY, &live_entry(&e, EntryState::Active));

    let mut fs = mount(flash);
    let (idx, e) = fs.lookup(b"t").unwrap().unwrap();
    assert_ne!(idx, FIRST_ENTRY, "repair consumed a fresh slot");
    assert_eq!(e.state, EntryState::Valid as u8);
    assert_eq!(e.mtime.get(), NOW, "mtime re-stamped from a trusted clock");
    assert_eq!(e.ctime.get(), 1000);
    assert_eq!(e.offset.get(), DATA_REGION_START, "same extent");
    assert_eq!(
        fs.entry(FIRST_ENTRY).unwrap().state,
        EntryState::Tombstone as u8
    );
    assert_eq!(fs.read_payload(&e).unwrap(), b"xy");
}

#[test]
fn test_torn_mtime_with_no_free_slot_leaves_entry_active() {
    let mut flash = RamFlash::new(PART);
    plant_extent(&mut flash, DATA_REGION_START, b"t", b"xy");
    let e = RawEntry::new(
        1,
        fnv1a32(b"t"),
        DATA_REGION_START,
        3,
        1234,
        1000,
        ENTRY_NONE,
        ENTRY_NONE,
    );
    plant_entry(&mut flash, FIRST_ENTRY, &live_entry(&e, EntryState::Active));
    // Exhaust every other slot.
    for i in FIRST_ENTRY + 1..ENTRY_COUNT {
        flash
            .program(i * ENTRY_SIZE as u32, &[EntryState::BadBlock as u8])
            .unwrap();
    }

    let mut fs = mount(flash);
    let (idx, e) = fs.lookup(b"t").unwrap().unwrap();
    assert_eq!(idx, FIRST_ENTRY);
    assert_eq!(e.state, EntryState::Active as u8);
    assert_eq!(fs.read_payload(&e).unwrap(), b"xy");
}

#[test]
fn test_corrupt_free_slot_and_unknown_state_are_erased() {
    let mut flash = RamFlash::new(PART);
    // FREE state byte with a programmed body byte.
    flash
        .program(FIRST_ENTRY * ENTRY_SIZE as u32 + 7, &[0x00])
        .unwrap();
    // A state byte no lifecycle step produces.
    flash
        .program((FIRST_ENTRY + 1) * ENTRY_SIZE as u32, &[0x5B])
        .unwrap();

    let fs = mount(flash);
    assert_eq!(fs.entry(FIRST_ENTRY).unwrap().state, EntryState::Erased as u8);
    assert_eq!(
        fs.entry(FIRST_ENTRY + 1).unwrap().state,
        EntryState::Erased as u8
    );
}

#[test]
fn test_invalid_valid_entry_is_tombstoned() {
    let mut flash = RamFlash::new(PART);
    let e = RawEntry::new(
        1,
        fnv1a32(b"x"),
        DATA_REGION_START + 1, // unaligned extent
        2,
        NOW,
        NOW,
        ENTRY_NONE,
        ENTRY_NONE,
    );
    plant_entry(&mut flash, FIRST_ENTRY, &live_entry(&e, EntryState::Valid));

    let fs = mount(flash);
    assert_eq!(fs.entry(FIRST_ENTRY).unwrap().state, EntryState::Tombstone as u8);
}

#[test]
fn test_clock_bootstrap_from_stored_timestamps() {
    let mut flash = RamFlash::new(PART);
    let stored = CLOCK_SENTINEL + 123_456;
    plant_extent(&mut flash, DATA_REGION_START, b"f", b"v");
    let e = RawEntry::new(
        1,
        fnv1a32(b"f"),
        DATA_REGION_START,
        2,
        stored,
        stored - 50,
        ENTRY_NONE,
        ENTRY_NONE,
    );
    plant_entry(&mut flash, FIRST_ENTRY, &live_entry(&e, EntryState::Valid));

    // Host boots thinking it is 1970.
    let mut fs = Mmrofs::mount(flash, Box::new(FixedClock::new(100))).unwrap();

    // A file created after mount carries the bootstrapped walltime.
    let c = fs.create_file(b"new", b"d").unwrap();
    fs.finalize(c.entry, 3, c.data_size).unwrap();
    let (_, e) = fs.lookup(b"new").unwrap().unwrap();
    assert!(e.ctime.get() >= stored);
}

#[test]
fn test_clock_not_touched_when_host_time_is_sane() {
    let mut fs = Mmrofs::mount(RamFlash::new(PART), Box::new(FixedClock::new(NOW))).unwrap();
    let c = fs.create_file(b"f", b"d").unwrap();
    fs.finalize(c.entry, 1, c.data_size).unwrap();
    let (_, e) = fs.lookup(b"f").unwrap().unwrap();
    assert_eq!(e.ctime.get(), NOW);
}

#[test]
fn test_recovery_is_idempotent_across_repeated_mounts() {
    let mut flash = RamFlash::new(PART);
    plant_extent(&mut flash, DATA_REGION_START, b"f", b"hello");
    let e = RawEntry::new(
        1,
        fnv1a32(b"f"),
        DATA_REGION_START,
        0xFFF,
        MTIME_UNSET,
        NOW - 100,
        ENTRY_NONE,
        ENTRY_NONE,
    );
    plant_entry(&mut flash, FIRST_ENTRY, &live_entry(&e, EntryState::Active));

    let mut flash = {
        let fs = mount(flash);
        fs.into_flash()
    };
    let snapshot = {
        let mut header = vec![0u8; (ENTRY_COUNT as usize) * ENTRY_SIZE];
        flash.read(0, &mut header).unwrap();
        header
    };

    // A second mount must change nothing.
    let fs = mount(flash);
    let mut header = vec![0u8; (ENTRY_COUNT as usize) * ENTRY_SIZE];
    fs.into_flash().read(0, &mut header).unwrap();
    assert_eq!(header, snapshot);
}
