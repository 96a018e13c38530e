mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use quickcheck::{Arbitrary, Gen, QuickCheck};
use rand::Rng;

use logseg::gc::{
    Copier, CopierState, CopyPipeline, GarbageCollector, GcDependencies,
    GcStatus,
};
use logseg::scheduler::{EventScheduler, ManualScheduler, WorkerScheduler};
use logseg::state::{StateManager, SystemState};
use logseg::{Error, GcMode, Rba, SegmentState};

use common::{Harness, block_pattern, small_config};

const STEPS: usize = 100_000;

fn start_copier(
    h: &Harness,
    scheduler: &Arc<ManualScheduler>,
) -> (Arc<Copier>, Arc<GcStatus>) {
    let status = Arc::new(GcStatus::new(4));
    let copier = Copier::new(&h.config, h.deps(scheduler.clone()), status.clone());
    copier.disable_threshold_check();
    scheduler.enqueue_event(copier.clone());
    (copier, status)
}

fn stop_copier(copier: &Arc<Copier>, scheduler: &ManualScheduler) {
    copier.stop();
    assert!(scheduler.run_until(STEPS, || !copier.is_stopped()));
    assert_eq!(copier.state(), CopierState::ReadyToEnd);
    copier.ready_to_end();
    assert!(scheduler.run_until_idle(STEPS));
}

fn assert_readable(h: &Harness, expected: &BTreeMap<Rba, u8>) {
    for (rba, version) in expected {
        assert_eq!(
            h.read(0, *rba),
            Some(block_pattern(h.config.block_size, 0, *rba, *version)),
            "contents of rba {}",
            rba
        );
    }
}

#[test]
fn copier_reclaims_a_victim_and_keeps_its_blocks() {
    common::setup_logger();
    let h = Harness::new(small_config());

    // segment 0 holds 0..16, then 0..12 move to segment 1
    h.write_blocks(0..16, 1);
    h.write_blocks(0..12, 2);
    assert_eq!(h.context.segment_state(0), SegmentState::Ssd);
    assert_eq!(h.context.segment_ctx().valid_block_count(0), 4);
    assert_eq!(h.context.current_gc_mode(), GcMode::NoGc);

    let scheduler = ManualScheduler::new();
    let (copier, status) = start_copier(&h, &scheduler);

    assert!(scheduler.run_until(STEPS, || {
        status.history().len() == 1 && copier.is_threshold_check_enabled()
    }));
    assert_eq!(h.context.segment_state(0), SegmentState::Free);

    let info = &status.history()[0];
    assert_eq!(info.segment_id, 0);
    assert_eq!(info.copied_block_count, 4);
    assert_eq!(info.invalid_block_count, 12);
    assert!(copier.is_threshold_check_enabled());
    assert_eq!(copier.copy_error_count(), 0);

    let mut expected: BTreeMap<Rba, u8> = (0..12).map(|rba| (rba, 2)).collect();
    expected.extend((12..16).map(|rba| (rba, 1)));
    assert_readable(&h, &expected);

    let all: Vec<Rba> = (0..16).collect();
    h.check_invariants(0, &all);

    stop_copier(&copier, &scheduler);
    assert!(copier.meta().stripe_manager().is_all_finished());
}

#[test]
fn stopping_pads_a_partial_gc_stripe() {
    common::setup_logger();
    let h = Harness::new(small_config());

    h.write_blocks(0..16, 1);
    h.write_blocks(0..14, 2);
    assert_eq!(h.context.segment_state(1), SegmentState::Ssd);
    assert_eq!(h.context.segment_ctx().valid_block_count(0), 2);

    let scheduler = ManualScheduler::new();
    let (copier, status) = start_copier(&h, &scheduler);
    assert!(scheduler.run_until(STEPS, || status.history().len() == 1));
    assert_eq!(h.context.segment_state(0), SegmentState::Free);

    // two copied blocks sit in a half written gc stripe in segment 2
    let segment_ctx = h.context.segment_ctx();
    assert_eq!(h.context.segment_state(2), SegmentState::Nvram);
    assert_eq!(segment_ctx.valid_block_count(2), 2);
    assert_eq!(segment_ctx.occupied_stripe_count(2), 0);
    assert!(!copier.meta().stripe_manager().is_all_finished());

    stop_copier(&copier, &scheduler);

    assert_eq!(segment_ctx.occupied_stripe_count(2), 1);
    let gc_stripe = h.context.address_info().first_stripe_of(2);
    let entries = h.reverse_map.persisted_entries(gc_stripe).unwrap();
    let rbas: Vec<Option<Rba>> = entries.iter().map(|e| e.map(|e| e.rba)).collect();
    assert_eq!(rbas, vec![Some(14), Some(15), None, None]);

    let mut expected: BTreeMap<Rba, u8> = (0..14).map(|rba| (rba, 2)).collect();
    expected.extend([(14, 1), (15, 1)]);
    assert_readable(&h, &expected);
    h.check_invariants(0, &(0..16).collect::<Vec<_>>());
}

#[test]
fn failed_copies_are_counted_and_the_victim_is_reset() {
    common::setup_logger();
    let h = Harness::new(small_config());
    h.write_blocks(0..16, 1);
    h.write_blocks(0..12, 2);

    let scheduler = ManualScheduler::new();
    let state = Arc::new(StateManager::new(SystemState::Normal));
    let gc = GarbageCollector::with_copier(
        &h.config,
        h.deps(scheduler.clone()),
        state.clone(),
    );
    gc.init().unwrap();
    gc.disable_threshold_check().unwrap();
    assert_eq!(
        gc.disable_threshold_check(),
        Err(Error::ThresholdCheckAlreadyDisabled)
    );

    h.device.set_fail_reads(true);
    assert!(scheduler.run_until(STEPS, || gc.status().history().len() == 1));
    assert_eq!(gc.copy_error_count(), 4);
    let info = &gc.status().history()[0];
    assert_eq!(info.segment_id, 0);
    assert_eq!(info.copied_block_count, 0);
    assert_eq!(info.invalid_block_count, 12);
    assert_eq!(h.context.segment_state(0), SegmentState::Victim);
    assert_eq!(h.context.segment_ctx().valid_block_count(0), 4);

    // shutdown waits for the copier, which only runs when driven here
    let ender = {
        let gc = gc.clone();
        thread::spawn(move || gc.shutdown())
    };
    let deadline = Instant::now() + Duration::from_secs(30);
    while !ender.is_finished() {
        assert!(Instant::now() < deadline, "gc shutdown hung");
        scheduler.run_one();
        thread::yield_now();
    }
    ender.join().unwrap();

    assert!(!gc.is_running());
    assert!(!gc.status().is_running());
    assert!(!state.is_subscribed("gc"));
    assert_eq!(h.context.segment_state(0), SegmentState::Ssd);

    h.device.set_fail_reads(false);
    let mut expected: BTreeMap<Rba, u8> = (0..12).map(|rba| (rba, 2)).collect();
    expected.extend((12..16).map(|rba| (rba, 1)));
    assert_readable(&h, &expected);
}

#[test]
fn overwrite_during_copy_keeps_the_newer_block() {
    common::setup_logger();
    let h = Harness::new(small_config());
    h.write_blocks(0..16, 1);
    h.write_blocks(0..12, 2);

    let scheduler = ManualScheduler::new();
    let (copier, status) = start_copier(&h, &scheduler);

    // the last victim stripe knows its valid blocks but has not copied
    assert!(scheduler.run_until(STEPS, || {
        copier.meta().victim_stripe(0, 3).valid_block_count() == 4
    }));
    assert_eq!(h.context.segment_state(0), SegmentState::Victim);
    h.write_stripe(0, &[12, 13], 3);

    assert!(scheduler.run_until(STEPS, || status.history().len() == 1));
    assert_eq!(h.context.segment_state(0), SegmentState::Free);

    let mut expected: BTreeMap<Rba, u8> = (0..12).map(|rba| (rba, 2)).collect();
    expected.extend([(12, 3), (13, 3), (14, 1), (15, 1)]);
    assert_readable(&h, &expected);
    h.check_invariants(0, &(0..16).collect::<Vec<_>>());

    stop_copier(&copier, &scheduler);
}

#[test]
fn background_gc_keeps_up_with_overwrites() {
    common::setup_logger();
    const LIVE: Rba = 24;

    let h = Harness::new(small_config());
    let scheduler = WorkerScheduler::start(h.config.scheduler_threads).unwrap();
    let state = Arc::new(StateManager::new(SystemState::Normal));
    let gc = GarbageCollector::with_copier(
        &h.config,
        h.deps(scheduler.clone()),
        state.clone(),
    );
    gc.init().unwrap();

    let mut rng = rand::rng();
    let mut expected: BTreeMap<Rba, u8> = BTreeMap::new();
    let per_stripe = h.context.address_info().blocks_per_stripe as usize;

    // far more stripes than the array holds
    for round in 0..200_u32 {
        let version = (round % 250) as u8 + 1;
        let mut rbas = vec![];
        while rbas.len() < per_stripe {
            let rba = rng.random_range(0..LIVE);
            if !rbas.contains(&rba) {
                rbas.push(rba);
            }
        }

        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            match h.try_write_stripe(0, &rbas, version) {
                Ok(_) => break,
                Err(Error::UserAllocationProhibited | Error::NoFreeSegment) => {}
                Err(e) => panic!("user write failed: {}", e),
            }
            assert!(Instant::now() < deadline, "gc never freed a segment");
            thread::sleep(Duration::from_millis(1));
        }
        for rba in rbas {
            expected.insert(rba, version);
        }
    }

    gc.shutdown();
    scheduler.shutdown();

    assert!(!gc.status().history().is_empty());
    assert_readable(&h, &expected);
    h.check_invariants(0, &(0..LIVE).collect::<Vec<_>>());
}

#[test]
fn user_writes_wait_for_gc_in_urgent_mode() {
    common::setup_logger();
    let h = Harness::new(small_config());
    let mut expected: BTreeMap<Rba, u8> = BTreeMap::new();

    // each segment gets three stripes of scratch blocks that the next
    // segment overwrites, and one stripe of blocks that stay live
    let mut filled = 0;
    'fill: for round in 0..8_u64 {
        let version = round as u8 + 1;
        let live: Vec<Rba> = (round * 4..round * 4 + 4).collect();
        let stripes = [
            (1000..1004).collect::<Vec<Rba>>(),
            (1004..1008).collect(),
            (1008..1012).collect(),
            live,
        ];
        for rbas in stripes {
            match h.try_write_stripe(0, &rbas, version) {
                Ok(_) => expected.extend(rbas.iter().map(|rba| (*rba, version))),
                Err(Error::UserAllocationProhibited) => break 'fill,
                Err(e) => panic!("user write failed: {}", e),
            }
        }
        filled += 1;
    }

    assert_eq!(filled, 7);
    assert_eq!(h.context.num_free_segments(), 1);
    assert_eq!(h.context.current_gc_mode(), GcMode::Urgent);
    assert!(h.context.is_user_blk_alloc_prohibited());
    assert_eq!(
        h.try_write_stripe(0, &[5000], 9),
        Err(Error::UserAllocationProhibited)
    );
    assert_eq!(h.context.num_free_segments(), 1);

    let scheduler = ManualScheduler::new();
    let status = Arc::new(GcStatus::new(4));
    let copier = Copier::new(&h.config, h.deps(scheduler.clone()), status);
    scheduler.enqueue_event(copier.clone());

    assert!(scheduler.run_until(STEPS, || {
        !h.context.is_user_blk_alloc_prohibited()
    }));
    assert_ne!(h.context.current_gc_mode(), GcMode::Urgent);

    h.write_stripe(0, &[5000, 5001], 9);
    expected.extend([(5000, 9), (5001, 9)]);

    stop_copier(&copier, &scheduler);

    let all: Vec<Rba> = expected.keys().copied().collect();
    assert_readable(&h, &expected);
    h.check_invariants(0, &all);
}

#[derive(Debug, Clone)]
enum Op {
    Write { first: Rba, version: u8 },
    Collect,
}

impl Arbitrary for Op {
    fn arbitrary(g: &mut Gen) -> Op {
        if u8::arbitrary(g) % 3 == 0 {
            Op::Collect
        } else {
            Op::Write { first: Rba::arbitrary(g) % 20, version: u8::arbitrary(g) }
        }
    }
}

fn prop_collection_preserves_counters_and_data(ops: Vec<Op>) -> bool {
    let h = Harness::new(small_config());
    let scheduler = ManualScheduler::new();
    let deps: GcDependencies = h.deps(scheduler.clone());
    let status = Arc::new(GcStatus::new(4));
    let copier = Copier::new(&h.config, deps, status);
    scheduler.enqueue_event(copier.clone());

    let mut expected = BTreeMap::new();
    let all: Vec<Rba> = (0..24).collect();

    for op in ops {
        match op {
            Op::Write { first, version } => {
                let rbas: Vec<Rba> = (first..first + 4).collect();
                if h.try_write_stripe(0, &rbas, version).is_ok() {
                    for rba in rbas {
                        expected.insert(rba, version);
                    }
                }
            }
            Op::Collect => {
                copier.disable_threshold_check();
                scheduler.run_until(1_000, || {
                    copier.is_threshold_check_enabled()
                        && copier.meta().is_all_victim_segment_copy_done()
                });
            }
        }
        h.check_invariants(0, &all);
        assert_readable(&h, &expected);
    }

    stop_copier(&copier, &scheduler);
    h.check_invariants(0, &all);
    assert_readable(&h, &expected);
    true
}

#[test]
fn quickcheck_collection_preserves_counters_and_data() {
    QuickCheck::new()
        .r#gen(Gen::new(40))
        .tests(100)
        .max_tests(1000)
        .quickcheck(prop_collection_preserves_counters_and_data as fn(Vec<Op>) -> bool);
}
