//! Multi-channel storage GC scenarios.
//!
//! These tests drive whole channels (store ingestion, marking, sweeping,
//! housekeeping) against in-memory I/O, both stepped deterministically and
//! from real channel threads.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::*;
use marmot_storage::config::StorageConfiguration;

#[test]
fn test_cross_channel_reference_marking_order() {
    let config = configuration(2);
    let (monitor, mut channels) = build_storage(&config);

    // X (channel 0) is the root and holds the sole reference to the
    // reference-free Y (channel 1)
    let x = 1_000_000_002;
    let y = 1_000_000_003;
    store(
        &mut channels,
        vec![record(x, ROOT_TID, &[y]), record(y, BLOB_TID, &[])],
    );

    // Y is reference-free, so the store itself enqueued nothing for
    // channel 1; its queue only ever fills through channel 0's marking
    assert_eq!(monitor.queue(1).size(), 0);
    // with marks pending globally, channel 1 cannot legally begin sweeping
    assert!(!monitor.needs_sweep(1).unwrap());

    // channel 0 drains its queue, routing Y into channel 1's queue
    channels[0]
        .incremental_garbage_collection(far_deadline())
        .unwrap();
    assert_eq!(monitor.queue(1).size(), 1);
    assert!(!monitor.needs_sweep(1).unwrap());

    // only after channel 1 marks Y can a sweep be initiated at all
    run_gc_to_completion(&monitor, &mut channels);
    assert!(channels[0].contains_entity(x));
    assert!(channels[1].contains_entity(y));
    assert!(monitor.gc_cold_generation() >= 1);
}

#[test]
fn test_store_during_in_flight_sweep() {
    let config = configuration(2);
    let (monitor, mut channels) = build_storage(&config);

    let root = 1_000_000_002;
    store(&mut channels, vec![record(root, ROOT_TID, &[])]);

    // channel 0 finishes its marking; channel 1 then initiates the sweep
    // and completes its own share, leaving channel 0's sweep in flight
    channels[0]
        .incremental_garbage_collection(far_deadline())
        .unwrap();
    channels[1]
        .incremental_garbage_collection(far_deadline())
        .unwrap();
    assert!(monitor.is_pending_sweep(0));

    // a store arrives while the sweep is in flight: the pending-store
    // protocol runs, and the new entity is marked for survival without
    // being enqueued into the epoch already in flight
    let stored_mid_sweep = 1_000_000_004;
    channels[0].register_pending_store_update();
    assert!(!monitor.is_marking_complete());
    channels[0]
        .post_store_put_entities(vec![record(stored_mid_sweep, NODE_TID, &[])])
        .unwrap();
    assert_eq!(monitor.queue(0).size(), 0);
    assert!(!monitor.is_complete(0));

    // channel 0 performs its pending sweep: the mid-sweep store survives
    channels[0]
        .incremental_garbage_collection(far_deadline())
        .unwrap();
    assert!(channels[0].contains_entity(stored_mid_sweep));

    // the stored entity is unreachable from the root, so the following
    // epochs (where it participates in marking normally) collect it
    run_gc_to_completion(&monitor, &mut channels);
    assert!(channels[0].contains_entity(root));
    assert!(!channels[0].contains_entity(stored_mid_sweep));
}

#[test]
fn test_budgeted_marking_makes_durable_progress() {
    let config = configuration(1);
    let (monitor, mut channels) = build_storage(&config);

    // a root referencing a long chain plus some garbage
    let root = 1_000_000_000;
    let chain: Vec<u64> = (1..200u64).map(|i| 1_000_000_000 + i).collect();
    let mut records = vec![record(root, ROOT_TID, &[chain[0]])];
    for window in chain.windows(2) {
        records.push(record(window[0], NODE_TID, &[window[1]]));
    }
    records.push(record(*chain.last().unwrap(), NODE_TID, &[]));
    for i in 0..50u64 {
        records.push(record(1_000_000_500 + i, BLOB_TID, &[i]));
    }
    store(&mut channels, records);
    let total = channels[0].entity_count();

    // zero-budget calls still make progress (at least one id each) and
    // never lose epoch state
    let mut rounds = 0;
    while !monitor.is_complete(0) {
        channels[0]
            .incremental_garbage_collection(Instant::now())
            .unwrap();
        rounds += 1;
        assert!(rounds < 100_000, "budgeted GC made no progress");
    }

    // chain and root survive, garbage blobs are gone
    assert_eq!(channels[0].entity_count(), total - 50);
    assert!(channels[0].contains_entity(root));
    assert!(channels[0].contains_entity(*chain.last().unwrap()));
    assert!(!channels[0].contains_entity(1_000_000_500));
}

#[test]
fn test_concurrent_channel_threads_converge() {
    let config = configuration(4);
    let (monitor, mut channels) = build_storage(&config);

    // root on channel 0 referencing one node per channel, each of which
    // references a second-layer node; plus one garbage entity per channel
    let root = 1_000_000_004;
    let layer_one: Vec<u64> = (0..4u64).map(|i| 1_000_000_016 + i).collect();
    let layer_two: Vec<u64> = (0..4u64).map(|i| 1_000_000_032 + i).collect();
    let garbage: Vec<u64> = (0..4u64).map(|i| 1_000_000_064 + i).collect();

    let mut records = vec![record(root, ROOT_TID, &layer_one)];
    for (one, two) in layer_one.iter().zip(&layer_two) {
        records.push(record(*one, NODE_TID, &[*two]));
    }
    for two in &layer_two {
        records.push(record(*two, NODE_TID, &[]));
    }
    for g in &garbage {
        records.push(record(*g, NODE_TID, &[]));
    }
    store(&mut channels, records);

    let handles: Vec<_> = channels
        .into_iter()
        .map(|mut channel| {
            let monitor = Arc::clone(&monitor);
            std::thread::spawn(move || {
                let giving_up = Instant::now() + Duration::from_secs(20);
                while !monitor.is_complete(channel.channel_index()) {
                    assert!(Instant::now() < giving_up, "GC did not converge");
                    channel
                        .issued_garbage_collection(Instant::now() + Duration::from_millis(20))
                        .unwrap();
                }
                channel
            })
        })
        .collect();
    let channels: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(monitor.gc_cold_generation() >= 1);
    for (index, channel) in channels.iter().enumerate() {
        assert!(!channel.contains_entity(garbage[0] + index as u64));
    }
    let live: u64 = channels.iter().map(|c| c.entity_count()).sum();
    assert_eq!(live, 1 + 4 + 4);
}

#[test]
fn test_sweep_completeness_across_channels() {
    let config = configuration(2);
    let (monitor, mut channels) = build_storage(&config);

    // two independent subgraphs; only one is rooted
    let root = 1_000_000_002;
    let kept: Vec<u64> = (0..10u64).map(|i| 1_000_000_010 + i).collect();
    let doomed: Vec<u64> = (0..10u64).map(|i| 1_000_000_050 + i).collect();

    let mut records = vec![record(root, ROOT_TID, &kept)];
    for oid in &kept {
        records.push(record(*oid, NODE_TID, &[]));
    }
    // the doomed subgraph is fully interconnected, but unrooted
    for oid in &doomed {
        records.push(record(*oid, NODE_TID, &doomed));
    }
    store(&mut channels, records);

    run_gc_to_completion(&monitor, &mut channels);

    for oid in &kept {
        let channel = (*oid & 1) as usize;
        assert!(channels[channel].contains_entity(*oid));
    }
    for oid in &doomed {
        let channel = (*oid & 1) as usize;
        assert!(!channels[channel].contains_entity(*oid));
    }
    assert_eq!(
        channels.iter().map(|c| c.entity_count()).sum::<u64>(),
        1 + kept.len() as u64
    );
}

#[test]
fn test_housekeeping_consolidates_after_collection() {
    let mut config = configuration(1);
    config.data_files.file_minimum_size = 1024;
    config.data_files.file_maximum_size = 4096;
    let (monitor, mut channels) = build_storage(&config);

    // large garbage fills files; the root keeps a small node alive
    let root = 1_000_000_000;
    let kept = 1_000_000_001;
    let mut records = vec![
        record(root, ROOT_TID, &[kept]),
        record(kept, NODE_TID, &[root]),
    ];
    for i in 0..8u64 {
        records.push(record(1_000_000_100 + i, BLOB_TID, &[0xAB; 128])); // 1 KiB each
    }
    store(&mut channels, records);
    assert!(channels[0].file_summaries().len() > 1);

    run_gc_to_completion(&monitor, &mut channels);

    // repeated housekeeping shrinks the file ring down to live data
    let budgets = config.housekeeping.clone();
    for _ in 0..100 {
        if channels[0].housekeeping(&budgets).unwrap() {
            break;
        }
    }
    let summaries = channels[0].file_summaries();
    let total: u64 = summaries.iter().map(|s| s.total_length).sum();
    let live: u64 = summaries.iter().map(|s| s.data_length).sum();
    assert_eq!(live, 16);
    assert_eq!(total, live);
    assert!(channels[0].contains_entity(kept));

    // the collection left the GC cold until the next store
    assert!(monitor.is_complete(0));
}

#[test]
fn test_configuration_serde_roundtrip() {
    let mut config = configuration(4);
    config.entity_cache.timeout_ms = 3_600_000;
    config.data_files.minimum_use_ratio = 0.6;

    let json = serde_json::to_string(&config).unwrap();
    let parsed: StorageConfiguration = serde_json::from_str(&json).unwrap();
    parsed.validate().unwrap();
    assert_eq!(parsed.channel_count, 4);
    assert_eq!(parsed.entity_cache.timeout_ms, 3_600_000);
    assert_eq!(parsed.data_files.minimum_use_ratio, 0.6);
    assert_eq!(parsed.root_type_id, ROOT_TID);
}
