//! # Record Store Behavior Tests
//!
//! End-to-end coverage of the record API against in-memory volumes:
//! round trips across the interesting payload sizes (inline, extent
//! boundary, linked chains), recid recycling, compare-and-swap
//! semantics, free-space accounting, and concurrent access through the
//! striped locks.

use recstore::{BytesSerializer, MemVolumeFactory, Store, StoreOptions, StrSerializer};

fn mem_store() -> Store {
    Store::open(&MemVolumeFactory, StoreOptions::default()).unwrap()
}

fn mem_store_with_mode(space_reclaim_mode: u8) -> Store {
    let options = StoreOptions {
        space_reclaim_mode,
        ..StoreOptions::default()
    };
    Store::open(&MemVolumeFactory, options).unwrap()
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

mod round_trip_tests {
    use super::*;

    #[test]
    fn first_record_is_recid_one() {
        let store = mem_store();

        let recid = store.put(&"hello".to_string(), &StrSerializer).unwrap();

        assert_eq!(recid, 1);
        assert_eq!(store.get(recid, &StrSerializer).unwrap().unwrap(), "hello");
        assert_eq!(store.max_recid().unwrap(), 1);
    }

    #[test]
    fn payload_size_battery() {
        let store = mem_store();

        let sizes = [1usize, 16, 100, 4096, 65_534, 65_535, 65_536, 100_000, 10_000_000];
        let recids: Vec<u64> = sizes
            .iter()
            .map(|&len| store.put(&patterned(len), &BytesSerializer).unwrap())
            .collect();

        for (&len, &recid) in sizes.iter().zip(&recids) {
            let back = store.get_raw(recid).unwrap().unwrap();
            assert_eq!(back.len(), len, "length for {len}-byte payload");
            assert_eq!(back, patterned(len), "content for {len}-byte payload");
        }
    }

    #[test]
    fn empty_payload_reads_back_absent() {
        let store = mem_store();

        let recid = store.put(&Vec::new(), &BytesSerializer).unwrap();

        assert_eq!(store.get_raw(recid).unwrap(), None);
    }

    #[test]
    fn linked_chain_preserves_every_byte() {
        let store = mem_store();
        let payload = vec![0xAB_u8; 200_000];

        let recid = store.put(&payload, &BytesSerializer).unwrap();

        let back = store.get_raw(recid).unwrap().unwrap();
        assert_eq!(back.len(), 200_000);
        assert!(back.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn distinct_records_do_not_interfere() {
        let store = mem_store();

        let recids: Vec<u64> = (0u8..50)
            .map(|i| store.put(&vec![i; 64 + i as usize], &BytesSerializer).unwrap())
            .collect();

        for (i, &recid) in recids.iter().enumerate() {
            assert_eq!(
                store.get_raw(recid).unwrap().unwrap(),
                vec![i as u8; 64 + i],
            );
        }
    }
}

mod update_and_delete_tests {
    use super::*;

    #[test]
    fn update_overwrites_and_reclaims() {
        let store = mem_store();
        let recid = store.put(&patterned(500), &BytesSerializer).unwrap();
        assert_eq!(store.free_size().unwrap(), 0);

        store.update(recid, &patterned(80), &BytesSerializer).unwrap();

        assert_eq!(store.get_raw(recid).unwrap().unwrap(), patterned(80));
        assert!(
            store.free_size().unwrap() > 0,
            "old extents must be returned to the free pool"
        );
    }

    #[test]
    fn update_of_chained_record_frees_the_whole_chain() {
        let store = mem_store();
        let recid = store.put(&patterned(200_000), &BytesSerializer).unwrap();

        store.update(recid, &patterned(10), &BytesSerializer).unwrap();

        assert_eq!(store.get_raw(recid).unwrap().unwrap(), patterned(10));
        // four extents of ~64 KiB each came back
        assert!(store.free_size().unwrap() >= 200_000);
    }

    #[test]
    fn delete_makes_the_record_absent() {
        let store = mem_store();
        let recid = store.put(&patterned(100), &BytesSerializer).unwrap();

        store.delete(recid).unwrap();

        assert_eq!(store.get_raw(recid).unwrap(), None);
        assert_eq!(store.free_recids().unwrap(), vec![recid]);
    }

    #[test]
    fn deleted_recid_is_reused_lifo() {
        let store = mem_store();
        let _a = store.put(&patterned(100), &BytesSerializer).unwrap();
        let b = store.put(&patterned(200), &BytesSerializer).unwrap();
        let c = store.put(&patterned(300), &BytesSerializer).unwrap();

        store.delete(b).unwrap();
        store.delete(c).unwrap();

        assert_eq!(store.put(&patterned(5), &BytesSerializer).unwrap(), c);
        assert_eq!(store.put(&patterned(5), &BytesSerializer).unwrap(), b);
    }

    #[test]
    fn same_size_put_after_delete_reuses_the_recid_and_extent() {
        let store = mem_store();
        for len in [100usize, 300] {
            store.put(&patterned(len), &BytesSerializer).unwrap();
        }
        let victim = store.put(&patterned(200), &BytesSerializer).unwrap();

        store.delete(victim).unwrap();
        // the extent occupies one 16-byte-rounded size class
        assert_eq!(store.free_size().unwrap(), 208);

        let replacement = store.put(&patterned(200), &BytesSerializer).unwrap();

        assert_eq!(replacement, victim);
        assert_eq!(store.get_raw(replacement).unwrap().unwrap(), patterned(200));
    }

    #[test]
    fn without_tracking_recids_strictly_increase() {
        let store = mem_store_with_mode(0);
        let a = store.put(&patterned(50), &BytesSerializer).unwrap();
        store.delete(a).unwrap();

        let b = store.put(&patterned(50), &BytesSerializer).unwrap();
        store.delete(b).unwrap();
        let c = store.put(&patterned(50), &BytesSerializer).unwrap();

        assert!(a < b && b < c);
        assert_eq!(store.free_size().unwrap(), 0);
        assert!(store.free_recids().unwrap().is_empty());
    }

    #[test]
    fn tracking_without_reuse_records_but_keeps_appending() {
        let store = mem_store_with_mode(2);
        let recid = store.put(&patterned(128), &BytesSerializer).unwrap();
        let tail = store.curr_size().unwrap();

        store.delete(recid).unwrap();
        assert!(store.free_size().unwrap() > 0);

        store.put(&patterned(128), &BytesSerializer).unwrap();
        assert!(
            store.curr_size().unwrap() > tail,
            "mode 2 must not reuse freed extents"
        );
    }
}

mod compare_and_swap_tests {
    use super::*;

    #[test]
    fn cas_misses_then_hits() {
        let store = mem_store();
        let recid = store.put(&"a".to_string(), &StrSerializer).unwrap();

        assert!(!store
            .compare_and_swap(recid, Some(&"b".to_string()), &"c".to_string(), &StrSerializer)
            .unwrap());
        assert_eq!(store.get(recid, &StrSerializer).unwrap().unwrap(), "a");

        assert!(store
            .compare_and_swap(recid, Some(&"a".to_string()), &"c".to_string(), &StrSerializer)
            .unwrap());
        assert_eq!(store.get(recid, &StrSerializer).unwrap().unwrap(), "c");
    }

    #[test]
    fn failed_cas_leaves_free_space_untouched() {
        let store = mem_store();
        let recid = store.put(&patterned(256), &BytesSerializer).unwrap();
        let free_before = store.free_size().unwrap();
        let tail_before = store.curr_size().unwrap();

        let swapped = store
            .compare_and_swap(recid, Some(&patterned(7)), &patterned(256), &BytesSerializer)
            .unwrap();

        assert!(!swapped);
        assert_eq!(store.free_size().unwrap(), free_before);
        assert_eq!(store.curr_size().unwrap(), tail_before);
    }

    #[test]
    fn cas_with_none_expectation_matches_deleted_record() {
        let store = mem_store();
        let recid = store.put(&"x".to_string(), &StrSerializer).unwrap();
        store.delete(recid).unwrap();

        assert!(!store
            .compare_and_swap(recid, Some(&"x".to_string()), &"y".to_string(), &StrSerializer)
            .unwrap());
        assert!(store
            .compare_and_swap(recid, None, &"y".to_string(), &StrSerializer)
            .unwrap());
        assert_eq!(store.get(recid, &StrSerializer).unwrap().unwrap(), "y");
    }
}

mod concurrency_tests {
    use super::*;

    #[test]
    fn parallel_writers_and_readers_stay_consistent() {
        let store = mem_store();

        std::thread::scope(|scope| {
            for thread in 0u8..8 {
                let store = &store;
                scope.spawn(move || {
                    let mut recids = Vec::new();
                    for i in 0..40usize {
                        let payload = vec![thread; 32 + i * 7];
                        let recid = store.put(&payload, &BytesSerializer).unwrap();
                        recids.push((recid, payload));
                    }
                    for (recid, payload) in &recids {
                        assert_eq!(store.get_raw(*recid).unwrap().unwrap(), *payload);
                    }
                    for (i, (recid, _)) in recids.iter().enumerate() {
                        if i % 3 == 0 {
                            store.delete(*recid).unwrap();
                        } else {
                            let fresh = vec![thread ^ 0xFF; 16 + i];
                            store.update(*recid, &fresh, &BytesSerializer).unwrap();
                            assert_eq!(store.get_raw(*recid).unwrap().unwrap(), fresh);
                        }
                    }
                });
            }
        });

        // every surviving record still reads cleanly after the storm
        let max = store.max_recid().unwrap();
        for recid in 1..=max {
            store.get_raw(recid).unwrap();
        }
    }

    #[test]
    fn concurrent_puts_hand_out_distinct_recids() {
        let store = mem_store();
        let mut all = Vec::new();

        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let store = &store;
                    scope.spawn(move || {
                        (0..100)
                            .map(|i| store.put(&vec![i as u8; 24], &BytesSerializer).unwrap())
                            .collect::<Vec<u64>>()
                    })
                })
                .collect();
            for handle in handles {
                all.extend(handle.join().unwrap());
            }
        });

        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 400, "recids must never be handed out twice");
    }
}

mod accounting_tests {
    use super::*;

    #[test]
    fn statistics_mentions_all_counters() {
        let store = mem_store();
        let recid = store.put(&patterned(1000), &BytesSerializer).unwrap();
        store.delete(recid).unwrap();

        let report = store.statistics().unwrap();

        assert!(report.contains("index_size="));
        assert!(report.contains("phys_size="));
        assert!(report.contains("free_size="));
        assert!(report.contains("free_recids=1"));
        assert!(report.contains("free extent bytes total="));
    }

    #[test]
    fn curr_size_tracks_the_phys_tail() {
        let store = mem_store();
        let before = store.curr_size().unwrap();

        store.put(&patterned(10_000), &BytesSerializer).unwrap();

        assert!(store.curr_size().unwrap() >= before + 10_000);
    }

    #[test]
    fn size_limit_rejects_growth() {
        let options = StoreOptions {
            size_limit: 4096,
            ..StoreOptions::default()
        };
        let store = Store::open(&MemVolumeFactory, options).unwrap();

        assert_eq!(store.size_limit(), 4096);
        store.put(&patterned(1000), &BytesSerializer).unwrap();
        assert!(store.put(&patterned(10_000), &BytesSerializer).is_err());
    }
}
