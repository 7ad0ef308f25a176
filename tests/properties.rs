//! Property tests for hashing, batch resolution and eviction.

use proptest::prelude::*;
use screener_cache::clock::ManualClock;
use screener_cache::fingerprint::normalize_text;
use screener_cache::storage::MemoryStorage;
use screener_cache::{
    fingerprint_file, hash_structured, hash_text, AnalysisContext, CacheConfig, CacheKey,
    CacheStore, FileDescriptor, HardFilters,
};
use std::rc::Rc;

fn arb_file() -> impl Strategy<Value = FileDescriptor> {
    ("[a-z]{1,8}\\.pdf", 0u64..10_000, 0i64..2_000_000_000_000)
        .prop_map(|(name, size, modified)| FileDescriptor::new(name, size, modified))
}

fn context() -> AnalysisContext {
    AnalysisContext {
        jd_hash: hash_text("jd"),
        weights_hash: hash_text("weights"),
        filters_hash: hash_text("filters"),
    }
}

fn store(capacity: usize) -> CacheStore<u32> {
    CacheStore::new(
        Rc::new(MemoryStorage::new()),
        Rc::new(ManualClock::new(0)),
        CacheConfig::default().with_capacity(capacity).unwrap(),
    )
}

proptest! {
    #[test]
    fn text_hash_ignores_whitespace_layout(
        words in prop::collection::vec("[a-zA-Z0-9]{1,6}", 1..8),
        gap in "[ \t\n]{1,3}",
    ) {
        let single = words.join(" ");
        let spread = format!("{gap}{}{gap}", words.join(gap.as_str()));
        prop_assert_eq!(hash_text(&single), hash_text(&spread));
    }

    #[test]
    fn distinct_normalised_texts_hash_differently(a in "[a-z ]{0,20}", b in "[a-z ]{0,20}") {
        prop_assume!(normalize_text(&a) != normalize_text(&b));
        prop_assert_ne!(hash_text(&a), hash_text(&b));
    }

    #[test]
    fn file_fingerprint_tracks_every_metadata_field(file in arb_file(), bump in 1u64..100) {
        let base = fingerprint_file(&file).unwrap();
        prop_assert_eq!(&base, &fingerprint_file(&file.clone()).unwrap());

        let resized = FileDescriptor::new(file.name.clone(), file.size + bump, file.last_modified);
        let touched =
            FileDescriptor::new(file.name.clone(), file.size, file.last_modified + bump as i64);
        let renamed = FileDescriptor::new(format!("{}x", file.name), file.size, file.last_modified);
        prop_assert_ne!(&base, &fingerprint_file(&resized).unwrap());
        prop_assert_ne!(&base, &fingerprint_file(&touched).unwrap());
        prop_assert_ne!(&base, &fingerprint_file(&renamed).unwrap());
    }

    #[test]
    fn filter_changes_change_the_hash(min_exp in "[0-9]{1,2}", other in "[0-9]{1,2}") {
        prop_assume!(min_exp != other);
        let a = HardFilters { min_exp, ..HardFilters::default() };
        let b = HardFilters { min_exp: other, ..HardFilters::default() };
        prop_assert_ne!(hash_structured(&a).unwrap(), hash_structured(&b).unwrap());
    }

    #[test]
    fn resolve_partitions_every_file_in_order(
        files in prop::collection::vec(arb_file(), 0..12),
        cached_mask in prop::collection::vec(any::<bool>(), 12),
    ) {
        let store = store(100);
        let ctx = context();
        for (i, file) in files.iter().enumerate() {
            if cached_mask[i] {
                store.put(&CacheKey::for_file(file, &ctx).unwrap(), &(i as u32));
            }
        }

        let resolution = screener_cache::resolver::resolve(&store, &files, &ctx);
        prop_assert_eq!(resolution.total(), files.len());

        // Interleaving the two lists back by cache membership reproduces the input.
        let mut cached = resolution.cached.iter().map(|hit| &hit.file);
        let mut uncached = resolution.uncached.iter();
        for file in &files {
            let key = CacheKey::for_file(file, &ctx).unwrap();
            let next = if store.peek(&key).is_some() { cached.next() } else { uncached.next() };
            prop_assert_eq!(next, Some(file));
        }
        prop_assert!(cached.next().is_none());
        prop_assert!(uncached.next().is_none());
    }

    #[test]
    fn store_never_exceeds_capacity(capacity in 1usize..6, inserts in 1usize..15) {
        let store = store(capacity);
        let ctx = context();
        let keys: Vec<CacheKey> = (0..inserts)
            .map(|i| FileDescriptor::new(format!("f{i}.pdf"), i as u64, 0))
            .map(|file| CacheKey::for_file(&file, &ctx).unwrap())
            .collect();
        for (i, key) in keys.iter().enumerate() {
            store.put(key, &(i as u32));
            prop_assert!(store.len() <= capacity);
        }

        // The survivors are exactly the most recent insertions.
        let kept = inserts.min(capacity);
        for (i, key) in keys.iter().enumerate() {
            prop_assert_eq!(store.peek(key).is_some(), i >= inserts - kept);
        }
    }
}
