//! Property-based tests for the accounting and reference-count invariants.

use std::sync::Arc;

use bytes::Bytes;
use dedup_storage::metastore::MemoryStore;
use dedup_storage::{ByteStream, DedupStore, FsBlobStore, Scope, SharedMetrics};
use proptest::prelude::*;

fn body(payload: Vec<u8>) -> ByteStream {
    Box::pin(futures::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from(payload))]))
}

/// Small pool of payloads so that generated uploads collide often.
fn any_upload() -> impl Strategy<Value = (u8, u8)> {
    (0u8..4, 0u8..6)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Stored size never exceeds logical size, and they are equal exactly
    /// when no two files share a payload.
    #[test]
    fn stored_never_exceeds_logical(
        uploads in proptest::collection::vec(any_upload(), 0..24),
        deletes in proptest::collection::vec(any::<prop::sample::Index>(), 0..12),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let blobs = FsBlobStore::new(dir.path(), SharedMetrics::default()).unwrap();
            let store = DedupStore::with_parts(
                Arc::new(MemoryStore::new()),
                Arc::new(blobs),
                SharedMetrics::default(),
                None,
            )
            .unwrap();

            let mut ids = Vec::new();
            for (owner, content) in &uploads {
                let payload = vec![*content; (*content as usize + 1) * 10];
                let r = store
                    .upload(&format!("owner{owner}"), "f", "", body(payload), None)
                    .await
                    .unwrap();
                ids.push(r.file.id);
            }
            for idx in &deletes {
                if ids.is_empty() {
                    break;
                }
                let id = ids.remove(idx.index(ids.len()));
                store.delete(&id).await.unwrap();
            }

            let stats = store.stats(&Scope::Global).unwrap();
            prop_assert!(stats.actual_stored_size <= stats.total_logical_size);
            prop_assert_eq!(
                stats.actual_stored_size == stats.total_logical_size,
                stats.duplicate_files == 0
            );
            prop_assert_eq!(stats.total_files as usize, ids.len());

            for owner in 0..4u8 {
                let s = store.stats(&Scope::Owner(format!("owner{owner}"))).unwrap();
                prop_assert!(s.actual_stored_size <= s.total_logical_size);
            }

            // every count equals the number of live files for its digest
            let report = store.check(false).await.unwrap();
            prop_assert!(report.is_clean(), "{:?}", report);
            prop_assert_eq!(store.blobs().list().await.unwrap().len() as u64, stats.unique_files);
            Ok(())
        })?;
    }
}
