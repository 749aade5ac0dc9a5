//! Read-mostly publication of the current ring snapshot.

use std::sync::Arc;

use arc_swap::ArcSwap;
use futures::future::BoxFuture;
use tokio::sync::Mutex;

use crate::errors::TokenMetadataError;
use crate::locator::token_metadata::TokenMetadata;

/// Publishes the current [`TokenMetadata`] snapshot of one worker.
///
/// Readers grab the published pointer in O(1) and use the snapshot
/// without any coordination for as long as they wish; a published
/// snapshot is never modified. Mutators are serialized behind an
/// exclusive lock and commit through a clone-mutate-publish cycle, so
/// the committed sequence of ring versions is strictly monotonic.
pub struct SharedTokenMetadata {
    shared: ArcSwap<TokenMetadata>,
    lock: Mutex<()>,
}

impl SharedTokenMetadata {
    pub fn new(initial: TokenMetadata) -> Self {
        Self {
            shared: ArcSwap::from_pointee(initial),
            lock: Mutex::new(()),
        }
    }

    /// The currently published snapshot.
    pub fn get(&self) -> Arc<TokenMetadata> {
        self.shared.load_full()
    }

    /// Publishes `metadata`, refusing any non-increasing ring version.
    pub(crate) fn set(&self, metadata: Arc<TokenMetadata>) -> Result<(), TokenMetadataError> {
        let current = self.shared.load();
        if current.get_ring_version() >= metadata.get_ring_version() {
            return Err(TokenMetadataError::InvariantViolation(format!(
                "must not set non-increasing ring version: {} -> {}",
                current.get_ring_version(),
                metadata.get_ring_version()
            )));
        }
        self.shared.store(metadata);
        Ok(())
    }

    /// Clones the current snapshot, bumps its ring version, applies
    /// `func` and publishes the result.
    ///
    /// On any failure before publication the current snapshot is
    /// preserved unchanged, the partially built clone is discarded and
    /// the lock is released.
    pub async fn mutate_token_metadata<F>(&self, func: F) -> Result<(), TokenMetadataError>
    where
        F: for<'a> FnOnce(&'a mut TokenMetadata) -> BoxFuture<'a, Result<(), TokenMetadataError>>,
    {
        let _lock = self.lock.lock().await;
        let mut metadata = self.get().clone_async().await;
        // Bump the ring version before mutating so that cached
        // token/replication mappings are invalidated when the modified
        // metadata is committed.
        metadata.invalidate_cached_rings();
        func(&mut metadata).await?;
        self.set(Arc::new(metadata))
    }

    /// Applies one mutation and publishes the result on every worker.
    ///
    /// `shards[0]` is the designated coordinator: the mutation runs once
    /// against its snapshot, then every other worker receives an
    /// independent clone. Installation starts only after every clone has
    /// been produced, so no worker observes a partially applied set.
    pub async fn mutate_on_all_shards<F>(
        shards: &[Arc<SharedTokenMetadata>],
        func: F,
    ) -> Result<(), TokenMetadataError>
    where
        F: for<'a> FnOnce(&'a mut TokenMetadata) -> BoxFuture<'a, Result<(), TokenMetadataError>>,
    {
        let base = shards.first().ok_or_else(|| {
            TokenMetadataError::InvariantViolation(
                "mutate_on_all_shards called with no shards".to_owned(),
            )
        })?;
        let _lock = base.lock.lock().await;

        let mut metadata = base.get().clone_async().await;
        metadata.invalidate_cached_rings();
        func(&mut metadata).await?;
        let metadata = Arc::new(metadata);

        let mut pending: Vec<Arc<TokenMetadata>> = Vec::with_capacity(shards.len());
        pending.push(metadata.clone());
        for _ in 1..shards.len() {
            pending.push(Arc::new(metadata.clone_async().await));
        }
        for (shard, snapshot) in shards.iter().zip(pending) {
            shard.set(snapshot)?;
        }
        Ok(())
    }
}

impl Default for SharedTokenMetadata {
    fn default() -> Self {
        Self::new(TokenMetadata::new())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use futures::FutureExt;
    use rand::Rng;

    use super::SharedTokenMetadata;
    use crate::errors::TokenMetadataError;
    use crate::locator::token_metadata::TokenMetadata;
    use crate::locator::topology::NodeState;
    use crate::routing::Token;
    use crate::test_utils::{dc_rack, setup_tracing, test_endpoint};

    #[tokio::test]
    async fn mutation_publishes_a_new_snapshot() {
        setup_tracing();
        let stm = SharedTokenMetadata::default();
        let before = stm.get();

        stm.mutate_token_metadata(|tm: &mut TokenMetadata| {
            async move {
                let endpoint = test_endpoint(1);
                tm.update_topology(endpoint, dc_rack("dc1", "r1"), Some(NodeState::Normal));
                tm.update_normal_tokens(HashSet::from([Token::new(10)]), endpoint)
                    .await
            }
            .boxed()
        })
        .await
        .unwrap();

        let after = stm.get();
        assert!(after.get_ring_version() > before.get_ring_version());
        assert!(after.is_normal_token_owner(test_endpoint(1)));
        // The snapshot captured before the mutation is unchanged.
        assert!(before.get_token_to_endpoint().is_empty());
    }

    #[tokio::test]
    async fn failed_mutation_preserves_the_snapshot() {
        setup_tracing();
        let stm = SharedTokenMetadata::default();
        let before = stm.get();

        let res = stm
            .mutate_token_metadata(|tm: &mut TokenMetadata| {
                async move {
                    // Assigning tokens to an endpoint missing from the
                    // topology fails after the clone was built.
                    tm.update_normal_tokens(HashSet::from([Token::new(10)]), test_endpoint(1))
                        .await
                }
                .boxed()
            })
            .await;

        assert_matches!(res, Err(TokenMetadataError::InvariantViolation(_)));
        let after = stm.get();
        assert_eq!(after.get_ring_version(), before.get_ring_version());
        assert!(after.get_token_to_endpoint().is_empty());
    }

    #[tokio::test]
    async fn set_refuses_non_increasing_versions() {
        setup_tracing();
        let stm = SharedTokenMetadata::default();
        stm.mutate_token_metadata(|tm: &mut TokenMetadata| {
            async move {
                tm.update_topology(
                    test_endpoint(1),
                    dc_rack("dc1", "r1"),
                    Some(NodeState::Normal),
                );
                Ok(())
            }
            .boxed()
        })
        .await
        .unwrap();

        // A stale snapshot carries a version no greater than the
        // published one.
        let stale = stm.get().clone_async().await;
        assert_matches!(
            stm.set(Arc::new(stale)),
            Err(TokenMetadataError::InvariantViolation(_))
        );
    }

    #[tokio::test]
    async fn ring_versions_increase_across_arbitrary_mutations() {
        setup_tracing();
        let stm = SharedTokenMetadata::default();
        stm.mutate_token_metadata(|tm: &mut TokenMetadata| {
            async move {
                for id in 1..=3 {
                    let endpoint = test_endpoint(id);
                    tm.update_topology(endpoint, dc_rack("dc1", "r1"), Some(NodeState::Normal));
                    tm.update_normal_tokens(
                        HashSet::from([Token::new(i64::from(id) * 10)]),
                        endpoint,
                    )
                    .await?;
                }
                Ok(())
            }
            .boxed()
        })
        .await
        .unwrap();

        let mut versions = vec![stm.get().get_ring_version()];
        let mut rng = rand::rng();
        for step in 0..10 {
            let kind = rng.random_range(0..4u8);
            stm.mutate_token_metadata(move |tm: &mut TokenMetadata| {
                async move {
                    let endpoint = test_endpoint(10 + step);
                    match kind {
                        0 => {
                            tm.update_topology(
                                endpoint,
                                dc_rack("dc1", "r1"),
                                Some(NodeState::Normal),
                            );
                            tm.update_normal_tokens(
                                HashSet::from([Token::new(1000 + i64::from(step))]),
                                endpoint,
                            )
                            .await?;
                        }
                        1 => tm.add_leaving_endpoint(test_endpoint(1)),
                        2 => tm.del_leaving_endpoint(test_endpoint(1)),
                        _ => tm.remove_endpoint(test_endpoint(10 + step)),
                    }
                    Ok(())
                }
                .boxed()
            })
            .await
            .unwrap();
            versions.push(stm.get().get_ring_version());
        }

        assert!(versions.windows(2).all(|w| w[0] < w[1]), "{versions:?}");
    }

    #[tokio::test]
    async fn mutate_on_all_shards_installs_everywhere() {
        setup_tracing();
        let shards: Vec<Arc<SharedTokenMetadata>> = (0..3)
            .map(|_| Arc::new(SharedTokenMetadata::default()))
            .collect();

        SharedTokenMetadata::mutate_on_all_shards(&shards, |tm: &mut TokenMetadata| {
            async move {
                let endpoint = test_endpoint(1);
                tm.update_topology(endpoint, dc_rack("dc1", "r1"), Some(NodeState::Normal));
                tm.update_normal_tokens(HashSet::from([Token::new(10)]), endpoint)
                    .await
            }
            .boxed()
        })
        .await
        .unwrap();

        let version = shards[0].get().get_ring_version();
        for shard in &shards {
            let snapshot = shard.get();
            assert_eq!(snapshot.get_ring_version(), version);
            assert!(snapshot.is_normal_token_owner(test_endpoint(1)));
        }
    }

    #[tokio::test]
    async fn failed_cross_shard_mutation_leaves_shards_untouched() {
        setup_tracing();
        let shards: Vec<Arc<SharedTokenMetadata>> = (0..2)
            .map(|_| Arc::new(SharedTokenMetadata::default()))
            .collect();
        let versions: Vec<u64> = shards.iter().map(|s| s.get().get_ring_version()).collect();

        let res = SharedTokenMetadata::mutate_on_all_shards(&shards, |tm: &mut TokenMetadata| {
            async move {
                tm.update_normal_tokens(HashSet::from([Token::new(10)]), test_endpoint(1))
                    .await
            }
            .boxed()
        })
        .await;

        assert_matches!(res, Err(TokenMetadataError::InvariantViolation(_)));
        for (shard, version) in shards.iter().zip(versions) {
            assert_eq!(shard.get().get_ring_version(), version);
        }
    }
}
