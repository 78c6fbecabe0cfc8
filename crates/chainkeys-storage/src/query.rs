//! Read-side facade over a [`SyncStore`].
//!
//! Every data read returns the checkpoint it was taken at, so callers can
//! tell how stale the answer is.

use std::time::Duration;

use chainkeys_core::checkpoint::ElMeta;
use chainkeys_core::config::SyncConfig;
use chainkeys_core::error::{Result, SyncError};
use chainkeys_core::store::{KeyStream, SyncStore};
use chainkeys_core::types::{Key, KeyFilter, ModuleSelector, Operator, OperatorFilter, StakingModule};

/// Default idle deadline for [`QueryService::stream_keys`].
pub const DEFAULT_CURSOR_IDLE: Duration = Duration::from_secs(30);

pub struct QueryService<S> {
    store: S,
    cursor_idle: Duration,
}

impl<S: SyncStore> QueryService<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursor_idle: DEFAULT_CURSOR_IDLE,
        }
    }

    /// Service using the cursor idle deadline from `config`.
    pub fn from_config(store: S, config: &SyncConfig) -> Self {
        Self::new(store).with_cursor_idle(config.cursor_idle_timeout())
    }

    pub fn with_cursor_idle(mut self, idle: Duration) -> Self {
        self.cursor_idle = idle;
        self
    }

    pub async fn staking_modules(&self) -> Result<Vec<StakingModule>> {
        self.store.staking_modules().await
    }

    /// Look a module up by id or (case-insensitive) address.
    pub async fn staking_module(&self, selector: &ModuleSelector) -> Result<StakingModule> {
        self.store
            .staking_modules()
            .await?
            .into_iter()
            .find(|m| selector.matches(m))
            .ok_or_else(|| SyncError::NotFound(format!("staking module {selector:?}")))
    }

    pub async fn operators(
        &self,
        selector: &ModuleSelector,
        filter: OperatorFilter,
    ) -> Result<(Vec<Operator>, Option<ElMeta>)> {
        let module = self.staking_module(selector).await?;
        self.store
            .operators_snapshot(&module.staking_module_address, filter)
            .await
    }

    pub async fn keys(
        &self,
        selector: &ModuleSelector,
        filter: KeyFilter,
    ) -> Result<(Vec<Key>, Option<ElMeta>)> {
        let module = self.staking_module(selector).await?;
        self.store
            .keys_snapshot(&module.staking_module_address, filter)
            .await
    }

    /// Stream a module's keys; the query is dropped if the caller stalls.
    pub async fn stream_keys(&self, selector: &ModuleSelector, filter: KeyFilter) -> Result<KeyStream> {
        let module = self.staking_module(selector).await?;
        self.store
            .stream_keys(&module.staking_module_address, filter, self.cursor_idle)
            .await
    }

    pub async fn el_meta(&self) -> Result<Option<ElMeta>> {
        self.store.el_meta().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStorage;
    use crate::testing::*;
    use futures::TryStreamExt;

    async fn service() -> QueryService<InMemoryStorage> {
        let store = InMemoryStorage::new();
        store.commit_pass(sample_commit(2, 2)).await.unwrap();
        QueryService::new(store)
    }

    #[tokio::test]
    async fn module_by_id_and_address() {
        let q = service().await;
        assert_eq!(q.staking_module(&ModuleSelector::Id(1)).await.unwrap().id, 1);
        let upper = MODULE.to_uppercase().replacen("0X", "0x", 1);
        let found = q
            .staking_module(&ModuleSelector::Address(upper))
            .await
            .unwrap();
        assert_eq!(found.staking_module_address, MODULE);
    }

    #[tokio::test]
    async fn missing_module_is_not_found() {
        let q = service().await;
        let err = q.staking_module(&ModuleSelector::Id(9)).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
        assert!(q.keys(&ModuleSelector::Id(9), KeyFilter::default()).await.is_err());
    }

    #[tokio::test]
    async fn reads_carry_meta() {
        let q = service().await;
        let (ops, meta_now) = q
            .operators(&ModuleSelector::Id(1), OperatorFilter::default())
            .await
            .unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(meta_now, Some(meta(10)));

        let (keys, _) = q
            .keys(&ModuleSelector::Id(1), KeyFilter::operator(1))
            .await
            .unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().all(|k| k.operator_index == 1));
    }

    #[test]
    fn idle_deadline_follows_config() {
        let config = SyncConfig {
            cursor_idle_timeout_ms: 1_500,
            ..Default::default()
        };
        let q = QueryService::from_config(InMemoryStorage::new(), &config);
        assert_eq!(q.cursor_idle, Duration::from_millis(1_500));
    }

    #[tokio::test]
    async fn stream_through_service() {
        let q = service().await.with_cursor_idle(Duration::from_secs(5));
        let keys: Vec<Key> = q
            .stream_keys(&ModuleSelector::Id(1), KeyFilter::default())
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(keys.len(), 4);
    }
}
