use catsync_core::{CatalogEntry, ProductRecord};
use catsync_storage::{CatalogStore, StoreError};

/// Maps an incoming record to at most one existing catalog entry.
///
/// SKU-bearing records are looked up by SKU only; records without a SKU
/// fall back to their source URL. No fuzzy matching and no merging across
/// keys: an entry first seen without a SKU stays a separate identity when the
/// SKU later appears.
pub struct IdentityResolver<'a> {
    store: &'a dyn CatalogStore,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(store: &'a dyn CatalogStore) -> Self {
        Self { store }
    }

    pub async fn resolve(
        &self,
        source_id: &str,
        record: &ProductRecord,
    ) -> Result<Option<CatalogEntry>, StoreError> {
        match &record.sku {
            Some(sku) => self.store.find_by_sku(source_id, sku).await,
            None => self.store.find_by_url(source_id, &record.url).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{classify, Observation};
    use crate::fingerprint::fingerprint;
    use catsync_core::{RawRecord, SessionId};
    use catsync_storage::MemoryCatalogStore;
    use chrono::Utc;
    use serde_json::json;

    fn record(value: serde_json::Value) -> ProductRecord {
        serde_json::from_value::<RawRecord>(value)
            .expect("raw")
            .validate()
            .expect("valid")
    }

    async fn insert(store: &MemoryCatalogStore, rec: &ProductRecord) {
        let session_id = SessionId::from("s1");
        let obs = Observation {
            source_id: "phoenix",
            session_id: &session_id,
            now: Utc::now(),
        };
        let classified = classify(None, rec, &fingerprint(&rec.payload), &obs).expect("new");
        store.load_entries([classified.entry]).await;
    }

    #[tokio::test]
    async fn same_sku_resolves_to_same_entry_regardless_of_url() {
        let store = MemoryCatalogStore::new();
        insert(&store, &record(json!({"sku": "A1", "title": "Mixer", "url": "u1"}))).await;

        let resolver = IdentityResolver::new(&store);
        let moved = record(json!({"sku": "A1", "title": "Mixer", "url": "u-moved"}));
        let found = resolver.resolve("phoenix", &moved).await.unwrap().expect("resolved");
        assert_eq!(found.sku.as_deref(), Some("A1"));
        assert!(resolver.resolve("other-vendor", &moved).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sku_records_never_fall_back_to_url() {
        let store = MemoryCatalogStore::new();
        insert(&store, &record(json!({"title": "Tap", "url": "u2"}))).await;

        let resolver = IdentityResolver::new(&store);
        let with_sku = record(json!({"sku": "B2", "title": "Tap", "url": "u2"}));
        assert!(resolver.resolve("phoenix", &with_sku).await.unwrap().is_none());

        let without_sku = record(json!({"title": "Tap", "url": "u2"}));
        assert!(resolver.resolve("phoenix", &without_sku).await.unwrap().is_some());
    }
}
