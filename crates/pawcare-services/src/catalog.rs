use std::sync::Arc;

use pawcare_core::{tables, AdoptablePet, CareProvider, PetFilters, ProviderFilters};
use pawcare_storage::{decode_rows, Query, TabularDataSource};
use serde::de::DeserializeOwned;
use tracing::{debug, error};

use crate::{build_pet_query, build_provider_query, ServiceError};

/// Filtered reads over providers and adoptable pets. Failures propagate.
#[derive(Clone)]
pub struct Catalog {
    source: Arc<dyn TabularDataSource>,
}

impl Catalog {
    pub fn new(source: Arc<dyn TabularDataSource>) -> Self {
        Self { source }
    }

    pub async fn search_providers(
        &self,
        filters: &ProviderFilters,
    ) -> Result<Vec<CareProvider>, ServiceError> {
        let query = build_provider_query(Query::table(tables::PROVIDERS), filters);
        self.fetch("fetching care providers", query).await
    }

    pub async fn search_pets(&self, filters: &PetFilters) -> Result<Vec<AdoptablePet>, ServiceError> {
        let query = build_pet_query(Query::table(tables::PETS), filters);
        self.fetch("fetching adoptable pets", query).await
    }

    pub async fn provider(&self, id: &str) -> Result<Option<CareProvider>, ServiceError> {
        let query = Query::table(tables::PROVIDERS).eq("id", id).limit(1);
        Ok(self.fetch("fetching care provider", query).await?.pop())
    }

    pub async fn pet(&self, id: &str) -> Result<Option<AdoptablePet>, ServiceError> {
        let query = Query::table(tables::PETS).eq("id", id).limit(1);
        Ok(self.fetch("fetching pet", query).await?.pop())
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        query: Query,
    ) -> Result<Vec<T>, ServiceError> {
        debug!(operation, table = query.table_name(), predicates = query.predicates().len(), "running query");
        let table = query.table_name();
        self.source
            .select(&query)
            .await
            .and_then(|rows| decode_rows(table, rows))
            .map_err(|source| {
                error!(operation, error = %source, "query failed");
                ServiceError::DataSource { operation, source }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pawcare_core::PriceRange;
    use pawcare_storage::{MemoryDataSource, Operation};
    use serde_json::{json, Value};

    fn host(id: &str, price: f64, services: Value, certifications: Value, rating: Value) -> Value {
        json!({
            "id": id,
            "category": "caregiver",
            "name": format!("Host {id}"),
            "city": "Madrid",
            "location": "Chamberi, Madrid",
            "price_per_night": price,
            "pet_types": ["Perro", "Gato"],
            "services": services,
            "certifications": certifications,
            "rating": rating,
        })
    }

    fn catalog() -> (Arc<MemoryDataSource>, Catalog) {
        let source = Arc::new(
            MemoryDataSource::new()
                .with_table(
                    tables::PROVIDERS,
                    vec![
                        host("low", 20.0, json!(["paseo"]), json!(null), json!(4.1)),
                        host("mid", 30.0, json!(["guarderia", "baño"]), json!([]), json!(null)),
                        host("high", 40.0, json!(["adiestramiento"]), json!(["ASPCA"]), json!(4.8)),
                        host("over", 40.5, json!(["paseo", "guarderia"]), json!(["A", "B"]), json!(3.0)),
                    ],
                )
                .with_table(
                    tables::PETS,
                    vec![
                        json!({ "id": "p1", "type": "Perro", "location": "Sevilla", "size": "Grande", "urgent": false }),
                        json!({ "id": "p2", "type": "Perro", "location": "sevilla centro", "size": "Pequeño", "urgent": true }),
                        json!({ "id": "p3", "type": "Gato", "location": "Valencia", "size": "Pequeño", "urgent": true }),
                    ],
                ),
        );
        (source.clone(), Catalog::new(source))
    }

    fn ids<T>(items: &[T], id: impl Fn(&T) -> &str) -> Vec<String> {
        items.iter().map(|i| id(i).to_string()).collect()
    }

    #[tokio::test]
    async fn unfiltered_search_returns_everything_by_rating() {
        let (_, catalog) = catalog();
        let found = catalog
            .search_providers(&ProviderFilters::default())
            .await
            .expect("search");
        assert_eq!(ids(&found, |p| p.id.as_str()), vec!["high", "low", "over", "mid"]);
    }

    #[tokio::test]
    async fn price_bounds_are_inclusive() {
        let (_, catalog) = catalog();
        let filters = ProviderFilters {
            price: Some(PriceRange::new(20.0, 40.0)),
            ..Default::default()
        };
        let found = catalog.search_providers(&filters).await.expect("search");
        assert_eq!(ids(&found, |p| p.id.as_str()), vec!["high", "low", "mid"]);
        assert!(found
            .iter()
            .all(|p| PriceRange::new(20.0, 40.0).contains(p.price_per_night)));
    }

    #[tokio::test]
    async fn services_match_any_requested() {
        let (_, catalog) = catalog();
        let filters = ProviderFilters {
            services: vec!["paseo".into(), "baño".into()],
            ..Default::default()
        };
        let found = catalog.search_providers(&filters).await.expect("search");
        assert_eq!(ids(&found, |p| p.id.as_str()), vec!["low", "over", "mid"]);
    }

    #[tokio::test]
    async fn certified_only_requires_a_non_empty_list() {
        let (_, catalog) = catalog();
        let filters = ProviderFilters {
            certified_only: true,
            ..Default::default()
        };
        let found = catalog.search_providers(&filters).await.expect("search");
        assert_eq!(ids(&found, |p| p.id.as_str()), vec!["high", "over"]);
        assert!(found.iter().all(CareProvider::is_certified));
    }

    #[tokio::test]
    async fn pet_search_puts_urgent_first() {
        let (_, catalog) = catalog();
        let filters = PetFilters {
            location: Some("SEVILLA".into()),
            pet_type: Some("Perro".into()),
            ..Default::default()
        };
        let found = catalog.search_pets(&filters).await.expect("search");
        assert_eq!(ids(&found, |p| p.id.as_str()), vec!["p2", "p1"]);
    }

    #[tokio::test]
    async fn lookups_by_id() {
        let (_, catalog) = catalog();
        assert_eq!(
            catalog.provider("mid").await.expect("lookup").map(|p| p.price_per_night),
            Some(30.0)
        );
        assert!(catalog.pet("missing").await.expect("lookup").is_none());
    }

    #[tokio::test]
    async fn backend_failures_propagate_with_operation_prefix() {
        let (source, catalog) = catalog();
        source.fail_on(tables::PROVIDERS, Operation::Select).await;
        let err = catalog
            .search_providers(&ProviderFilters::default())
            .await
            .expect_err("select fails");
        assert!(matches!(err, ServiceError::DataSource { .. }));
        assert!(err.to_string().starts_with("fetching care providers: "));
    }
}
