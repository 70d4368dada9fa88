//! Folds declarative filter specs onto a base query.
//!
//! Distinct fields combine with AND. Both builders are pure and never fail;
//! the default ordering is always appended last.

use pawcare_core::{PetFilters, ProviderFilters};
use pawcare_storage::{Direction, Query};

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

pub fn build_provider_query(base: Query, filters: &ProviderFilters) -> Query {
    let mut query = base;

    if let Some(location) = non_blank(&filters.location) {
        query = query.ilike("location", location);
    }
    if let Some(pet_type) = non_blank(&filters.pet_type) {
        query = query.contains("pet_types", [pet_type]);
    }
    if let Some(price) = filters.price {
        query = query
            .gte("price_per_night", price.min)
            .lte("price_per_night", price.max);
    }

    let services = filters
        .services
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();
    if !services.is_empty() {
        query = query.overlaps("services", services);
    }

    if filters.certified_only {
        query = query.not_null("certifications").not_empty("certifications");
    }

    // Unreviewed providers sort below every rated one.
    query.order_nulls_last("rating", Direction::Desc)
}

pub fn build_pet_query(base: Query, filters: &PetFilters) -> Query {
    let mut query = base;

    if let Some(location) = non_blank(&filters.location) {
        query = query.ilike("location", location);
    }
    if let Some(pet_type) = non_blank(&filters.pet_type) {
        query = query.eq("type", pet_type);
    }
    if let Some(size) = non_blank(&filters.size) {
        query = query.eq("size", size);
    }
    if let Some(age) = non_blank(&filters.age) {
        query = query.eq("age", age);
    }

    query.order_nulls_last("urgent", Direction::Desc)
}
