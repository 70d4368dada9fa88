use std::sync::Arc;

use pawcare_core::{tables, PetCategory, UserStatsSummary, BOOKING_COMPLETED};
use pawcare_storage::{IdentityProvider, Query, TabularDataSource};
use serde_json::Value;
use tracing::{debug, warn};

/// Per-user dashboard counters.
///
/// Each sub-query degrades on its own: a failed read leaves its field at the
/// zero/`None` default and the rest of the summary is still returned.
#[derive(Clone)]
pub struct StatsAggregator {
    source: Arc<dyn TabularDataSource>,
    identity: Arc<dyn IdentityProvider>,
}

impl StatsAggregator {
    pub fn new(source: Arc<dyn TabularDataSource>, identity: Arc<dyn IdentityProvider>) -> Self {
        Self { source, identity }
    }

    /// Stats for the acting user; all defaults, with no query issued, when nobody is signed in.
    pub async fn compute_user_stats(&self) -> UserStatsSummary {
        let Some(user) = self.identity.current_user().await else {
            debug!("no active session; returning empty stats");
            return UserStatsSummary::default();
        };
        self.compute_for(&user.id).await
    }

    pub async fn compute_for(&self, user_id: &str) -> UserStatsSummary {
        let bookings = Query::table(tables::BOOKINGS)
            .select("rating")
            .eq("user_id", user_id)
            .eq("status", BOOKING_COMPLETED);
        let pets = Query::table(tables::PETS)
            .select("id")
            .eq("owner_id", user_id)
            .eq("category", PetCategory::Personal.as_str());
        let requests = Query::table(tables::ADOPTION_REQUESTS)
            .select("id")
            .eq("user_id", user_id);

        let (bookings, pets, requests) = tokio::join!(
            self.source.select(&bookings),
            self.source.count(&pets),
            self.source.count(&requests),
        );

        let mut summary = UserStatsSummary::default();

        match bookings {
            Ok(rows) => {
                let ratings = rows.iter().map(|row| row.get("rating").and_then(Value::as_f64));
                let (count, average) = summarize_ratings(ratings);
                summary.completed_bookings = count;
                summary.average_rating = average;
            }
            Err(err) => warn!(user_id, error = %err, "completed bookings unavailable"),
        }
        match pets {
            Ok(count) => summary.registered_pets = count,
            Err(err) => warn!(user_id, error = %err, "registered pets unavailable"),
        }
        match requests {
            Ok(count) => summary.adoption_requests = count,
            Err(err) => warn!(user_id, error = %err, "adoption requests unavailable"),
        }

        summary
    }
}

/// Row count and mean of the present ratings (`None` when none are present).
pub fn summarize_ratings(ratings: impl IntoIterator<Item = Option<f64>>) -> (u64, Option<f64>) {
    let mut rows = 0u64;
    let mut rated = 0u64;
    let mut total = 0.0;
    for rating in ratings {
        rows += 1;
        if let Some(value) = rating {
            rated += 1;
            total += value;
        }
    }
    let average = (rated > 0).then(|| total / rated as f64);
    (rows, average)
}
