//! Lost-pet reports and the `is_lost` flag they drive on the pet record.
//!
//! A pet is flagged lost exactly while at least one of its reports is open.
//! Each operation is a report write followed by a flag write with no shared
//! transaction. When the report write lands and the flag write does not,
//! nothing is rolled back; the caller gets [`ServiceError::PartialWrite`]
//! naming both records.

use std::sync::Arc;

use pawcare_core::{
    tables, LostPetReport, LostReportPatch, LostReportStatus, NewLostReport, User,
};
use pawcare_storage::{
    decode_row, decode_rows, DataSourceError, Direction, IdentityProvider, Query,
    TabularDataSource,
};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use crate::ServiceError;

#[derive(Clone)]
pub struct LostPetService {
    source: Arc<dyn TabularDataSource>,
    identity: Arc<dyn IdentityProvider>,
}

fn id_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn data_source(operation: &'static str) -> impl FnOnce(DataSourceError) -> ServiceError {
    move |source| {
        error!(operation, error = %source, "lost pet write failed");
        ServiceError::DataSource { operation, source }
    }
}

impl LostPetService {
    pub fn new(source: Arc<dyn TabularDataSource>, identity: Arc<dyn IdentityProvider>) -> Self {
        Self { source, identity }
    }

    async fn require_user(&self) -> Result<User, ServiceError> {
        self.identity
            .current_user()
            .await
            .ok_or(ServiceError::Unauthenticated)
    }

    /// False when the pet does not exist or belongs to someone else.
    async fn owned_pet_exists(&self, pet_id: &str, owner_id: &str) -> Result<bool, DataSourceError> {
        let query = Query::table(tables::PETS)
            .select("id")
            .eq("id", pet_id)
            .eq("owner_id", owner_id)
            .limit(1);
        Ok(!self.source.select(&query).await?.is_empty())
    }

    async fn set_lost_flag(
        &self,
        pet_id: &str,
        owner_id: &str,
        lost: bool,
    ) -> Result<(), DataSourceError> {
        let query = Query::table(tables::PETS)
            .eq("id", pet_id)
            .eq("owner_id", owner_id);
        let updated = self.source.update(&query, json!({ "is_lost": lost })).await?;
        if updated.is_empty() {
            return Err(DataSourceError::Backend(format!(
                "no pet {pet_id} owned by {owner_id} to flag"
            )));
        }
        Ok(())
    }

    /// Recomputes the flag from the pet's open reports.
    async fn sync_lost_flag(&self, pet_id: &str, owner_id: &str) -> Result<bool, DataSourceError> {
        let open = Query::table(tables::LOST_PET_REPORTS)
            .select("id")
            .eq("pet_id", pet_id)
            .eq("status", LostReportStatus::Lost.as_str());
        let lost = self.source.count(&open).await? > 0;
        debug!(pet_id, lost, "syncing lost flag");
        self.set_lost_flag(pet_id, owner_id, lost).await?;
        Ok(lost)
    }

    fn partial_write(
        operation: &'static str,
        report_id: &str,
        pet_id: &str,
        source: DataSourceError,
    ) -> ServiceError {
        error!(
            operation,
            report_id,
            pet_id,
            error = %source,
            "report and pet lost flag are out of sync"
        );
        ServiceError::PartialWrite {
            operation,
            report_id: report_id.to_string(),
            pet_id: pet_id.to_string(),
            source,
        }
    }

    /// Files a report on one of the acting user's pets, then flags the pet as lost.
    pub async fn report_lost(
        &self,
        pet_id: &str,
        details: NewLostReport,
    ) -> Result<LostPetReport, ServiceError> {
        const OPERATION: &str = "reporting lost pet";
        let user = self.require_user().await?;

        let owned = self
            .owned_pet_exists(pet_id, &user.id)
            .await
            .map_err(data_source(OPERATION))?;
        if !owned {
            return Err(ServiceError::NotFound {
                operation: OPERATION,
                id: pet_id.to_string(),
            });
        }

        let record = json!({
            "pet_id": pet_id,
            "owner_id": user.id,
            "status": LostReportStatus::Lost.as_str(),
            "description": details.description,
            "last_seen_location": details.last_seen_location,
            "last_seen_at": details.last_seen_at,
            "contact_phone": details.contact_phone,
        });
        let report: LostPetReport = self
            .source
            .insert(tables::LOST_PET_REPORTS, record)
            .await
            .and_then(|row| decode_row(tables::LOST_PET_REPORTS, row))
            .map_err(data_source(OPERATION))?;

        self.set_lost_flag(pet_id, &user.id, true)
            .await
            .map_err(|source| Self::partial_write(OPERATION, &report.id, pet_id, source))?;

        info!(report_id = %report.id, pet_id, "pet reported lost");
        Ok(report)
    }

    /// Closes the acting user's report. The pet stays flagged while another
    /// report on it is still open.
    pub async fn mark_found(&self, report_id: &str) -> Result<LostPetReport, ServiceError> {
        const OPERATION: &str = "marking pet found";
        let user = self.require_user().await?;

        let query = Query::table(tables::LOST_PET_REPORTS)
            .eq("id", report_id)
            .eq("owner_id", user.id.as_str());
        let rows = self
            .source
            .update(&query, json!({ "status": LostReportStatus::Found.as_str() }))
            .await
            .map_err(data_source(OPERATION))?;
        let Some(row) = rows.into_iter().next() else {
            return Err(ServiceError::NotFound {
                operation: OPERATION,
                id: report_id.to_string(),
            });
        };
        let report: LostPetReport =
            decode_row(tables::LOST_PET_REPORTS, row).map_err(data_source(OPERATION))?;

        self.sync_lost_flag(&report.pet_id, &user.id)
            .await
            .map_err(|source| Self::partial_write(OPERATION, &report.id, &report.pet_id, source))?;

        info!(report_id, pet_id = %report.pet_id, "pet marked found");
        Ok(report)
    }

    /// Removes one of the acting user's reports and resyncs its pet's lost flag.
    ///
    /// `owner_id` must be the signed-in user. A failed pet lookup is not an
    /// error: the report is still deleted and the flag is left as it was.
    pub async fn delete_report(&self, report_id: &str, owner_id: &str) -> Result<(), ServiceError> {
        const OPERATION: &str = "deleting lost pet report";
        let user = self.require_user().await?;
        if user.id != owner_id {
            warn!(report_id, owner_id, user_id = %user.id, "delete for another owner rejected");
            return Err(ServiceError::Forbidden {
                operation: OPERATION,
            });
        }

        let scoped = Query::table(tables::LOST_PET_REPORTS)
            .eq("id", report_id)
            .eq("owner_id", owner_id);

        let pet_id = match self
            .source
            .select(&scoped.clone().select("pet_id").limit(1))
            .await
        {
            Ok(rows) => {
                let pet_id = rows.first().and_then(|r| r.get("pet_id")).and_then(id_text);
                if pet_id.is_none() {
                    warn!(report_id, "report has no pet to update");
                }
                pet_id
            }
            Err(err) => {
                warn!(report_id, error = %err, "pet lookup failed; lost flag left unchanged");
                None
            }
        };

        let removed = self
            .source
            .delete(&scoped)
            .await
            .map_err(data_source(OPERATION))?;
        if removed.is_empty() {
            return Err(ServiceError::NotFound {
                operation: OPERATION,
                id: report_id.to_string(),
            });
        }

        if let Some(pet_id) = pet_id {
            self.sync_lost_flag(&pet_id, owner_id)
                .await
                .map_err(|source| Self::partial_write(OPERATION, report_id, &pet_id, source))?;
        }

        info!(report_id, "lost pet report deleted");
        Ok(())
    }

    /// Edits a report; a status change resyncs the pet's lost flag.
    pub async fn update_report(
        &self,
        report_id: &str,
        patch: LostReportPatch,
    ) -> Result<LostPetReport, ServiceError> {
        const OPERATION: &str = "updating lost pet report";
        let user = self.require_user().await?;

        let mut fields = Map::new();
        if let Some(description) = patch.description {
            fields.insert("description".into(), Value::String(description));
        }
        if let Some(location) = patch.last_seen_location {
            fields.insert("last_seen_location".into(), Value::String(location));
        }
        if let Some(seen_at) = patch.last_seen_at {
            fields.insert("last_seen_at".into(), Value::String(seen_at.to_rfc3339()));
        }
        if let Some(phone) = patch.contact_phone {
            fields.insert("contact_phone".into(), Value::String(phone));
        }
        if let Some(status) = patch.status {
            fields.insert("status".into(), Value::String(status.as_str().to_string()));
        }
        if fields.is_empty() {
            return Err(ServiceError::InvalidInput {
                operation: OPERATION,
                message: "nothing to update".to_string(),
            });
        }

        let query = Query::table(tables::LOST_PET_REPORTS)
            .eq("id", report_id)
            .eq("owner_id", user.id.as_str());
        let rows = self
            .source
            .update(&query, Value::Object(fields))
            .await
            .map_err(data_source(OPERATION))?;
        let Some(row) = rows.into_iter().next() else {
            return Err(ServiceError::NotFound {
                operation: OPERATION,
                id: report_id.to_string(),
            });
        };
        let report: LostPetReport =
            decode_row(tables::LOST_PET_REPORTS, row).map_err(data_source(OPERATION))?;

        if patch.status.is_some() {
            self.sync_lost_flag(&report.pet_id, &user.id)
                .await
                .map_err(|source| {
                    Self::partial_write(OPERATION, &report.id, &report.pet_id, source)
                })?;
        }

        Ok(report)
    }

    /// Open reports, newest first.
    pub async fn active_reports(&self, limit: usize) -> Result<Vec<LostPetReport>, ServiceError> {
        const OPERATION: &str = "fetching lost pet reports";
        let query = Query::table(tables::LOST_PET_REPORTS)
            .eq("status", LostReportStatus::Lost.as_str())
            .order_nulls_last("created_at", Direction::Desc)
            .limit(limit);
        self.source
            .select(&query)
            .await
            .and_then(|rows| decode_rows(tables::LOST_PET_REPORTS, rows))
            .map_err(data_source(OPERATION))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pawcare_storage::{MemoryDataSource, Operation, StaticIdentity};

    fn seeded() -> Arc<MemoryDataSource> {
        Arc::new(
            MemoryDataSource::new()
                .with_table(
                    tables::PETS,
                    vec![
                        json!({ "id": "pet-7", "owner_id": "owner-1", "type": "Perro", "is_lost": true }),
                        json!({ "id": "pet-8", "owner_id": "owner-1", "type": "Gato", "is_lost": false }),
                        json!({ "id": "pet-9", "owner_id": "owner-2", "type": "Perro", "is_lost": false }),
                    ],
                )
                .with_table(
                    tables::LOST_PET_REPORTS,
                    vec![json!({
                        "id": "report-1",
                        "pet_id": "pet-7",
                        "owner_id": "owner-1",
                        "status": "lost",
                        "created_at": "2026-10-01T08:00:00Z"
                    })],
                ),
        )
    }

    fn service(source: &Arc<MemoryDataSource>, user: Option<&str>) -> LostPetService {
        let identity = StaticIdentity::from(user.map(User::new));
        LostPetService::new(source.clone(), Arc::new(identity))
    }

    async fn pet_is_lost(source: &MemoryDataSource, pet_id: &str) -> bool {
        source
            .rows(tables::PETS)
            .await
            .iter()
            .find(|p| p["id"] == pet_id)
            .and_then(|p| p["is_lost"].as_bool())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn report_lost_creates_report_and_sets_flag() {
        let source = seeded();
        let report = service(&source, Some("owner-1"))
            .report_lost(
                "pet-8",
                NewLostReport {
                    description: Some("collar rojo".into()),
                    last_seen_location: Some("Parque del Retiro".into()),
                    ..Default::default()
                },
            )
            .await
            .expect("report");

        assert_eq!(report.pet_id, "pet-8");
        assert_eq!(report.owner_id, "owner-1");
        assert_eq!(report.status, LostReportStatus::Lost);
        assert!(pet_is_lost(&source, "pet-8").await);
    }

    #[tokio::test]
    async fn mutations_require_a_session() {
        let source = seeded();
        let service = service(&source, None);
        assert!(matches!(
            service.report_lost("pet-8", NewLostReport::default()).await,
            Err(ServiceError::Unauthenticated)
        ));
        assert!(matches!(
            service.mark_found("report-1").await,
            Err(ServiceError::Unauthenticated)
        ));
        assert!(matches!(
            service.delete_report("report-1", "owner-1").await,
            Err(ServiceError::Unauthenticated)
        ));
        assert_eq!(source.issued_operations(), 0);
        assert_eq!(source.rows(tables::LOST_PET_REPORTS).await.len(), 1);
    }

    #[tokio::test]
    async fn delete_for_another_owner_is_forbidden() {
        let source = seeded();
        let err = service(&source, Some("owner-2"))
            .delete_report("report-1", "owner-1")
            .await
            .expect_err("session user is not the owner");
        assert!(matches!(err, ServiceError::Forbidden { .. }));
        assert_eq!(source.rows(tables::LOST_PET_REPORTS).await.len(), 1);
        assert!(pet_is_lost(&source, "pet-7").await);
    }

    #[tokio::test]
    async fn report_on_someone_elses_pet_is_not_found() {
        let source = seeded();
        let err = service(&source, Some("owner-1"))
            .report_lost("pet-9", NewLostReport::default())
            .await
            .expect_err("pet-9 belongs to owner-2");
        assert!(matches!(err, ServiceError::NotFound { .. }));
        assert!(!pet_is_lost(&source, "pet-9").await);
        assert_eq!(source.rows(tables::LOST_PET_REPORTS).await.len(), 1);
    }

    #[tokio::test]
    async fn report_on_missing_pet_is_not_found() {
        let source = seeded();
        let service = service(&source, Some("owner-1"));
        let err = service
            .report_lost("no-such-pet", NewLostReport::default())
            .await
            .expect_err("no pet record");
        assert!(matches!(err, ServiceError::NotFound { .. }));
        assert_eq!(service.active_reports(10).await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn flag_update_matching_no_pet_is_a_partial_write() {
        let source = Arc::new(
            MemoryDataSource::new().with_table(
                tables::LOST_PET_REPORTS,
                vec![json!({ "id": "report-2", "pet_id": "gone", "owner_id": "owner-1", "status": "lost" })],
            ),
        );
        let err = service(&source, Some("owner-1"))
            .mark_found("report-2")
            .await
            .expect_err("pet record was removed");
        assert!(matches!(err, ServiceError::PartialWrite { .. }));
    }

    #[tokio::test]
    async fn flag_stays_set_while_another_report_is_open() {
        let source = seeded();
        let service = service(&source, Some("owner-1"));
        let second = service
            .report_lost("pet-7", NewLostReport::default())
            .await
            .expect("second report");

        service.mark_found("report-1").await.expect("found");
        assert!(pet_is_lost(&source, "pet-7").await);

        service
            .delete_report("report-1", "owner-1")
            .await
            .expect("delete closed report");
        assert!(pet_is_lost(&source, "pet-7").await);

        service
            .delete_report(&second.id, "owner-1")
            .await
            .expect("delete last open report");
        assert!(!pet_is_lost(&source, "pet-7").await);
    }

    #[tokio::test]
    async fn mark_found_closes_report_and_clears_flag() {
        let source = seeded();
        let report = service(&source, Some("owner-1"))
            .mark_found("report-1")
            .await
            .expect("mark found");

        assert_eq!(report.status, LostReportStatus::Found);
        assert!(!pet_is_lost(&source, "pet-7").await);
    }

    #[tokio::test]
    async fn mark_found_is_scoped_to_the_owner() {
        let source = seeded();
        let err = service(&source, Some("someone-else"))
            .mark_found("report-1")
            .await
            .expect_err("not the owner");
        assert!(matches!(err, ServiceError::NotFound { .. }));
        assert!(pet_is_lost(&source, "pet-7").await);
    }

    #[tokio::test]
    async fn flag_failure_after_report_insert_is_surfaced() {
        let source = seeded();
        source.fail_on(tables::PETS, Operation::Update).await;
        let err = service(&source, Some("owner-1"))
            .report_lost("pet-8", NewLostReport::default())
            .await
            .expect_err("flag update fails");

        let ServiceError::PartialWrite { report_id, pet_id, .. } = err else {
            panic!("expected a partial write error");
        };
        assert_eq!(pet_id, "pet-8");
        assert_eq!(source.rows(tables::LOST_PET_REPORTS).await.len(), 2);
        assert!(source
            .rows(tables::LOST_PET_REPORTS)
            .await
            .iter()
            .any(|r| r["id"] == report_id.as_str()));
        assert!(!pet_is_lost(&source, "pet-8").await);
    }

    #[tokio::test]
    async fn delete_report_clears_flag() {
        let source = seeded();
        service(&source, Some("owner-1"))
            .delete_report("report-1", "owner-1")
            .await
            .expect("delete");
        assert!(source.rows(tables::LOST_PET_REPORTS).await.is_empty());
        assert!(!pet_is_lost(&source, "pet-7").await);
    }

    #[tokio::test]
    async fn delete_report_survives_failed_pet_lookup() {
        let source = seeded();
        source.fail_on(tables::LOST_PET_REPORTS, Operation::Select).await;
        service(&source, Some("owner-1"))
            .delete_report("report-1", "owner-1")
            .await
            .expect("delete still succeeds");
        assert!(source.rows(tables::LOST_PET_REPORTS).await.is_empty());
        assert!(pet_is_lost(&source, "pet-7").await);
    }

    #[tokio::test]
    async fn delete_of_unknown_report_is_not_found() {
        let source = seeded();
        let err = service(&source, Some("owner-2"))
            .delete_report("report-1", "owner-2")
            .await
            .expect_err("wrong owner");
        assert!(matches!(err, ServiceError::NotFound { .. }));
        assert_eq!(source.rows(tables::LOST_PET_REPORTS).await.len(), 1);
    }

    #[tokio::test]
    async fn status_change_through_update_follows_the_flag() {
        let source = seeded();
        let service = service(&source, Some("owner-1"));
        let report = service
            .update_report(
                "report-1",
                LostReportPatch {
                    status: Some(LostReportStatus::Found),
                    contact_phone: Some("+34 600 000 000".into()),
                    ..Default::default()
                },
            )
            .await
            .expect("update");
        assert_eq!(report.contact_phone.as_deref(), Some("+34 600 000 000"));
        assert!(!pet_is_lost(&source, "pet-7").await);

        service
            .update_report(
                "report-1",
                LostReportPatch {
                    status: Some(LostReportStatus::Lost),
                    ..Default::default()
                },
            )
            .await
            .expect("reopen");
        assert!(pet_is_lost(&source, "pet-7").await);
    }

    #[tokio::test]
    async fn empty_patch_is_rejected() {
        let source = seeded();
        let err = service(&source, Some("owner-1"))
            .update_report("report-1", LostReportPatch::default())
            .await
            .expect_err("empty patch");
        assert!(matches!(err, ServiceError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn active_reports_skip_found_ones() {
        let source = seeded();
        let service = service(&source, Some("owner-1"));
        service
            .report_lost("pet-8", NewLostReport::default())
            .await
            .expect("report");
        service.mark_found("report-1").await.expect("found");

        let active = service.active_reports(10).await.expect("list");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].pet_id, "pet-8");
    }
}
