use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CoreError, Result, StoreError};
use crate::ids::IdGenerator;
use crate::models::{Enrollment, EnrollmentStatus, GrantOptions};
use crate::store::{constraints, LearningStore};

pub struct EnrollmentLedger {
    store: Arc<dyn LearningStore>,
    ids: Arc<dyn IdGenerator>,
}

impl EnrollmentLedger {
    pub fn new(store: Arc<dyn LearningStore>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { store, ids }
    }

    /// Creates the enrollment, or reuses a non-success row for a retried
    /// checkout. A `success` row is never overwritten.
    pub async fn grant_or_reconcile(
        &self,
        user_id: Uuid,
        course_id: Uuid,
        opts: GrantOptions,
    ) -> Result<Enrollment> {
        if self.store.course(course_id).await?.is_none() {
            return Err(CoreError::not_found("course", course_id));
        }
        let enrolled_at = opts.enrolled_at.unwrap_or_else(Utc::now);

        if let Some(existing) = self.store.enrollment(user_id, course_id).await? {
            return self.reconcile(existing, &opts, enrolled_at).await;
        }

        let enrollment = Enrollment {
            id: self.ids.next_id(),
            user_id,
            course_id,
            external_txn_ref: opts.external_txn_ref.clone(),
            status: opts.status,
            amount_paid: opts.amount_paid,
            enrolled_at,
        };
        match self.store.insert_enrollment(&enrollment).await {
            Ok(()) => {
                info!(
                    %user_id, %course_id, enrollment_id = %enrollment.id,
                    status = enrollment.status.as_str(), "enrollment created"
                );
                Ok(enrollment)
            }
            Err(StoreError::UniqueViolation { constraint })
                if constraint == constraints::ENROLLMENT_USER_COURSE =>
            {
                // A concurrent checkout committed first; fall back to the update path.
                debug!(%user_id, %course_id, "enrollment insert raced, reconciling");
                let existing = self
                    .store
                    .enrollment(user_id, course_id)
                    .await?
                    .ok_or(StoreError::UniqueViolation { constraint })?;
                self.reconcile(existing, &opts, enrolled_at).await
            }
            Err(StoreError::UniqueViolation { .. }) => {
                Err(duplicate_txn_ref(opts.external_txn_ref.as_deref()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn reconcile(
        &self,
        existing: Enrollment,
        opts: &GrantOptions,
        enrolled_at: chrono::DateTime<Utc>,
    ) -> Result<Enrollment> {
        let already = CoreError::AlreadyEnrolled {
            user_id: existing.user_id,
            course_id: existing.course_id,
        };
        if existing.is_active() {
            return Err(already);
        }
        let updated = self
            .store
            .reconcile_enrollment(
                existing.id,
                opts.status,
                opts.external_txn_ref
                    .as_deref()
                    .or(existing.external_txn_ref.as_deref()),
                enrolled_at,
            )
            .await
            .map_err(|e| translate_txn_clash(e, opts.external_txn_ref.as_deref()))?;
        match updated {
            Some(enrollment) => {
                info!(
                    user_id = %enrollment.user_id, course_id = %enrollment.course_id,
                    enrollment_id = %enrollment.id, status = enrollment.status.as_str(),
                    "enrollment reconciled"
                );
                Ok(enrollment)
            }
            // activated between our read and write
            None => Err(already),
        }
    }

    /// Payment confirmation. Safe to call any number of times for the same
    /// reference.
    pub async fn activate_by_external_ref(
        &self,
        external_txn_ref: &str,
        user_id: Uuid,
        course_id: Uuid,
    ) -> Result<Enrollment> {
        let target = match self.store.enrollment_by_txn_ref(external_txn_ref).await? {
            Some(found) => {
                if found.user_id != user_id || found.course_id != course_id {
                    warn!(
                        external_txn_ref, %user_id, %course_id,
                        "confirmation metadata disagrees with stored enrollment, trusting the reference"
                    );
                }
                found
            }
            None => match self.store.latest_pending_enrollment(user_id, course_id).await? {
                Some(pending) => {
                    debug!(external_txn_ref, %user_id, %course_id, "reference unknown, using latest pending enrollment");
                    pending
                }
                None => {
                    return match self.store.enrollment(user_id, course_id).await? {
                        Some(active) if active.is_active() => {
                            debug!(external_txn_ref, %user_id, %course_id, "already active");
                            Ok(active)
                        }
                        _ => Err(CoreError::not_found("enrollment", external_txn_ref)),
                    };
                }
            },
        };

        if target.is_active() {
            debug!(external_txn_ref, enrollment_id = %target.id, "already active");
            return Ok(target);
        }

        let updated = self
            .store
            .reconcile_enrollment(
                target.id,
                EnrollmentStatus::Success,
                Some(external_txn_ref),
                Utc::now(),
            )
            .await
            .map_err(|e| translate_txn_clash(e, Some(external_txn_ref)))?;
        match updated {
            Some(enrollment) => {
                info!(
                    external_txn_ref, user_id = %enrollment.user_id,
                    course_id = %enrollment.course_id, "enrollment activated"
                );
                Ok(enrollment)
            }
            None => self.reload(target.user_id, target.course_id).await,
        }
    }

    /// Expiry, cancellation or denial of a checkout. Never downgrades an
    /// active enrollment.
    pub async fn fail_by_external_ref(&self, external_txn_ref: &str) -> Result<Enrollment> {
        let found = self
            .store
            .enrollment_by_txn_ref(external_txn_ref)
            .await?
            .ok_or_else(|| CoreError::not_found("enrollment", external_txn_ref))?;

        if found.is_active() || found.status == EnrollmentStatus::Failed {
            debug!(external_txn_ref, status = found.status.as_str(), "fail ignored");
            return Ok(found);
        }

        let updated = self
            .store
            .reconcile_enrollment(
                found.id,
                EnrollmentStatus::Failed,
                found.external_txn_ref.as_deref(),
                found.enrolled_at,
            )
            .await?;
        match updated {
            Some(enrollment) => {
                info!(external_txn_ref, enrollment_id = %enrollment.id, "enrollment failed");
                Ok(enrollment)
            }
            None => self.reload(found.user_id, found.course_id).await,
        }
    }

    pub async fn get(&self, user_id: Uuid, course_id: Uuid) -> Result<Option<Enrollment>> {
        Ok(self.store.enrollment(user_id, course_id).await?)
    }

    pub async fn is_active_for(&self, user_id: Uuid, course_id: Uuid) -> Result<bool> {
        Ok(self
            .store
            .enrollment(user_id, course_id)
            .await?
            .is_some_and(|e| e.is_active()))
    }

    /// Access gate used before any progress mutation.
    pub async fn require_active(&self, user_id: Uuid, course_id: Uuid) -> Result<()> {
        if self.is_active_for(user_id, course_id).await? {
            Ok(())
        } else {
            Err(CoreError::AccessDenied(format!(
                "user {user_id} is not enrolled in course {course_id}"
            )))
        }
    }

    async fn reload(&self, user_id: Uuid, course_id: Uuid) -> Result<Enrollment> {
        self.store
            .enrollment(user_id, course_id)
            .await?
            .ok_or_else(|| CoreError::not_found("enrollment", format!("{user_id}/{course_id}")))
    }
}

fn duplicate_txn_ref(external_txn_ref: Option<&str>) -> CoreError {
    CoreError::Validation(format!(
        "external transaction reference {} is already used by another enrollment",
        external_txn_ref.unwrap_or("<none>")
    ))
}

fn translate_txn_clash(err: StoreError, external_txn_ref: Option<&str>) -> CoreError {
    match err {
        StoreError::UniqueViolation { .. } => duplicate_txn_ref(external_txn_ref),
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SequentialIds;
    use crate::store::memory::Table;
    use crate::store::MemoryStore;
    use crate::test_utils::seed_course;

    async fn ledger() -> (EnrollmentLedger, Arc<MemoryStore>, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let course = seed_course(&store, 2).await;
        let ledger = EnrollmentLedger::new(store.clone(), Arc::new(SequentialIds::new()));
        (ledger, store, course.course.id)
    }

    #[tokio::test]
    async fn checkout_creates_pending_enrollment() {
        let (ledger, store, course) = ledger().await;
        let user = Uuid::new_v4();

        let e = ledger
            .grant_or_reconcile(user, course, GrantOptions::checkout("tx-1", 4900))
            .await
            .unwrap();
        assert_eq!(e.status, EnrollmentStatus::Pending);
        assert_eq!(e.amount_paid, 4900);
        assert!(!ledger.is_active_for(user, course).await.unwrap());
        assert_eq!(ledger.get(user, course).await.unwrap(), Some(e));
        assert_eq!(ledger.get(Uuid::new_v4(), course).await.unwrap(), None);
        assert_eq!(store.enrollment_rows().await.len(), 1);
    }

    #[tokio::test]
    async fn retry_after_failed_checkout_reuses_the_row() {
        let (ledger, store, course) = ledger().await;
        let user = Uuid::new_v4();

        let first = ledger
            .grant_or_reconcile(user, course, GrantOptions::checkout("tx-1", 4900))
            .await
            .unwrap();
        ledger.fail_by_external_ref("tx-1").await.unwrap();

        let retry = ledger
            .grant_or_reconcile(user, course, GrantOptions::checkout("tx-2", 4900))
            .await
            .unwrap();
        assert_eq!(retry.id, first.id);
        assert_eq!(retry.status, EnrollmentStatus::Pending);
        assert_eq!(retry.external_txn_ref.as_deref(), Some("tx-2"));
        assert_eq!(store.enrollment_rows().await.len(), 1);
    }

    #[tokio::test]
    async fn paid_course_cannot_be_bought_twice() {
        let (ledger, _store, course) = ledger().await;
        let user = Uuid::new_v4();
        ledger
            .grant_or_reconcile(user, course, GrantOptions::manual_grant())
            .await
            .unwrap();

        let err = ledger
            .grant_or_reconcile(user, course, GrantOptions::checkout("tx-9", 4900))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::AlreadyEnrolled { .. }));
    }

    #[tokio::test]
    async fn manual_grant_upgrades_pending_checkout() {
        let (ledger, _store, course) = ledger().await;
        let user = Uuid::new_v4();
        ledger
            .grant_or_reconcile(user, course, GrantOptions::checkout("tx-1", 4900))
            .await
            .unwrap();

        let granted = ledger
            .grant_or_reconcile(user, course, GrantOptions::manual_grant())
            .await
            .unwrap();
        assert!(granted.is_active());
        ledger.require_active(user, course).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_course_is_not_found() {
        let (ledger, _store, _course) = ledger().await;
        let err = ledger
            .grant_or_reconcile(Uuid::new_v4(), Uuid::new_v4(), GrantOptions::manual_grant())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound { entity: "course", .. }));
    }

    #[tokio::test]
    async fn racing_insert_falls_back_to_update() {
        let (ledger, store, course) = ledger().await;
        let user = Uuid::new_v4();
        ledger
            .grant_or_reconcile(user, course, GrantOptions::checkout("tx-1", 4900))
            .await
            .unwrap();

        // The second checkout does not see the first row and collides on insert.
        store.hide_next_lookups(Table::Enrollment, 1);
        let second = ledger
            .grant_or_reconcile(user, course, GrantOptions::checkout("tx-2", 4900))
            .await
            .unwrap();
        assert_eq!(second.external_txn_ref.as_deref(), Some("tx-2"));
        assert_eq!(store.enrollment_rows().await.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_checkouts_leave_one_row() {
        let (ledger, store, course) = ledger().await;
        let ledger = Arc::new(ledger);
        let user = Uuid::new_v4();

        let mut handles = Vec::new();
        for i in 0..16 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .grant_or_reconcile(user, course, GrantOptions::checkout(format!("tx-{i}"), 4900))
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(store.enrollment_rows().await.len(), 1);
    }

    #[tokio::test]
    async fn activation_is_idempotent() {
        let (ledger, store, course) = ledger().await;
        let user = Uuid::new_v4();
        ledger
            .grant_or_reconcile(user, course, GrantOptions::checkout("tx-1", 4900))
            .await
            .unwrap();

        for _ in 0..3 {
            let e = ledger.activate_by_external_ref("tx-1", user, course).await.unwrap();
            assert!(e.is_active());
        }
        let rows = store.enrollment_rows().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, EnrollmentStatus::Success);
    }

    #[tokio::test]
    async fn activation_with_unknown_reference_uses_pending_row() {
        let (ledger, _store, course) = ledger().await;
        let user = Uuid::new_v4();
        ledger
            .grant_or_reconcile(user, course, GrantOptions::checkout("tx-1", 4900))
            .await
            .unwrap();

        let e = ledger
            .activate_by_external_ref("provider-replay-7", user, course)
            .await
            .unwrap();
        assert!(e.is_active());
        assert_eq!(e.external_txn_ref.as_deref(), Some("provider-replay-7"));

        // replaying the old reference is also harmless now
        let again = ledger.activate_by_external_ref("tx-1", user, course).await.unwrap();
        assert!(again.is_active());
    }

    #[tokio::test]
    async fn fallback_activation_rejects_reference_held_elsewhere() {
        let (ledger, store, course) = ledger().await;
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        ledger
            .grant_or_reconcile(alice, course, GrantOptions::checkout("tx-a", 4900))
            .await
            .unwrap();
        ledger
            .grant_or_reconcile(bob, course, GrantOptions::checkout("tx-b", 4900))
            .await
            .unwrap();

        // bob's lookup of tx-a misses, so activation falls back to his pending row
        store.hide_next_lookups(Table::Enrollment, 1);
        let err = ledger
            .activate_by_external_ref("tx-a", bob, course)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)), "got {err:?}");

        let rows = store.enrollment_rows().await;
        let bob_row = rows.iter().find(|e| e.user_id == bob).unwrap();
        assert_eq!(bob_row.status, EnrollmentStatus::Pending);
        assert_eq!(bob_row.external_txn_ref.as_deref(), Some("tx-b"));
    }

    #[tokio::test]
    async fn activation_without_any_record_is_not_found() {
        let (ledger, _store, course) = ledger().await;
        let err = ledger
            .activate_by_external_ref("tx-404", Uuid::new_v4(), course)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn failure_never_downgrades_success() {
        let (ledger, _store, course) = ledger().await;
        let user = Uuid::new_v4();
        ledger
            .grant_or_reconcile(user, course, GrantOptions::checkout("tx-1", 4900))
            .await
            .unwrap();
        ledger.activate_by_external_ref("tx-1", user, course).await.unwrap();

        let e = ledger.fail_by_external_ref("tx-1").await.unwrap();
        assert!(e.is_active());
    }

    #[tokio::test]
    async fn storage_outage_leaves_no_row() {
        let (ledger, store, course) = ledger().await;
        store.set_fail_writes(true);
        let err = ledger
            .grant_or_reconcile(Uuid::new_v4(), course, GrantOptions::manual_grant())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::External(StoreError::Unavailable(_))));
        assert!(store.enrollment_rows().await.is_empty());
    }
}
