use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::enrollment::EnrollmentLedger;
use crate::error::{CoreError, Result, StoreError};
use crate::ids::IdGenerator;
use crate::models::{Completion, CompletionOverview, ModuleCompletion, ModuleProgress};
use crate::store::LearningStore;

pub struct ProgressTracker {
    store: Arc<dyn LearningStore>,
    ids: Arc<dyn IdGenerator>,
    ledger: Arc<EnrollmentLedger>,
}

impl ProgressTracker {
    pub fn new(
        store: Arc<dyn LearningStore>,
        ids: Arc<dyn IdGenerator>,
        ledger: Arc<EnrollmentLedger>,
    ) -> Self {
        Self { store, ids, ledger }
    }

    /// Records the module as complete. Only the first call for a
    /// (user, module) pair reports [`Completion::NewlyCompleted`].
    pub async fn mark_module_complete(&self, user_id: Uuid, module_id: Uuid) -> Result<ModuleCompletion> {
        let module = self
            .store
            .module(module_id)
            .await?
            .ok_or_else(|| CoreError::not_found("module", module_id))?;
        self.ledger.require_active(user_id, module.course_id).await?;

        let done = |completion| ModuleCompletion {
            module_id,
            course_id: module.course_id,
            completion,
        };

        if self.store.module_progress(user_id, module_id).await?.is_some() {
            debug!(%user_id, %module_id, "module already completed");
            return Ok(done(Completion::AlreadyCompleted));
        }

        let row = self.new_row(user_id, module_id);
        match self.store.insert_module_progress(&row).await {
            Ok(()) => {
                info!(%user_id, %module_id, course_id = %module.course_id, "module completed");
                Ok(done(Completion::NewlyCompleted))
            }
            Err(StoreError::UniqueViolation { .. }) => {
                debug!(%user_id, %module_id, "module completion raced, keeping existing row");
                Ok(done(Completion::AlreadyCompleted))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Unsaved progress row; callers check enrollment first.
    pub(crate) fn new_row(&self, user_id: Uuid, module_id: Uuid) -> ModuleProgress {
        ModuleProgress {
            id: self.ids.next_id(),
            user_id,
            module_id,
            completed_at: Utc::now(),
        }
    }

    /// (completed, total) module counts for the course.
    pub async fn counts(&self, user_id: Uuid, course_id: Uuid) -> Result<(i64, i64)> {
        let total = self.store.count_modules(course_id).await?;
        let completed = self.store.completed_modules(user_id, course_id).await?.len() as i64;
        Ok((completed, total))
    }

    /// Fraction of the course's modules completed; 0.0 for an empty course.
    pub async fn completion_ratio(&self, user_id: Uuid, course_id: Uuid) -> Result<f64> {
        let (completed, total) = self.counts(user_id, course_id).await?;
        Ok(ratio(completed, total))
    }

    pub async fn overview(&self, user_id: Uuid, course_id: Uuid) -> Result<CompletionOverview> {
        self.ledger.require_active(user_id, course_id).await?;
        let total_modules = self.store.count_modules(course_id).await?;
        let completed_modules = self.store.completed_modules(user_id, course_id).await?;
        Ok(CompletionOverview {
            course_id,
            total_modules,
            ratio: ratio(completed_modules.len() as i64, total_modules),
            completed_modules,
        })
    }
}

fn ratio(completed: i64, total: i64) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    completed.min(total) as f64 / total as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SequentialIds;
    use crate::models::GrantOptions;
    use crate::store::memory::Table;
    use crate::store::MemoryStore;
    use crate::test_utils::{seed_course, SeededCourse};

    async fn tracker(modules: usize) -> (ProgressTracker, Arc<EnrollmentLedger>, Arc<MemoryStore>, SeededCourse) {
        let store = Arc::new(MemoryStore::new());
        let seeded = seed_course(&store, modules).await;
        let ids: Arc<dyn IdGenerator> = Arc::new(SequentialIds::new());
        let ledger = Arc::new(EnrollmentLedger::new(store.clone(), ids.clone()));
        let tracker = ProgressTracker::new(store.clone(), ids, ledger.clone());
        (tracker, ledger, store, seeded)
    }

    #[test]
    fn ratio_handles_empty_course() {
        assert_eq!(ratio(0, 0), 0.0);
        assert_eq!(ratio(1, 4), 0.25);
        assert_eq!(ratio(3, 3), 1.0);
    }

    #[tokio::test]
    async fn requires_active_enrollment() {
        let (tracker, _ledger, store, seeded) = tracker(2).await;
        let err = tracker
            .mark_module_complete(Uuid::new_v4(), seeded.modules[0].id)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::AccessDenied(_)));
        assert!(store.progress_rows().await.is_empty());
    }

    #[tokio::test]
    async fn second_mark_is_a_no_op() {
        let (tracker, ledger, store, seeded) = tracker(2).await;
        let user = Uuid::new_v4();
        ledger
            .grant_or_reconcile(user, seeded.course.id, GrantOptions::manual_grant())
            .await
            .unwrap();

        let first = tracker.mark_module_complete(user, seeded.modules[0].id).await.unwrap();
        let second = tracker.mark_module_complete(user, seeded.modules[0].id).await.unwrap();
        assert_eq!(first.completion, Completion::NewlyCompleted);
        assert_eq!(second.completion, Completion::AlreadyCompleted);
        assert_eq!(store.progress_rows().await.len(), 1);
        assert_eq!(tracker.completion_ratio(user, seeded.course.id).await.unwrap(), 0.5);
    }

    #[tokio::test]
    async fn insert_collision_reads_as_already_completed() {
        let (tracker, ledger, store, seeded) = tracker(1).await;
        let user = Uuid::new_v4();
        ledger
            .grant_or_reconcile(user, seeded.course.id, GrantOptions::manual_grant())
            .await
            .unwrap();
        tracker.mark_module_complete(user, seeded.modules[0].id).await.unwrap();

        store.hide_next_lookups(Table::Progress, 1);
        let again = tracker.mark_module_complete(user, seeded.modules[0].id).await.unwrap();
        assert!(!again.completion.is_new());
        assert_eq!(store.progress_rows().await.len(), 1);
    }

    #[tokio::test]
    async fn unknown_module_is_not_found() {
        let (tracker, _ledger, _store, _seeded) = tracker(1).await;
        let err = tracker
            .mark_module_complete(Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound { entity: "module", .. }));
    }

    #[tokio::test]
    async fn overview_lists_completed_modules_in_order() {
        let (tracker, ledger, _store, seeded) = tracker(3).await;
        let user = Uuid::new_v4();
        ledger
            .grant_or_reconcile(user, seeded.course.id, GrantOptions::manual_grant())
            .await
            .unwrap();
        tracker.mark_module_complete(user, seeded.modules[2].id).await.unwrap();
        tracker.mark_module_complete(user, seeded.modules[0].id).await.unwrap();

        let overview = tracker.overview(user, seeded.course.id).await.unwrap();
        assert_eq!(overview.total_modules, 3);
        assert_eq!(
            overview.completed_modules,
            vec![seeded.modules[0].id, seeded.modules[2].id]
        );
    }

    #[tokio::test]
    async fn empty_course_reports_zero() {
        let (tracker, _ledger, _store, seeded) = tracker(0).await;
        let ratio = tracker.completion_ratio(Uuid::new_v4(), seeded.course.id).await.unwrap();
        assert_eq!(ratio, 0.0);
    }
}
