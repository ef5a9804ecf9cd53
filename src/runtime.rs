// Wiring of the enrollment-to-completion services over one store

use std::sync::Arc;

use uuid::Uuid;

use crate::certificate::CertificateEligibilityMonitor;
use crate::enrollment::EnrollmentLedger;
use crate::error::Result;
use crate::ids::{IdGenerator, RandomIds};
use crate::models::ModuleCompletion;
use crate::progress::ProgressTracker;
use crate::quiz::QuizSessionEngine;
use crate::store::{LearningStore, MemoryStore};

#[derive(Clone)]
pub struct Runtime {
    pub ledger: Arc<EnrollmentLedger>,
    pub progress: Arc<ProgressTracker>,
    pub quizzes: Arc<QuizSessionEngine>,
    pub certificates: Arc<CertificateEligibilityMonitor>,
}

impl Runtime {
    pub fn new(store: Arc<dyn LearningStore>, ids: Arc<dyn IdGenerator>) -> Self {
        let ledger = Arc::new(EnrollmentLedger::new(store.clone(), ids.clone()));
        let progress = Arc::new(ProgressTracker::new(store.clone(), ids.clone(), ledger.clone()));
        let certificates = Arc::new(CertificateEligibilityMonitor::new(
            store.clone(),
            ids.clone(),
            progress.clone(),
        ));
        let quizzes = Arc::new(QuizSessionEngine::new(
            store,
            ids,
            ledger.clone(),
            progress.clone(),
            certificates.clone(),
        ));
        Runtime {
            ledger,
            progress,
            quizzes,
            certificates,
        }
    }

    pub fn in_memory(store: Arc<MemoryStore>) -> Self {
        Self::new(store, Arc::new(RandomIds))
    }

    /// Learner-initiated "mark complete". Eligibility is checked on every
    /// call, so a retry issues a certificate an earlier call failed to write.
    pub async fn complete_module(&self, user_id: Uuid, module_id: Uuid) -> Result<ModuleCompletion> {
        let done = self.progress.mark_module_complete(user_id, module_id).await?;
        self.certificates
            .on_module_completed(user_id, done.course_id)
            .await?;
        Ok(done)
    }
}
