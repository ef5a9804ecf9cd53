// Every backend enforces the same uniqueness rules at write time and reports
// a clash as StoreError::UniqueViolation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::models::{
    Certificate, Completion, CourseModule, Course, Enrollment, EnrollmentStatus, ModuleProgress,
    QuestionWithOptions, Quiz, QuizAnswer, QuizAttempt, RenderedCertificate,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Constraint names shared by both backends.
pub mod constraints {
    pub const ENROLLMENT_USER_COURSE: &str = "enrollments_user_course_key";
    pub const ENROLLMENT_TXN_REF: &str = "enrollments_external_txn_ref_key";
    pub const PROGRESS_USER_MODULE: &str = "module_progress_user_module_key";
    pub const ATTEMPT_IN_PROGRESS: &str = "quiz_attempts_one_in_progress";
    pub const CERTIFICATE_USER_COURSE: &str = "certificates_user_course_key";
}

/// Outcome of [`LearningStore::finish_attempt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptClose {
    /// Another submit closed the attempt first; nothing was written.
    AlreadyClosed,
    /// `module` is `None` when no progress row was requested.
    Closed { module: Option<Completion> },
}

pub(crate) fn unique_violation(constraint: &str) -> StoreError {
    StoreError::UniqueViolation {
        constraint: constraint.to_string(),
    }
}

#[async_trait]
pub trait LearningStore: Send + Sync {
    // catalog
    async fn course(&self, course_id: Uuid) -> StoreResult<Option<Course>>;
    async fn module(&self, module_id: Uuid) -> StoreResult<Option<CourseModule>>;
    async fn count_modules(&self, course_id: Uuid) -> StoreResult<i64>;
    async fn quiz(&self, quiz_id: Uuid) -> StoreResult<Option<Quiz>>;
    /// The module a quiz is attached to, if any.
    async fn module_for_quiz(&self, quiz_id: Uuid) -> StoreResult<Option<CourseModule>>;
    /// Questions ordered by position, each with all of its options.
    async fn questions(&self, quiz_id: Uuid) -> StoreResult<Vec<QuestionWithOptions>>;

    // enrollments
    async fn enrollment(&self, user_id: Uuid, course_id: Uuid) -> StoreResult<Option<Enrollment>>;
    async fn enrollment_by_txn_ref(&self, external_txn_ref: &str) -> StoreResult<Option<Enrollment>>;
    async fn latest_pending_enrollment(
        &self,
        user_id: Uuid,
        course_id: Uuid,
    ) -> StoreResult<Option<Enrollment>>;
    async fn insert_enrollment(&self, enrollment: &Enrollment) -> StoreResult<()>;
    /// Overwrites status, external reference and enrolled-at unless the row
    /// is already `success`. Returns `None` when the guard rejected the write.
    async fn reconcile_enrollment(
        &self,
        enrollment_id: Uuid,
        status: EnrollmentStatus,
        external_txn_ref: Option<&str>,
        enrolled_at: DateTime<Utc>,
    ) -> StoreResult<Option<Enrollment>>;

    // progress
    async fn module_progress(&self, user_id: Uuid, module_id: Uuid) -> StoreResult<Option<ModuleProgress>>;
    async fn insert_module_progress(&self, progress: &ModuleProgress) -> StoreResult<()>;
    /// Ids of the course's modules the user has completed.
    async fn completed_modules(&self, user_id: Uuid, course_id: Uuid) -> StoreResult<Vec<Uuid>>;

    // attempts
    async fn attempt(&self, attempt_id: Uuid) -> StoreResult<Option<QuizAttempt>>;
    async fn in_progress_attempt(&self, user_id: Uuid, quiz_id: Uuid) -> StoreResult<Option<QuizAttempt>>;
    /// Completed attempts, oldest completion first.
    async fn completed_attempts(&self, user_id: Uuid, quiz_id: Uuid) -> StoreResult<Vec<QuizAttempt>>;
    async fn insert_attempt(&self, attempt: &QuizAttempt) -> StoreResult<()>;
    /// Persists a completed attempt and, in the same unit of work, the
    /// module completion its pass earns. Nothing is written unless the stored
    /// row is still `in_progress`.
    async fn finish_attempt(
        &self,
        attempt: &QuizAttempt,
        progress: Option<&ModuleProgress>,
    ) -> StoreResult<AttemptClose>;
    async fn upsert_answer(&self, answer: &QuizAnswer) -> StoreResult<()>;
    async fn answers(&self, attempt_id: Uuid) -> StoreResult<Vec<QuizAnswer>>;

    // certificates
    async fn certificate(&self, user_id: Uuid, course_id: Uuid) -> StoreResult<Option<Certificate>>;
    async fn certificate_by_id(&self, certificate_id: Uuid) -> StoreResult<Option<Certificate>>;
    async fn insert_certificate(&self, certificate: &Certificate) -> StoreResult<()>;
    /// Pending certificates, oldest first.
    async fn pending_certificates(&self, limit: i64) -> StoreResult<Vec<Certificate>>;
    /// pending -> generated. Returns `None` if the row was not pending.
    async fn mark_certificate_generated(
        &self,
        certificate_id: Uuid,
        rendered: &RenderedCertificate,
    ) -> StoreResult<Option<Certificate>>;
}
