// In-process LearningStore for tests. Same uniqueness rules as the schema.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{constraints, unique_violation, AttemptClose, LearningStore};
use crate::error::{StoreError, StoreResult};
use crate::models::{
    Certificate, CertificateStatus, Completion, Course, CourseModule, Enrollment, EnrollmentStatus,
    ModuleProgress, Question, QuestionOption, QuestionWithOptions, Quiz, QuizAnswer, QuizAttempt,
    RenderedCertificate,
};

#[derive(Default)]
struct Tables {
    courses: HashMap<Uuid, Course>,
    modules: HashMap<Uuid, CourseModule>,
    quizzes: HashMap<Uuid, Quiz>,
    questions: HashMap<Uuid, Vec<QuestionWithOptions>>,
    enrollments: Vec<Enrollment>,
    progress: Vec<ModuleProgress>,
    attempts: HashMap<Uuid, QuizAttempt>,
    answers: HashMap<(Uuid, Uuid), QuizAnswer>,
    certificates: Vec<Certificate>,
}

/// Tables whose lookups or writes can be made to misbehave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Enrollment = 0,
    Progress = 1,
    Attempt = 2,
    Certificate = 3,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    fail_writes: AtomicBool,
    stale_lookups: [AtomicUsize; 4],
    failing_writes: [AtomicUsize; 4],
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write fails with [`StoreError::Unavailable`] while set.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// The next `n` existence lookups of the given kind report nothing, the
    /// way a concurrent request that has not yet seen another's commit
    /// would. Writes still enforce uniqueness.
    pub fn hide_next_lookups(&self, table: Table, n: usize) {
        self.stale_lookups[table as usize].store(n, Ordering::SeqCst);
    }

    /// The next `n` writes to `table` fail with [`StoreError::Unavailable`].
    /// A failed write inside a unit of work leaves the whole unit unwritten.
    pub fn fail_next_writes(&self, table: Table, n: usize) {
        self.failing_writes[table as usize].store(n, Ordering::SeqCst);
    }

    fn stale(&self, table: Table) -> bool {
        take_one(&self.stale_lookups[table as usize])
    }

    fn check_writable(&self, table: Table) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store writes disabled".into()));
        }
        if take_one(&self.failing_writes[table as usize]) {
            return Err(StoreError::Unavailable(format!("{table:?} write failed")));
        }
        Ok(())
    }

    pub async fn add_course(&self, course: Course) {
        self.tables.write().await.courses.insert(course.id, course);
    }

    pub async fn add_module(&self, module: CourseModule) {
        self.tables.write().await.modules.insert(module.id, module);
    }

    pub async fn add_quiz(&self, quiz: Quiz) {
        self.tables.write().await.quizzes.insert(quiz.id, quiz);
    }

    pub async fn add_question(&self, question: Question, options: Vec<QuestionOption>) {
        let mut tables = self.tables.write().await;
        let list = tables.questions.entry(question.quiz_id).or_default();
        list.push(QuestionWithOptions { question, options });
        list.sort_by_key(|q| q.question.position);
    }

    pub async fn enrollment_rows(&self) -> Vec<Enrollment> {
        self.tables.read().await.enrollments.clone()
    }

    pub async fn progress_rows(&self) -> Vec<ModuleProgress> {
        self.tables.read().await.progress.clone()
    }

    pub async fn certificate_rows(&self) -> Vec<Certificate> {
        self.tables.read().await.certificates.clone()
    }

    pub async fn attempt_rows(&self) -> Vec<QuizAttempt> {
        self.tables.read().await.attempts.values().cloned().collect()
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn has_progress(tables: &Tables, user_id: Uuid, module_id: Uuid) -> bool {
    tables
        .progress
        .iter()
        .any(|p| p.user_id == user_id && p.module_id == module_id)
}

#[async_trait]
impl LearningStore for MemoryStore {
    async fn course(&self, course_id: Uuid) -> StoreResult<Option<Course>> {
        Ok(self.tables.read().await.courses.get(&course_id).cloned())
    }

    async fn module(&self, module_id: Uuid) -> StoreResult<Option<CourseModule>> {
        Ok(self.tables.read().await.modules.get(&module_id).cloned())
    }

    async fn count_modules(&self, course_id: Uuid) -> StoreResult<i64> {
        let tables = self.tables.read().await;
        Ok(tables.modules.values().filter(|m| m.course_id == course_id).count() as i64)
    }

    async fn quiz(&self, quiz_id: Uuid) -> StoreResult<Option<Quiz>> {
        Ok(self.tables.read().await.quizzes.get(&quiz_id).cloned())
    }

    async fn module_for_quiz(&self, quiz_id: Uuid) -> StoreResult<Option<CourseModule>> {
        let tables = self.tables.read().await;
        Ok(tables
            .modules
            .values()
            .filter(|m| m.quiz_id == Some(quiz_id))
            .min_by_key(|m| m.sequence_order)
            .cloned())
    }

    async fn questions(&self, quiz_id: Uuid) -> StoreResult<Vec<QuestionWithOptions>> {
        Ok(self
            .tables
            .read()
            .await
            .questions
            .get(&quiz_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn enrollment(&self, user_id: Uuid, course_id: Uuid) -> StoreResult<Option<Enrollment>> {
        if self.stale(Table::Enrollment) {
            return Ok(None);
        }
        let tables = self.tables.read().await;
        Ok(tables
            .enrollments
            .iter()
            .find(|e| e.user_id == user_id && e.course_id == course_id)
            .cloned())
    }

    async fn enrollment_by_txn_ref(&self, external_txn_ref: &str) -> StoreResult<Option<Enrollment>> {
        if self.stale(Table::Enrollment) {
            return Ok(None);
        }
        let tables = self.tables.read().await;
        Ok(tables
            .enrollments
            .iter()
            .find(|e| e.external_txn_ref.as_deref() == Some(external_txn_ref))
            .cloned())
    }

    async fn latest_pending_enrollment(
        &self,
        user_id: Uuid,
        course_id: Uuid,
    ) -> StoreResult<Option<Enrollment>> {
        let tables = self.tables.read().await;
        Ok(tables
            .enrollments
            .iter()
            .filter(|e| {
                e.user_id == user_id
                    && e.course_id == course_id
                    && e.status == EnrollmentStatus::Pending
            })
            .max_by_key(|e| e.enrolled_at)
            .cloned())
    }

    async fn insert_enrollment(&self, enrollment: &Enrollment) -> StoreResult<()> {
        self.check_writable(Table::Enrollment)?;
        let mut tables = self.tables.write().await;
        if tables
            .enrollments
            .iter()
            .any(|e| e.user_id == enrollment.user_id && e.course_id == enrollment.course_id)
        {
            return Err(unique_violation(constraints::ENROLLMENT_USER_COURSE));
        }
        if let Some(txn) = enrollment.external_txn_ref.as_deref() {
            if tables
                .enrollments
                .iter()
                .any(|e| e.external_txn_ref.as_deref() == Some(txn))
            {
                return Err(unique_violation(constraints::ENROLLMENT_TXN_REF));
            }
        }
        tables.enrollments.push(enrollment.clone());
        Ok(())
    }

    async fn reconcile_enrollment(
        &self,
        enrollment_id: Uuid,
        status: EnrollmentStatus,
        external_txn_ref: Option<&str>,
        enrolled_at: DateTime<Utc>,
    ) -> StoreResult<Option<Enrollment>> {
        self.check_writable(Table::Enrollment)?;
        let mut tables = self.tables.write().await;
        if let Some(txn) = external_txn_ref {
            if tables
                .enrollments
                .iter()
                .any(|e| e.id != enrollment_id && e.external_txn_ref.as_deref() == Some(txn))
            {
                return Err(unique_violation(constraints::ENROLLMENT_TXN_REF));
            }
        }
        let Some(row) = tables.enrollments.iter_mut().find(|e| e.id == enrollment_id) else {
            return Ok(None);
        };
        if row.status == EnrollmentStatus::Success {
            return Ok(None);
        }
        row.status = status;
        row.external_txn_ref = external_txn_ref.map(str::to_string);
        row.enrolled_at = enrolled_at;
        Ok(Some(row.clone()))
    }

    async fn module_progress(&self, user_id: Uuid, module_id: Uuid) -> StoreResult<Option<ModuleProgress>> {
        if self.stale(Table::Progress) {
            return Ok(None);
        }
        let tables = self.tables.read().await;
        Ok(tables
            .progress
            .iter()
            .find(|p| p.user_id == user_id && p.module_id == module_id)
            .cloned())
    }

    async fn insert_module_progress(&self, progress: &ModuleProgress) -> StoreResult<()> {
        self.check_writable(Table::Progress)?;
        let mut tables = self.tables.write().await;
        if has_progress(&tables, progress.user_id, progress.module_id) {
            return Err(unique_violation(constraints::PROGRESS_USER_MODULE));
        }
        tables.progress.push(progress.clone());
        Ok(())
    }

    async fn completed_modules(&self, user_id: Uuid, course_id: Uuid) -> StoreResult<Vec<Uuid>> {
        let tables = self.tables.read().await;
        let mut done: Vec<&CourseModule> = tables
            .progress
            .iter()
            .filter(|p| p.user_id == user_id)
            .filter_map(|p| tables.modules.get(&p.module_id))
            .filter(|m| m.course_id == course_id)
            .collect();
        done.sort_by_key(|m| m.sequence_order);
        Ok(done.into_iter().map(|m| m.id).collect())
    }

    async fn attempt(&self, attempt_id: Uuid) -> StoreResult<Option<QuizAttempt>> {
        Ok(self.tables.read().await.attempts.get(&attempt_id).cloned())
    }

    async fn in_progress_attempt(&self, user_id: Uuid, quiz_id: Uuid) -> StoreResult<Option<QuizAttempt>> {
        if self.stale(Table::Attempt) {
            return Ok(None);
        }
        let tables = self.tables.read().await;
        Ok(tables
            .attempts
            .values()
            .find(|a| a.user_id == user_id && a.quiz_id == quiz_id && a.is_in_progress())
            .cloned())
    }

    async fn completed_attempts(&self, user_id: Uuid, quiz_id: Uuid) -> StoreResult<Vec<QuizAttempt>> {
        let tables = self.tables.read().await;
        let mut done: Vec<QuizAttempt> = tables
            .attempts
            .values()
            .filter(|a| a.user_id == user_id && a.quiz_id == quiz_id && !a.is_in_progress())
            .cloned()
            .collect();
        done.sort_by_key(|a| (a.completed_at(), a.started_at));
        Ok(done)
    }

    async fn insert_attempt(&self, attempt: &QuizAttempt) -> StoreResult<()> {
        self.check_writable(Table::Attempt)?;
        let mut tables = self.tables.write().await;
        if attempt.is_in_progress()
            && tables.attempts.values().any(|a| {
                a.user_id == attempt.user_id && a.quiz_id == attempt.quiz_id && a.is_in_progress()
            })
        {
            return Err(unique_violation(constraints::ATTEMPT_IN_PROGRESS));
        }
        tables.attempts.insert(attempt.id, attempt.clone());
        Ok(())
    }

    async fn finish_attempt(
        &self,
        attempt: &QuizAttempt,
        progress: Option<&ModuleProgress>,
    ) -> StoreResult<AttemptClose> {
        let mut tables = self.tables.write().await;
        if !tables
            .attempts
            .get(&attempt.id)
            .is_some_and(QuizAttempt::is_in_progress)
        {
            return Ok(AttemptClose::AlreadyClosed);
        }
        // all checks first, then mutate: the unit is written whole or not at all
        self.check_writable(Table::Attempt)?;
        if progress.is_some() {
            self.check_writable(Table::Progress)?;
        }

        if let Some(row) = tables.attempts.get_mut(&attempt.id) {
            row.status = attempt.status;
        }
        let module = progress.map(|p| {
            if has_progress(&tables, p.user_id, p.module_id) {
                Completion::AlreadyCompleted
            } else {
                tables.progress.push(p.clone());
                Completion::NewlyCompleted
            }
        });
        Ok(AttemptClose::Closed { module })
    }

    async fn upsert_answer(&self, answer: &QuizAnswer) -> StoreResult<()> {
        self.check_writable(Table::Attempt)?;
        self.tables
            .write()
            .await
            .answers
            .insert((answer.attempt_id, answer.question_id), answer.clone());
        Ok(())
    }

    async fn answers(&self, attempt_id: Uuid) -> StoreResult<Vec<QuizAnswer>> {
        let tables = self.tables.read().await;
        Ok(tables
            .answers
            .values()
            .filter(|a| a.attempt_id == attempt_id)
            .cloned()
            .collect())
    }

    async fn certificate(&self, user_id: Uuid, course_id: Uuid) -> StoreResult<Option<Certificate>> {
        if self.stale(Table::Certificate) {
            return Ok(None);
        }
        let tables = self.tables.read().await;
        Ok(tables
            .certificates
            .iter()
            .find(|c| c.user_id == user_id && c.course_id == course_id)
            .cloned())
    }

    async fn certificate_by_id(&self, certificate_id: Uuid) -> StoreResult<Option<Certificate>> {
        let tables = self.tables.read().await;
        Ok(tables.certificates.iter().find(|c| c.id == certificate_id).cloned())
    }

    async fn insert_certificate(&self, certificate: &Certificate) -> StoreResult<()> {
        self.check_writable(Table::Certificate)?;
        let mut tables = self.tables.write().await;
        if tables
            .certificates
            .iter()
            .any(|c| c.user_id == certificate.user_id && c.course_id == certificate.course_id)
        {
            return Err(unique_violation(constraints::CERTIFICATE_USER_COURSE));
        }
        tables.certificates.push(certificate.clone());
        Ok(())
    }

    async fn pending_certificates(&self, limit: i64) -> StoreResult<Vec<Certificate>> {
        let tables = self.tables.read().await;
        let mut pending: Vec<Certificate> = tables
            .certificates
            .iter()
            .filter(|c| c.status == CertificateStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|c| c.issued_at);
        pending.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(pending)
    }

    async fn mark_certificate_generated(
        &self,
        certificate_id: Uuid,
        rendered: &RenderedCertificate,
    ) -> StoreResult<Option<Certificate>> {
        self.check_writable(Table::Certificate)?;
        let mut tables = self.tables.write().await;
        let Some(row) = tables
            .certificates
            .iter_mut()
            .find(|c| c.id == certificate_id && c.status == CertificateStatus::Pending)
        else {
            return Ok(None);
        };
        row.status = CertificateStatus::Generated;
        row.certificate_url = Some(rendered.certificate_url.clone());
        row.recipient_name = Some(rendered.recipient_name.clone());
        row.course_title = Some(rendered.course_title.clone());
        row.instructor_name = rendered.instructor_name.clone();
        Ok(Some(row.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enrollment(user_id: Uuid, course_id: Uuid, txn: Option<&str>) -> Enrollment {
        Enrollment {
            id: Uuid::new_v4(),
            user_id,
            course_id,
            external_txn_ref: txn.map(str::to_string),
            status: EnrollmentStatus::Pending,
            amount_paid: 4900,
            enrolled_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn duplicate_enrollment_is_a_unique_violation() {
        let store = MemoryStore::new();
        let (user, course) = (Uuid::new_v4(), Uuid::new_v4());
        store.insert_enrollment(&enrollment(user, course, Some("tx-1"))).await.unwrap();

        let err = store
            .insert_enrollment(&enrollment(user, course, Some("tx-2")))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::UniqueViolation { ref constraint } if constraint == constraints::ENROLLMENT_USER_COURSE
        ));
        assert_eq!(store.enrollment_rows().await.len(), 1);
    }

    #[tokio::test]
    async fn reconcile_never_touches_success_rows() {
        let store = MemoryStore::new();
        let mut row = enrollment(Uuid::new_v4(), Uuid::new_v4(), None);
        row.status = EnrollmentStatus::Success;
        store.insert_enrollment(&row).await.unwrap();

        let updated = store
            .reconcile_enrollment(row.id, EnrollmentStatus::Failed, None, Utc::now())
            .await
            .unwrap();
        assert!(updated.is_none());
        assert_eq!(store.enrollment_rows().await[0].status, EnrollmentStatus::Success);
    }

    #[tokio::test]
    async fn hidden_lookups_still_conflict_on_write() {
        let store = MemoryStore::new();
        let (user, course) = (Uuid::new_v4(), Uuid::new_v4());
        store.insert_enrollment(&enrollment(user, course, None)).await.unwrap();

        store.hide_next_lookups(Table::Enrollment, 1);
        assert!(store.enrollment(user, course).await.unwrap().is_none());
        let err = store.insert_enrollment(&enrollment(user, course, None)).await.unwrap_err();
        assert!(err.is_unique_violation());
        assert!(store.enrollment(user, course).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_writes_leave_tables_untouched() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        let err = store
            .insert_enrollment(&enrollment(Uuid::new_v4(), Uuid::new_v4(), None))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(store.enrollment_rows().await.is_empty());
    }
}
