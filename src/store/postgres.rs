// Uniqueness lives in the schema; a violated constraint comes back as
// StoreError::UniqueViolation through From<sqlx::Error>.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{query, query_as, query_scalar};
use uuid::Uuid;

use super::{AttemptClose, LearningStore};
use crate::db::Db;
use crate::error::{StoreError, StoreResult};
use crate::models::{
    AttemptStatus, Certificate, CertificateStatus, Completion, Course, CourseModule, Enrollment,
    EnrollmentStatus, ModuleProgress, Question, QuestionOption, QuestionWithOptions, Quiz,
    QuizAnswer, QuizAttempt, QuizRules, RenderedCertificate,
};

const ENROLLMENT_COLUMNS: &str =
    "id, user_id, course_id, external_txn_ref, status, amount_paid, enrolled_at";
const ATTEMPT_COLUMNS: &str = "id, user_id, quiz_id, status, score, pass_threshold, max_attempts, \
     time_limit_minutes, started_at, completed_at";
const CERTIFICATE_COLUMNS: &str = "id, user_id, course_id, status, recipient_name, course_title, \
     instructor_name, issued_at, total_hours, certificate_url";

fn decode_err(e: impl std::error::Error + Send + Sync + 'static) -> StoreError {
    StoreError::Database(sqlx::Error::Decode(Box::new(e)))
}

#[derive(sqlx::FromRow)]
struct EnrollmentRow {
    id: Uuid,
    user_id: Uuid,
    course_id: Uuid,
    external_txn_ref: Option<String>,
    status: String,
    amount_paid: i64,
    enrolled_at: DateTime<Utc>,
}

impl TryFrom<EnrollmentRow> for Enrollment {
    type Error = StoreError;

    fn try_from(r: EnrollmentRow) -> Result<Self, Self::Error> {
        Ok(Enrollment {
            id: r.id,
            user_id: r.user_id,
            course_id: r.course_id,
            external_txn_ref: r.external_txn_ref,
            status: r.status.parse().map_err(decode_err)?,
            amount_paid: r.amount_paid,
            enrolled_at: r.enrolled_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AttemptRow {
    id: Uuid,
    user_id: Uuid,
    quiz_id: Uuid,
    status: String,
    score: Option<f64>,
    pass_threshold: f64,
    max_attempts: i32,
    time_limit_minutes: i32,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
#[error("attempt {0} has inconsistent status columns")]
struct InconsistentAttempt(Uuid);

impl TryFrom<AttemptRow> for QuizAttempt {
    type Error = StoreError;

    fn try_from(r: AttemptRow) -> Result<Self, Self::Error> {
        let status = match (r.status.as_str(), r.score, r.completed_at) {
            ("in_progress", _, _) => AttemptStatus::InProgress,
            ("completed", Some(score), Some(completed_at)) => AttemptStatus::Completed {
                score,
                completed_at,
            },
            _ => return Err(decode_err(InconsistentAttempt(r.id))),
        };
        Ok(QuizAttempt {
            id: r.id,
            user_id: r.user_id,
            quiz_id: r.quiz_id,
            started_at: r.started_at,
            rules: QuizRules {
                pass_threshold: r.pass_threshold,
                max_attempts: r.max_attempts,
                time_limit_minutes: r.time_limit_minutes,
            },
            status,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CertificateRow {
    id: Uuid,
    user_id: Uuid,
    course_id: Uuid,
    status: String,
    recipient_name: Option<String>,
    course_title: Option<String>,
    instructor_name: Option<String>,
    issued_at: DateTime<Utc>,
    total_hours: Option<i32>,
    certificate_url: Option<String>,
}

impl TryFrom<CertificateRow> for Certificate {
    type Error = StoreError;

    fn try_from(r: CertificateRow) -> Result<Self, Self::Error> {
        Ok(Certificate {
            id: r.id,
            user_id: r.user_id,
            course_id: r.course_id,
            status: r.status.parse::<CertificateStatus>().map_err(decode_err)?,
            recipient_name: r.recipient_name,
            course_title: r.course_title,
            instructor_name: r.instructor_name,
            issued_at: r.issued_at,
            total_hours: r.total_hours,
            certificate_url: r.certificate_url,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CourseRow {
    id: Uuid,
    title: String,
    instructor_name: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct ModuleRow {
    id: Uuid,
    course_id: Uuid,
    title: String,
    sequence_order: i32,
    quiz_id: Option<Uuid>,
}

impl From<ModuleRow> for CourseModule {
    fn from(r: ModuleRow) -> Self {
        CourseModule {
            id: r.id,
            course_id: r.course_id,
            title: r.title,
            sequence_order: r.sequence_order,
            quiz_id: r.quiz_id,
        }
    }
}

#[derive(sqlx::FromRow)]
struct QuizRow {
    id: Uuid,
    title: String,
    pass_threshold: f64,
    max_attempts: i32,
    time_limit_minutes: i32,
}

#[derive(sqlx::FromRow)]
struct QuestionRow {
    id: Uuid,
    quiz_id: Uuid,
    prompt: String,
    position: i32,
}

#[derive(sqlx::FromRow)]
struct OptionRow {
    id: Uuid,
    question_id: Uuid,
    label: String,
    position: i32,
    is_correct: bool,
}

#[derive(sqlx::FromRow)]
struct ProgressRow {
    id: Uuid,
    user_id: Uuid,
    module_id: Uuid,
    completed_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct AnswerRow {
    attempt_id: Uuid,
    question_id: Uuid,
    selected_option_id: Uuid,
    answered_at: DateTime<Utc>,
}

impl From<AnswerRow> for QuizAnswer {
    fn from(r: AnswerRow) -> Self {
        QuizAnswer {
            attempt_id: r.attempt_id,
            question_id: r.question_id,
            selected_option_id: r.selected_option_id,
            answered_at: r.answered_at,
        }
    }
}

pub struct PgStore {
    db: Db,
}

impl PgStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    async fn fetch_enrollment(&self, sql: &str, binds: EnrollmentKey<'_>) -> StoreResult<Option<Enrollment>> {
        let q = query_as::<_, EnrollmentRow>(sql);
        let q = match binds {
            EnrollmentKey::Pair(user_id, course_id) => q.bind(user_id).bind(course_id),
            EnrollmentKey::TxnRef(txn) => q.bind(txn),
        };
        q.fetch_optional(&self.db).await?.map(Enrollment::try_from).transpose()
    }
}

enum EnrollmentKey<'a> {
    Pair(Uuid, Uuid),
    TxnRef(&'a str),
}

#[async_trait]
impl LearningStore for PgStore {
    async fn course(&self, course_id: Uuid) -> StoreResult<Option<Course>> {
        let row = query_as::<_, CourseRow>(
            "SELECT id, title, instructor_name, created_at FROM courses WHERE id = $1",
        )
        .bind(course_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(|r| Course {
            id: r.id,
            title: r.title,
            instructor_name: r.instructor_name,
            created_at: r.created_at,
        }))
    }

    async fn module(&self, module_id: Uuid) -> StoreResult<Option<CourseModule>> {
        let row = query_as::<_, ModuleRow>(
            "SELECT id, course_id, title, sequence_order, quiz_id FROM course_modules WHERE id = $1",
        )
        .bind(module_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(CourseModule::from))
    }

    async fn count_modules(&self, course_id: Uuid) -> StoreResult<i64> {
        let n: i64 = query_scalar("SELECT COUNT(*) FROM course_modules WHERE course_id = $1")
            .bind(course_id)
            .fetch_one(&self.db)
            .await?;
        Ok(n)
    }

    async fn quiz(&self, quiz_id: Uuid) -> StoreResult<Option<Quiz>> {
        let row = query_as::<_, QuizRow>(
            "SELECT id, title, pass_threshold, max_attempts, time_limit_minutes FROM quizzes WHERE id = $1",
        )
        .bind(quiz_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(|r| Quiz {
            id: r.id,
            title: r.title,
            pass_threshold: r.pass_threshold,
            max_attempts: r.max_attempts,
            time_limit_minutes: r.time_limit_minutes,
        }))
    }

    async fn module_for_quiz(&self, quiz_id: Uuid) -> StoreResult<Option<CourseModule>> {
        let row = query_as::<_, ModuleRow>(
            r#"
            SELECT id, course_id, title, sequence_order, quiz_id
            FROM course_modules WHERE quiz_id = $1
            ORDER BY sequence_order LIMIT 1
            "#,
        )
        .bind(quiz_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(CourseModule::from))
    }

    async fn questions(&self, quiz_id: Uuid) -> StoreResult<Vec<QuestionWithOptions>> {
        let questions = query_as::<_, QuestionRow>(
            "SELECT id, quiz_id, prompt, position FROM questions WHERE quiz_id = $1 ORDER BY position, id",
        )
        .bind(quiz_id)
        .fetch_all(&self.db)
        .await?;

        let options = query_as::<_, OptionRow>(
            r#"
            SELECT o.id, o.question_id, o.label, o.position, o.is_correct
            FROM question_options o
            JOIN questions q ON q.id = o.question_id
            WHERE q.quiz_id = $1
            ORDER BY o.position, o.id
            "#,
        )
        .bind(quiz_id)
        .fetch_all(&self.db)
        .await?;

        let mut by_question: HashMap<Uuid, Vec<QuestionOption>> = HashMap::new();
        for o in options {
            by_question.entry(o.question_id).or_default().push(QuestionOption {
                id: o.id,
                question_id: o.question_id,
                label: o.label,
                position: o.position,
                is_correct: o.is_correct,
            });
        }

        Ok(questions
            .into_iter()
            .map(|q| QuestionWithOptions {
                options: by_question.remove(&q.id).unwrap_or_default(),
                question: Question {
                    id: q.id,
                    quiz_id: q.quiz_id,
                    prompt: q.prompt,
                    position: q.position,
                },
            })
            .collect())
    }

    async fn enrollment(&self, user_id: Uuid, course_id: Uuid) -> StoreResult<Option<Enrollment>> {
        let sql = format!(
            "SELECT {ENROLLMENT_COLUMNS} FROM enrollments WHERE user_id = $1 AND course_id = $2"
        );
        self.fetch_enrollment(&sql, EnrollmentKey::Pair(user_id, course_id)).await
    }

    async fn enrollment_by_txn_ref(&self, external_txn_ref: &str) -> StoreResult<Option<Enrollment>> {
        let sql = format!("SELECT {ENROLLMENT_COLUMNS} FROM enrollments WHERE external_txn_ref = $1");
        self.fetch_enrollment(&sql, EnrollmentKey::TxnRef(external_txn_ref)).await
    }

    async fn latest_pending_enrollment(
        &self,
        user_id: Uuid,
        course_id: Uuid,
    ) -> StoreResult<Option<Enrollment>> {
        let sql = format!(
            "SELECT {ENROLLMENT_COLUMNS} FROM enrollments \
             WHERE user_id = $1 AND course_id = $2 AND status = 'pending' \
             ORDER BY enrolled_at DESC LIMIT 1"
        );
        self.fetch_enrollment(&sql, EnrollmentKey::Pair(user_id, course_id)).await
    }

    async fn insert_enrollment(&self, e: &Enrollment) -> StoreResult<()> {
        query(
            r#"
            INSERT INTO enrollments (id, user_id, course_id, external_txn_ref, status, amount_paid, enrolled_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7)
            "#,
        )
        .bind(e.id)
        .bind(e.user_id)
        .bind(e.course_id)
        .bind(e.external_txn_ref.as_deref())
        .bind(e.status.as_str())
        .bind(e.amount_paid)
        .bind(e.enrolled_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn reconcile_enrollment(
        &self,
        enrollment_id: Uuid,
        status: EnrollmentStatus,
        external_txn_ref: Option<&str>,
        enrolled_at: DateTime<Utc>,
    ) -> StoreResult<Option<Enrollment>> {
        let sql = format!(
            "UPDATE enrollments SET status = $2, external_txn_ref = $3, enrolled_at = $4 \
             WHERE id = $1 AND status <> 'success' \
             RETURNING {ENROLLMENT_COLUMNS}"
        );
        query_as::<_, EnrollmentRow>(&sql)
            .bind(enrollment_id)
            .bind(status.as_str())
            .bind(external_txn_ref)
            .bind(enrolled_at)
            .fetch_optional(&self.db)
            .await?
            .map(Enrollment::try_from)
            .transpose()
    }

    async fn module_progress(&self, user_id: Uuid, module_id: Uuid) -> StoreResult<Option<ModuleProgress>> {
        let row = query_as::<_, ProgressRow>(
            "SELECT id, user_id, module_id, completed_at FROM module_progress WHERE user_id = $1 AND module_id = $2",
        )
        .bind(user_id)
        .bind(module_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(|r| ModuleProgress {
            id: r.id,
            user_id: r.user_id,
            module_id: r.module_id,
            completed_at: r.completed_at,
        }))
    }

    async fn insert_module_progress(&self, p: &ModuleProgress) -> StoreResult<()> {
        query("INSERT INTO module_progress (id, user_id, module_id, completed_at) VALUES ($1,$2,$3,$4)")
            .bind(p.id)
            .bind(p.user_id)
            .bind(p.module_id)
            .bind(p.completed_at)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn completed_modules(&self, user_id: Uuid, course_id: Uuid) -> StoreResult<Vec<Uuid>> {
        let ids: Vec<Uuid> = query_scalar(
            r#"
            SELECT m.id
            FROM module_progress p
            JOIN course_modules m ON m.id = p.module_id
            WHERE p.user_id = $1 AND m.course_id = $2
            ORDER BY m.sequence_order, m.id
            "#,
        )
        .bind(user_id)
        .bind(course_id)
        .fetch_all(&self.db)
        .await?;
        Ok(ids)
    }

    async fn attempt(&self, attempt_id: Uuid) -> StoreResult<Option<QuizAttempt>> {
        let sql = format!("SELECT {ATTEMPT_COLUMNS} FROM quiz_attempts WHERE id = $1");
        query_as::<_, AttemptRow>(&sql)
            .bind(attempt_id)
            .fetch_optional(&self.db)
            .await?
            .map(QuizAttempt::try_from)
            .transpose()
    }

    async fn in_progress_attempt(&self, user_id: Uuid, quiz_id: Uuid) -> StoreResult<Option<QuizAttempt>> {
        let sql = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM quiz_attempts \
             WHERE user_id = $1 AND quiz_id = $2 AND status = 'in_progress' LIMIT 1"
        );
        query_as::<_, AttemptRow>(&sql)
            .bind(user_id)
            .bind(quiz_id)
            .fetch_optional(&self.db)
            .await?
            .map(QuizAttempt::try_from)
            .transpose()
    }

    async fn completed_attempts(&self, user_id: Uuid, quiz_id: Uuid) -> StoreResult<Vec<QuizAttempt>> {
        let sql = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM quiz_attempts \
             WHERE user_id = $1 AND quiz_id = $2 AND status = 'completed' \
             ORDER BY completed_at, started_at"
        );
        query_as::<_, AttemptRow>(&sql)
            .bind(user_id)
            .bind(quiz_id)
            .fetch_all(&self.db)
            .await?
            .into_iter()
            .map(QuizAttempt::try_from)
            .collect()
    }

    async fn insert_attempt(&self, a: &QuizAttempt) -> StoreResult<()> {
        query(
            r#"
            INSERT INTO quiz_attempts
                (id, user_id, quiz_id, status, score, pass_threshold, max_attempts, time_limit_minutes, started_at, completed_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
            "#,
        )
        .bind(a.id)
        .bind(a.user_id)
        .bind(a.quiz_id)
        .bind(a.status.as_str())
        .bind(a.score())
        .bind(a.rules.pass_threshold)
        .bind(a.rules.max_attempts)
        .bind(a.rules.time_limit_minutes)
        .bind(a.started_at)
        .bind(a.completed_at())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn finish_attempt(
        &self,
        a: &QuizAttempt,
        progress: Option<&ModuleProgress>,
    ) -> StoreResult<AttemptClose> {
        let mut tx = self.db.begin().await?;
        let closed = query(
            r#"
            UPDATE quiz_attempts SET status = 'completed', score = $2, completed_at = $3
            WHERE id = $1 AND status = 'in_progress'
            "#,
        )
        .bind(a.id)
        .bind(a.score())
        .bind(a.completed_at())
        .execute(&mut *tx)
        .await?;
        if closed.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(AttemptClose::AlreadyClosed);
        }

        let module = match progress {
            Some(p) => {
                let inserted = query(
                    r#"
                    INSERT INTO module_progress (id, user_id, module_id, completed_at)
                    VALUES ($1,$2,$3,$4)
                    ON CONFLICT (user_id, module_id) DO NOTHING
                    "#,
                )
                .bind(p.id)
                .bind(p.user_id)
                .bind(p.module_id)
                .bind(p.completed_at)
                .execute(&mut *tx)
                .await?;
                Some(if inserted.rows_affected() == 1 {
                    Completion::NewlyCompleted
                } else {
                    Completion::AlreadyCompleted
                })
            }
            None => None,
        };
        tx.commit().await?;
        Ok(AttemptClose::Closed { module })
    }

    async fn upsert_answer(&self, a: &QuizAnswer) -> StoreResult<()> {
        query(
            r#"
            INSERT INTO quiz_answers (attempt_id, question_id, selected_option_id, answered_at)
            VALUES ($1,$2,$3,$4)
            ON CONFLICT (attempt_id, question_id)
            DO UPDATE SET selected_option_id = EXCLUDED.selected_option_id, answered_at = EXCLUDED.answered_at
            "#,
        )
        .bind(a.attempt_id)
        .bind(a.question_id)
        .bind(a.selected_option_id)
        .bind(a.answered_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn answers(&self, attempt_id: Uuid) -> StoreResult<Vec<QuizAnswer>> {
        let rows = query_as::<_, AnswerRow>(
            "SELECT attempt_id, question_id, selected_option_id, answered_at FROM quiz_answers WHERE attempt_id = $1",
        )
        .bind(attempt_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(QuizAnswer::from).collect())
    }

    async fn certificate(&self, user_id: Uuid, course_id: Uuid) -> StoreResult<Option<Certificate>> {
        let sql = format!(
            "SELECT {CERTIFICATE_COLUMNS} FROM certificates WHERE user_id = $1 AND course_id = $2"
        );
        query_as::<_, CertificateRow>(&sql)
            .bind(user_id)
            .bind(course_id)
            .fetch_optional(&self.db)
            .await?
            .map(Certificate::try_from)
            .transpose()
    }

    async fn certificate_by_id(&self, certificate_id: Uuid) -> StoreResult<Option<Certificate>> {
        let sql = format!("SELECT {CERTIFICATE_COLUMNS} FROM certificates WHERE id = $1");
        query_as::<_, CertificateRow>(&sql)
            .bind(certificate_id)
            .fetch_optional(&self.db)
            .await?
            .map(Certificate::try_from)
            .transpose()
    }

    async fn insert_certificate(&self, c: &Certificate) -> StoreResult<()> {
        query(
            r#"
            INSERT INTO certificates
                (id, user_id, course_id, status, recipient_name, course_title, instructor_name, issued_at, total_hours, certificate_url)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
            "#,
        )
        .bind(c.id)
        .bind(c.user_id)
        .bind(c.course_id)
        .bind(c.status.as_str())
        .bind(c.recipient_name.as_deref())
        .bind(c.course_title.as_deref())
        .bind(c.instructor_name.as_deref())
        .bind(c.issued_at)
        .bind(c.total_hours)
        .bind(c.certificate_url.as_deref())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn pending_certificates(&self, limit: i64) -> StoreResult<Vec<Certificate>> {
        let sql = format!(
            "SELECT {CERTIFICATE_COLUMNS} FROM certificates WHERE status = 'pending' \
             ORDER BY issued_at LIMIT $1"
        );
        query_as::<_, CertificateRow>(&sql)
            .bind(limit)
            .fetch_all(&self.db)
            .await?
            .into_iter()
            .map(Certificate::try_from)
            .collect()
    }

    async fn mark_certificate_generated(
        &self,
        certificate_id: Uuid,
        rendered: &RenderedCertificate,
    ) -> StoreResult<Option<Certificate>> {
        let sql = format!(
            "UPDATE certificates SET status = 'generated', certificate_url = $2, \
             recipient_name = $3, course_title = $4, instructor_name = $5 \
             WHERE id = $1 AND status = 'pending' \
             RETURNING {CERTIFICATE_COLUMNS}"
        );
        query_as::<_, CertificateRow>(&sql)
            .bind(certificate_id)
            .bind(&rendered.certificate_url)
            .bind(&rendered.recipient_name)
            .bind(&rendered.course_title)
            .bind(rendered.instructor_name.as_deref())
            .fetch_optional(&self.db)
            .await?
            .map(Certificate::try_from)
            .transpose()
    }
}

// Runs against a live database; each test returns early when DATABASE_URL is unset.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::constraints;

    async fn store() -> Option<PgStore> {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            eprintln!("DATABASE_URL not set, skipping");
            return None;
        };
        let db = sqlx::PgPool::connect(&url).await.unwrap();
        crate::db::migrate(&db).await.unwrap();
        Some(PgStore::new(db))
    }

    struct Catalog {
        course_id: Uuid,
        module_id: Uuid,
        quiz: Quiz,
    }

    // Fresh ids per test so runs can share one database.
    async fn seed(store: &PgStore) -> Catalog {
        let catalog = Catalog {
            course_id: Uuid::new_v4(),
            module_id: Uuid::new_v4(),
            quiz: Quiz {
                id: Uuid::new_v4(),
                title: "Ownership".into(),
                pass_threshold: 0.5,
                max_attempts: 0,
                time_limit_minutes: 0,
            },
        };
        query("INSERT INTO courses (id, title) VALUES ($1, 'Rust')")
            .bind(catalog.course_id)
            .execute(&store.db)
            .await
            .unwrap();
        query("INSERT INTO quizzes (id, title, pass_threshold) VALUES ($1, $2, $3)")
            .bind(catalog.quiz.id)
            .bind(&catalog.quiz.title)
            .bind(catalog.quiz.pass_threshold)
            .execute(&store.db)
            .await
            .unwrap();
        query("INSERT INTO course_modules (id, course_id, title, quiz_id) VALUES ($1, $2, 'M1', $3)")
            .bind(catalog.module_id)
            .bind(catalog.course_id)
            .bind(catalog.quiz.id)
            .execute(&store.db)
            .await
            .unwrap();
        catalog
    }

    fn enrollment(user_id: Uuid, course_id: Uuid, txn: &str) -> Enrollment {
        Enrollment {
            id: Uuid::new_v4(),
            user_id,
            course_id,
            external_txn_ref: Some(format!("{txn}-{}", Uuid::new_v4())),
            status: EnrollmentStatus::Pending,
            amount_paid: 4900,
            enrolled_at: Utc::now(),
        }
    }

    fn constraint_of(err: StoreError) -> String {
        match err {
            StoreError::UniqueViolation { constraint } => constraint,
            other => panic!("expected a unique violation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_enrollment_names_user_course_constraint() {
        let Some(store) = store().await else { return };
        let catalog = seed(&store).await;
        let user = Uuid::new_v4();
        store
            .insert_enrollment(&enrollment(user, catalog.course_id, "tx"))
            .await
            .unwrap();

        let err = store
            .insert_enrollment(&enrollment(user, catalog.course_id, "tx"))
            .await
            .unwrap_err();
        assert_eq!(constraint_of(err), constraints::ENROLLMENT_USER_COURSE);
    }

    #[tokio::test]
    async fn reused_reference_names_txn_ref_index() {
        let Some(store) = store().await else { return };
        let catalog = seed(&store).await;
        let first = enrollment(Uuid::new_v4(), catalog.course_id, "tx");
        store.insert_enrollment(&first).await.unwrap();

        let mut second = enrollment(Uuid::new_v4(), catalog.course_id, "tx");
        second.external_txn_ref = first.external_txn_ref.clone();
        let err = store.insert_enrollment(&second).await.unwrap_err();
        assert_eq!(constraint_of(err), constraints::ENROLLMENT_TXN_REF);
    }

    #[tokio::test]
    async fn reconcile_leaves_success_rows_alone() {
        let Some(store) = store().await else { return };
        let catalog = seed(&store).await;
        let mut row = enrollment(Uuid::new_v4(), catalog.course_id, "tx");
        row.status = EnrollmentStatus::Success;
        store.insert_enrollment(&row).await.unwrap();

        let updated = store
            .reconcile_enrollment(row.id, EnrollmentStatus::Failed, None, Utc::now())
            .await
            .unwrap();
        assert!(updated.is_none());
        let stored = store.enrollment(row.user_id, catalog.course_id).await.unwrap().unwrap();
        assert_eq!(stored.status, EnrollmentStatus::Success);
        assert_eq!(stored.external_txn_ref, row.external_txn_ref);
    }

    #[tokio::test]
    async fn second_open_attempt_names_in_progress_index() {
        let Some(store) = store().await else { return };
        let catalog = seed(&store).await;
        let user = Uuid::new_v4();
        store
            .insert_attempt(&QuizAttempt::start(Uuid::new_v4(), user, &catalog.quiz, Utc::now()))
            .await
            .unwrap();

        let err = store
            .insert_attempt(&QuizAttempt::start(Uuid::new_v4(), user, &catalog.quiz, Utc::now()))
            .await
            .unwrap_err();
        assert_eq!(constraint_of(err), constraints::ATTEMPT_IN_PROGRESS);
    }

    #[tokio::test]
    async fn finish_attempt_closes_once_with_its_progress() {
        let Some(store) = store().await else { return };
        let catalog = seed(&store).await;
        let user = Uuid::new_v4();
        let open = QuizAttempt::start(Uuid::new_v4(), user, &catalog.quiz, Utc::now());
        store.insert_attempt(&open).await.unwrap();

        let done = open.complete(1.0, Utc::now()).unwrap();
        let progress = ModuleProgress {
            id: Uuid::new_v4(),
            user_id: user,
            module_id: catalog.module_id,
            completed_at: Utc::now(),
        };
        let first = store.finish_attempt(&done, Some(&progress)).await.unwrap();
        assert_eq!(
            first,
            AttemptClose::Closed {
                module: Some(Completion::NewlyCompleted)
            }
        );

        let second = store.finish_attempt(&done, Some(&progress)).await.unwrap();
        assert_eq!(second, AttemptClose::AlreadyClosed);

        let stored = store.attempt(open.id).await.unwrap().unwrap();
        assert_eq!(stored.score(), Some(1.0));
        let modules = store.completed_modules(user, catalog.course_id).await.unwrap();
        assert_eq!(modules, vec![catalog.module_id]);

        // a later passing attempt finds the module already done
        let retake = QuizAttempt::start(Uuid::new_v4(), user, &catalog.quiz, Utc::now());
        store.insert_attempt(&retake).await.unwrap();
        let again = ModuleProgress {
            id: Uuid::new_v4(),
            ..progress
        };
        let closed = store
            .finish_attempt(&retake.complete(0.5, Utc::now()).unwrap(), Some(&again))
            .await
            .unwrap();
        assert_eq!(
            closed,
            AttemptClose::Closed {
                module: Some(Completion::AlreadyCompleted)
            }
        );
    }
}
