use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, str::FromStr};
use uuid::Uuid;

use crate::error::{CoreError, Result};

// --- catalog (owned by content authoring, read-only here) ---

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Course {
    pub id: Uuid,
    pub title: String,
    pub instructor_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Smallest learning unit. `sequence_order` is display order only; modules
/// are never locked by it.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CourseModule {
    pub id: Uuid,
    pub course_id: Uuid,
    pub title: String,
    pub sequence_order: i32,
    pub quiz_id: Option<Uuid>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Quiz {
    pub id: Uuid,
    pub title: String,
    pub pass_threshold: f64,
    /// 0 = unlimited
    pub max_attempts: i32,
    /// 0 = unlimited
    pub time_limit_minutes: i32,
}

impl Quiz {
    pub fn rules(&self) -> QuizRules {
        QuizRules {
            pass_threshold: self.pass_threshold,
            max_attempts: self.max_attempts,
            time_limit_minutes: self.time_limit_minutes,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Question {
    pub id: Uuid,
    pub quiz_id: Uuid,
    pub prompt: String,
    pub position: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct QuestionOption {
    pub id: Uuid,
    pub question_id: Uuid,
    pub label: String,
    pub position: i32,
    pub is_correct: bool,
}

/// A question with every option, correctness included. Never leaves the
/// crate boundary as-is; see [`PublicQuestion`].
#[derive(Debug, Clone)]
pub struct QuestionWithOptions {
    pub question: Question,
    pub options: Vec<QuestionOption>,
}

impl QuestionWithOptions {
    /// The option graded as correct: the lowest-positioned flagged option.
    pub fn correct_option(&self) -> Option<Uuid> {
        self.options
            .iter()
            .filter(|o| o.is_correct)
            .min_by_key(|o| o.position)
            .map(|o| o.id)
    }

    pub fn has_option(&self, option_id: Uuid) -> bool {
        self.options.iter().any(|o| o.id == option_id)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PublicOption {
    pub id: Uuid,
    pub label: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PublicQuestion {
    pub id: Uuid,
    pub prompt: String,
    pub options: Vec<PublicOption>,
}

impl From<&QuestionWithOptions> for PublicQuestion {
    fn from(q: &QuestionWithOptions) -> Self {
        let mut options: Vec<&QuestionOption> = q.options.iter().collect();
        options.sort_by_key(|o| o.position);
        PublicQuestion {
            id: q.question.id,
            prompt: q.question.prompt.clone(),
            options: options
                .into_iter()
                .map(|o| PublicOption {
                    id: o.id,
                    label: o.label.clone(),
                })
                .collect(),
        }
    }
}

// --- enrollment ---

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Pending,
    Success,
    Failed,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentStatus::Pending => "pending",
            EnrollmentStatus::Success => "success",
            EnrollmentStatus::Failed => "failed",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Enrollment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub course_id: Uuid,
    pub external_txn_ref: Option<String>,
    pub status: EnrollmentStatus,
    /// Minor currency units.
    pub amount_paid: i64,
    pub enrolled_at: DateTime<Utc>,
}

impl Enrollment {
    pub fn is_active(&self) -> bool {
        self.status == EnrollmentStatus::Success
    }
}

/// Inputs to `EnrollmentLedger::grant_or_reconcile`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GrantOptions {
    pub status: EnrollmentStatus,
    pub external_txn_ref: Option<String>,
    #[serde(default)]
    pub amount_paid: i64,
    pub enrolled_at: Option<DateTime<Utc>>,
}

impl GrantOptions {
    pub fn manual_grant() -> Self {
        GrantOptions {
            status: EnrollmentStatus::Success,
            external_txn_ref: None,
            amount_paid: 0,
            enrolled_at: Some(Utc::now()),
        }
    }

    pub fn checkout(external_txn_ref: impl Into<String>, amount_paid: i64) -> Self {
        GrantOptions {
            status: EnrollmentStatus::Pending,
            external_txn_ref: Some(external_txn_ref.into()),
            amount_paid,
            enrolled_at: None,
        }
    }
}

// --- progress ---

/// Presence of a row means the module is complete.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ModuleProgress {
    pub id: Uuid,
    pub user_id: Uuid,
    pub module_id: Uuid,
    pub completed_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Completion {
    NewlyCompleted,
    AlreadyCompleted,
}

impl Completion {
    pub fn is_new(&self) -> bool {
        matches!(self, Completion::NewlyCompleted)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ModuleCompletion {
    pub module_id: Uuid,
    pub course_id: Uuid,
    pub completion: Completion,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CompletionOverview {
    pub course_id: Uuid,
    pub total_modules: i64,
    pub completed_modules: Vec<Uuid>,
    pub ratio: f64,
}

// --- quiz attempts ---

/// Quiz rules copied onto an attempt when it starts.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct QuizRules {
    pub pass_threshold: f64,
    pub max_attempts: i32,
    pub time_limit_minutes: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptStatus {
    InProgress,
    Completed {
        score: f64,
        completed_at: DateTime<Utc>,
    },
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::InProgress => "in_progress",
            AttemptStatus::Completed { .. } => "completed",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct QuizAttempt {
    pub id: Uuid,
    pub user_id: Uuid,
    pub quiz_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub rules: QuizRules,
    #[serde(flatten)]
    pub status: AttemptStatus,
}

impl QuizAttempt {
    pub fn start(id: Uuid, user_id: Uuid, quiz: &Quiz, now: DateTime<Utc>) -> Self {
        QuizAttempt {
            id,
            user_id,
            quiz_id: quiz.id,
            started_at: now,
            rules: quiz.rules(),
            status: AttemptStatus::InProgress,
        }
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self.status, AttemptStatus::InProgress)
    }

    pub fn score(&self) -> Option<f64> {
        match self.status {
            AttemptStatus::Completed { score, .. } => Some(score),
            AttemptStatus::InProgress => None,
        }
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        match self.status {
            AttemptStatus::Completed { completed_at, .. } => Some(completed_at),
            AttemptStatus::InProgress => None,
        }
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        (self.rules.time_limit_minutes > 0)
            .then(|| self.started_at + Duration::minutes(i64::from(self.rules.time_limit_minutes)))
    }

    pub fn ensure_owned_by(&self, user_id: Uuid) -> Result<()> {
        if self.user_id != user_id {
            return Err(CoreError::AccessDenied(format!(
                "attempt {} belongs to another user",
                self.id
            )));
        }
        Ok(())
    }

    /// in_progress -> completed. Completed attempts are immutable.
    pub fn complete(&self, score: f64, at: DateTime<Utc>) -> Result<QuizAttempt> {
        if !self.is_in_progress() {
            return Err(CoreError::AlreadySubmitted(self.id));
        }
        Ok(QuizAttempt {
            status: AttemptStatus::Completed {
                score,
                completed_at: at,
            },
            ..self.clone()
        })
    }
}

/// The learner's current selection for one question of an attempt.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct QuizAnswer {
    pub attempt_id: Uuid,
    pub question_id: Uuid,
    pub selected_option_id: Uuid,
    pub answered_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AttemptSession {
    pub attempt_id: Uuid,
    pub resumed: bool,
    pub started_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub questions: Vec<PublicQuestion>,
    /// question id -> selected option id
    pub saved_answers: HashMap<Uuid, Uuid>,
    pub best_score: Option<f64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SubmitOutcome {
    pub attempt_id: Uuid,
    pub score: f64,
    pub correct_answers: usize,
    pub total_questions: usize,
    pub is_passed: bool,
    pub is_new_best: bool,
    pub module_completed: Option<Completion>,
}

// --- certificates ---

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CertificateStatus {
    Pending,
    Generated,
}

impl CertificateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CertificateStatus::Pending => "pending",
            CertificateStatus::Generated => "generated",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Certificate {
    pub id: Uuid,
    pub user_id: Uuid,
    pub course_id: Uuid,
    pub status: CertificateStatus,
    pub recipient_name: Option<String>,
    pub course_title: Option<String>,
    pub instructor_name: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub total_hours: Option<i32>,
    pub certificate_url: Option<String>,
}

impl Certificate {
    pub fn pending(id: Uuid, user_id: Uuid, course_id: Uuid, now: DateTime<Utc>) -> Self {
        Certificate {
            id,
            user_id,
            course_id,
            status: CertificateStatus::Pending,
            recipient_name: None,
            course_title: None,
            instructor_name: None,
            issued_at: now,
            total_hours: None,
            certificate_url: None,
        }
    }
}

/// Filled in by the renderer once artwork exists.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RenderedCertificate {
    pub certificate_url: String,
    pub recipient_name: String,
    pub course_title: String,
    pub instructor_name: Option<String>,
}

// --- string mapping for text status columns ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown status '{}'", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for EnrollmentStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EnrollmentStatus::Pending),
            "success" => Ok(EnrollmentStatus::Success),
            "failed" => Ok(EnrollmentStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

impl FromStr for CertificateStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CertificateStatus::Pending),
            "generated" => Ok(CertificateStatus::Generated),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

// --- HTTP request bodies ---

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CheckoutReq {
    pub course_id: Uuid,
    pub external_txn_ref: String,
    #[serde(default)]
    pub amount_paid: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConfirmPaymentReq {
    pub external_txn_ref: String,
    pub user_id: Uuid,
    pub course_id: Uuid,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FailPaymentReq {
    pub external_txn_ref: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AdminGrantReq {
    pub user_id: Uuid,
    pub course_id: Uuid,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SaveAnswerReq {
    pub question_id: Uuid,
    pub selected_option_id: Option<Uuid>,
}
