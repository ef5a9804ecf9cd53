// At most one in_progress attempt per (user, quiz); completed attempts are kept as history.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::certificate::CertificateEligibilityMonitor;
use crate::enrollment::EnrollmentLedger;
use crate::error::{CoreError, Result, StoreError};
use crate::grading;
use crate::ids::IdGenerator;
use crate::models::{
    AttemptSession, CourseModule, PublicQuestion, Quiz, QuizAnswer, QuizAttempt, SubmitOutcome,
};
use crate::progress::ProgressTracker;
use crate::store::{AttemptClose, LearningStore};

pub struct QuizSessionEngine {
    store: Arc<dyn LearningStore>,
    ids: Arc<dyn IdGenerator>,
    ledger: Arc<EnrollmentLedger>,
    progress: Arc<ProgressTracker>,
    certificates: Arc<CertificateEligibilityMonitor>,
}

impl QuizSessionEngine {
    pub fn new(
        store: Arc<dyn LearningStore>,
        ids: Arc<dyn IdGenerator>,
        ledger: Arc<EnrollmentLedger>,
        progress: Arc<ProgressTracker>,
        certificates: Arc<CertificateEligibilityMonitor>,
    ) -> Self {
        Self {
            store,
            ids,
            ledger,
            progress,
            certificates,
        }
    }

    async fn quiz_and_module(&self, quiz_id: Uuid) -> Result<(Quiz, CourseModule)> {
        let quiz = self
            .store
            .quiz(quiz_id)
            .await?
            .ok_or_else(|| CoreError::not_found("quiz", quiz_id))?;
        let module = self
            .store
            .module_for_quiz(quiz_id)
            .await?
            .ok_or_else(|| CoreError::not_found("module for quiz", quiz_id))?;
        Ok((quiz, module))
    }

    async fn owned_attempt(&self, attempt_id: Uuid, user_id: Uuid) -> Result<QuizAttempt> {
        let attempt = self
            .store
            .attempt(attempt_id)
            .await?
            .ok_or_else(|| CoreError::not_found("attempt", attempt_id))?;
        attempt.ensure_owned_by(user_id)?;
        Ok(attempt)
    }

    pub async fn start_or_resume(&self, user_id: Uuid, quiz_id: Uuid) -> Result<AttemptSession> {
        let (quiz, module) = self.quiz_and_module(quiz_id).await?;
        self.ledger.require_active(user_id, module.course_id).await?;

        let history = self.store.completed_attempts(user_id, quiz_id).await?;
        let (attempt, resumed) = match self.store.in_progress_attempt(user_id, quiz_id).await? {
            Some(existing) => (existing, true),
            None => self.open_attempt(user_id, &quiz, history.len()).await?,
        };

        let saved_answers: HashMap<Uuid, Uuid> = if resumed {
            self.store
                .answers(attempt.id)
                .await?
                .into_iter()
                .map(|a| (a.question_id, a.selected_option_id))
                .collect()
        } else {
            HashMap::new()
        };
        let questions = self.store.questions(quiz_id).await?;

        if resumed {
            debug!(%user_id, %quiz_id, attempt_id = %attempt.id, saved = saved_answers.len(), "attempt resumed");
        }
        Ok(AttemptSession {
            attempt_id: attempt.id,
            resumed,
            started_at: attempt.started_at,
            deadline: attempt.deadline(),
            questions: questions.iter().map(PublicQuestion::from).collect(),
            saved_answers,
            best_score: grading::best_score(&history),
        })
    }

    async fn open_attempt(&self, user_id: Uuid, quiz: &Quiz, used: usize) -> Result<(QuizAttempt, bool)> {
        if quiz.max_attempts > 0 && used >= quiz.max_attempts as usize {
            return Err(CoreError::AttemptLimitReached {
                quiz_id: quiz.id,
                limit: quiz.max_attempts,
            });
        }

        let attempt = QuizAttempt::start(self.ids.next_id(), user_id, quiz, Utc::now());
        match self.store.insert_attempt(&attempt).await {
            Ok(()) => {
                info!(%user_id, quiz_id = %quiz.id, attempt_id = %attempt.id, "attempt started");
                Ok((attempt, false))
            }
            Err(StoreError::UniqueViolation { constraint }) => {
                // Another request opened one first; resume that instead.
                let existing = self
                    .store
                    .in_progress_attempt(user_id, quiz.id)
                    .await?
                    .ok_or(StoreError::UniqueViolation { constraint })?;
                Ok((existing, true))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Stores the learner's current choice for a question, replacing any
    /// earlier one.
    pub async fn save_answer(
        &self,
        attempt_id: Uuid,
        user_id: Uuid,
        question_id: Uuid,
        selected_option_id: Option<Uuid>,
    ) -> Result<QuizAnswer> {
        let attempt = self.owned_attempt(attempt_id, user_id).await?;
        if !attempt.is_in_progress() {
            return Err(CoreError::InvalidState(format!(
                "attempt {attempt_id} is already completed"
            )));
        }
        let now = Utc::now();
        if attempt.deadline().is_some_and(|deadline| now > deadline) {
            return Err(CoreError::InvalidState(format!(
                "time limit for attempt {attempt_id} has elapsed"
            )));
        }
        let selected_option_id = selected_option_id
            .ok_or_else(|| CoreError::Validation("selected_option_id is required".into()))?;

        let questions = self.store.questions(attempt.quiz_id).await?;
        let question = questions
            .iter()
            .find(|q| q.question.id == question_id)
            .ok_or_else(|| CoreError::not_found("question", question_id))?;
        if !question.has_option(selected_option_id) {
            return Err(CoreError::Validation(format!(
                "option {selected_option_id} does not belong to question {question_id}"
            )));
        }

        let answer = QuizAnswer {
            attempt_id,
            question_id,
            selected_option_id,
            answered_at: now,
        };
        self.store.upsert_answer(&answer).await?;
        debug!(%attempt_id, %question_id, "answer saved");
        Ok(answer)
    }

    /// Grades and closes the attempt. On a pass the linked module is
    /// completed in the same store write. A second submit of the same
    /// attempt fails with `AlreadySubmitted`.
    pub async fn submit(&self, attempt_id: Uuid, user_id: Uuid) -> Result<SubmitOutcome> {
        let attempt = self.owned_attempt(attempt_id, user_id).await?;
        if !attempt.is_in_progress() {
            self.settle_pass(&attempt).await?;
            return Err(CoreError::AlreadySubmitted(attempt_id));
        }

        let questions = self.store.questions(attempt.quiz_id).await?;
        let answers = self.store.answers(attempt_id).await?;
        let grade = grading::grade(&questions, &answers);
        let previous = self.store.completed_attempts(user_id, attempt.quiz_id).await?;
        let is_passed = grading::is_passed(grade.score, attempt.rules.pass_threshold);

        let module = if is_passed {
            self.store.module_for_quiz(attempt.quiz_id).await?
        } else {
            None
        };
        let progress = match &module {
            Some(m) => {
                self.ledger.require_active(user_id, m.course_id).await?;
                Some(self.progress.new_row(user_id, m.id))
            }
            None => None,
        };

        let completed = attempt.complete(grade.score, Utc::now())?;
        let module_completed = match self.store.finish_attempt(&completed, progress.as_ref()).await? {
            AttemptClose::AlreadyClosed => return Err(CoreError::AlreadySubmitted(attempt_id)),
            AttemptClose::Closed { module } => module,
        };

        let is_new_best = grading::is_new_best(grade.score, &previous);
        info!(
            %user_id, quiz_id = %attempt.quiz_id, %attempt_id,
            score = grade.score, is_passed, is_new_best, "attempt submitted"
        );

        if let (Some(m), Some(_)) = (&module, module_completed) {
            self.certificates.on_module_completed(user_id, m.course_id).await?;
        }

        Ok(SubmitOutcome {
            attempt_id,
            score: grade.score,
            correct_answers: grade.correct,
            total_questions: grade.total,
            is_passed,
            is_new_best,
            module_completed,
        })
    }

    /// Re-applies what a passing attempt earns. Covers a submit whose
    /// certificate step failed after the attempt was closed; every write
    /// here is idempotent.
    async fn settle_pass(&self, attempt: &QuizAttempt) -> Result<()> {
        let passed = attempt
            .score()
            .is_some_and(|score| grading::is_passed(score, attempt.rules.pass_threshold));
        if !passed {
            return Ok(());
        }
        let Some(module) = self.store.module_for_quiz(attempt.quiz_id).await? else {
            return Ok(());
        };
        let done = self.progress.mark_module_complete(attempt.user_id, module.id).await?;
        self.certificates
            .on_module_completed(attempt.user_id, done.course_id)
            .await?;
        Ok(())
    }

    /// Completed attempts, oldest first.
    pub async fn history(&self, user_id: Uuid, quiz_id: Uuid) -> Result<Vec<QuizAttempt>> {
        let (_, module) = self.quiz_and_module(quiz_id).await?;
        self.ledger.require_active(user_id, module.course_id).await?;
        Ok(self.store.completed_attempts(user_id, quiz_id).await?)
    }
}
