// Multiple-choice grading helpers

use std::collections::HashMap;
use uuid::Uuid;

use crate::models::{QuestionWithOptions, QuizAnswer, QuizAttempt};

/// Tolerance when comparing a score against a stored threshold.
const THRESHOLD_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Grade {
    pub correct: usize,
    pub total: usize,
    pub score: f64,
}

/// Scores answers against the quiz's full question list. Unanswered
/// questions count as wrong; answers to questions outside the quiz are
/// ignored.
pub fn grade(questions: &[QuestionWithOptions], answers: &[QuizAnswer]) -> Grade {
    let key: HashMap<Uuid, Option<Uuid>> = questions
        .iter()
        .map(|q| (q.question.id, q.correct_option()))
        .collect();

    let correct = answers
        .iter()
        .filter(|a| key.get(&a.question_id) == Some(&Some(a.selected_option_id)))
        .count();
    let total = questions.len();
    let score = if total == 0 {
        0.0
    } else {
        correct as f64 / total as f64
    };
    Grade {
        correct,
        total,
        score,
    }
}

pub fn is_passed(score: f64, pass_threshold: f64) -> bool {
    score + THRESHOLD_EPSILON >= pass_threshold
}

pub fn best_score(completed: &[QuizAttempt]) -> Option<f64> {
    completed
        .iter()
        .filter_map(QuizAttempt::score)
        .fold(None, |best, s| Some(best.map_or(s, |b: f64| b.max(s))))
}

/// An equal score never displaces the earlier best.
pub fn is_new_best(score: f64, previous: &[QuizAttempt]) -> bool {
    best_score(previous).map_or(true, |best| score > best)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AttemptStatus, Question, QuestionOption, QuizRules};
    use chrono::Utc;

    fn question(correct_at: Option<usize>) -> QuestionWithOptions {
        let qid = Uuid::new_v4();
        QuestionWithOptions {
            question: Question {
                id: qid,
                quiz_id: Uuid::nil(),
                prompt: "?".into(),
                position: 0,
            },
            options: (0..3)
                .map(|i| QuestionOption {
                    id: Uuid::new_v4(),
                    question_id: qid,
                    label: format!("option {i}"),
                    position: i as i32,
                    is_correct: Some(i) == correct_at,
                })
                .collect(),
        }
    }

    fn answer(q: &QuestionWithOptions, option_index: usize) -> QuizAnswer {
        QuizAnswer {
            attempt_id: Uuid::nil(),
            question_id: q.question.id,
            selected_option_id: q.options[option_index].id,
            answered_at: Utc::now(),
        }
    }

    fn completed(score: f64) -> QuizAttempt {
        QuizAttempt {
            id: Uuid::new_v4(),
            user_id: Uuid::nil(),
            quiz_id: Uuid::nil(),
            started_at: Utc::now(),
            rules: QuizRules {
                pass_threshold: 0.7,
                max_attempts: 0,
                time_limit_minutes: 0,
            },
            status: AttemptStatus::Completed {
                score,
                completed_at: Utc::now(),
            },
        }
    }

    #[test]
    fn unanswered_questions_count_against_the_score() {
        let qs: Vec<_> = (0..4).map(|_| question(Some(1))).collect();
        let answers: Vec<_> = qs.iter().take(3).map(|q| answer(q, 1)).collect();

        let g = grade(&qs, &answers);
        assert_eq!(g.correct, 3);
        assert_eq!(g.total, 4);
        assert_eq!(g.score, 0.75);
        assert!(is_passed(g.score, 0.75));
    }

    #[test]
    fn wrong_and_foreign_answers_do_not_score() {
        let qs: Vec<_> = (0..2).map(|_| question(Some(0))).collect();
        let stray = question(Some(0));
        let answers = vec![answer(&qs[0], 2), answer(&stray, 0)];
        assert_eq!(grade(&qs, &answers).correct, 0);
    }

    #[test]
    fn question_without_correct_option_is_always_wrong() {
        let qs = vec![question(None)];
        let answers = vec![answer(&qs[0], 0)];
        assert_eq!(grade(&qs, &answers).score, 0.0);
    }

    #[test]
    fn empty_quiz_scores_zero() {
        assert_eq!(grade(&[], &[]).score, 0.0);
    }

    #[test]
    fn ties_keep_the_earlier_best() {
        let history = vec![completed(0.5), completed(0.8)];
        assert_eq!(best_score(&history), Some(0.8));
        assert!(!is_new_best(0.8, &history));
        assert!(is_new_best(0.9, &history));
        assert!(is_new_best(0.1, &[]));
    }

    #[test]
    fn below_threshold_fails() {
        assert!(!is_passed(0.6, 0.7));
        assert!(is_passed(0.7, 0.7));
    }
}
