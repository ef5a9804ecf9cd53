// Catalog fixtures for MemoryStore-backed tests and local demos.

use chrono::Utc;
use uuid::Uuid;

use crate::models::{Course, CourseModule, Question, QuestionOption, QuestionWithOptions, Quiz};
use crate::store::MemoryStore;

/// Index of the correct option in every seeded question.
pub const CORRECT_OPTION: usize = 1;
pub const OPTIONS_PER_QUESTION: usize = 3;

#[derive(Debug, Clone)]
pub struct SeededCourse {
    pub course: Course,
    pub modules: Vec<CourseModule>,
}

#[derive(Debug, Clone)]
pub struct SeededQuiz {
    pub quiz: Quiz,
    pub questions: Vec<QuestionWithOptions>,
}

impl SeededQuiz {
    pub fn correct(&self, q: &QuestionWithOptions) -> Uuid {
        q.options[CORRECT_OPTION].id
    }

    pub fn wrong(&self, q: &QuestionWithOptions) -> Uuid {
        q.options[0].id
    }
}

pub async fn seed_course(store: &MemoryStore, module_count: usize) -> SeededCourse {
    let course = Course {
        id: Uuid::new_v4(),
        title: "Rust for Backend Engineers".into(),
        instructor_name: Some("F. Ferris".into()),
        created_at: Utc::now(),
    };
    store.add_course(course.clone()).await;

    let mut modules = Vec::with_capacity(module_count);
    for i in 0..module_count {
        let module = CourseModule {
            id: Uuid::new_v4(),
            course_id: course.id,
            title: format!("Module {}", i + 1),
            sequence_order: i as i32,
            quiz_id: None,
        };
        store.add_module(module.clone()).await;
        modules.push(module);
    }
    SeededCourse { course, modules }
}

/// Creates a quiz with `question_count` three-option questions and links it
/// to `module`.
pub async fn attach_quiz(
    store: &MemoryStore,
    module: &CourseModule,
    question_count: usize,
    pass_threshold: f64,
) -> SeededQuiz {
    let quiz = Quiz {
        id: Uuid::new_v4(),
        title: format!("{} checkpoint", module.title),
        pass_threshold,
        max_attempts: 0,
        time_limit_minutes: 0,
    };
    store.add_quiz(quiz.clone()).await;
    store
        .add_module(CourseModule {
            quiz_id: Some(quiz.id),
            ..module.clone()
        })
        .await;

    let mut questions = Vec::with_capacity(question_count);
    for i in 0..question_count {
        let question = Question {
            id: Uuid::new_v4(),
            quiz_id: quiz.id,
            prompt: format!("Question {}", i + 1),
            position: i as i32,
        };
        let options: Vec<QuestionOption> = (0..OPTIONS_PER_QUESTION)
            .map(|n| QuestionOption {
                id: Uuid::new_v4(),
                question_id: question.id,
                label: format!("Answer {}", n + 1),
                position: n as i32,
                is_correct: n == CORRECT_OPTION,
            })
            .collect();
        store.add_question(question.clone(), options.clone()).await;
        questions.push(QuestionWithOptions { question, options });
    }
    SeededQuiz { quiz, questions }
}
