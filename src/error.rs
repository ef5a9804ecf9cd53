use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use uuid::Uuid;

/// Failures raised by a [`crate::store::LearningStore`] backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("unique constraint violated: {constraint}")]
    UniqueViolation { constraint: String },

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            // 23505 = unique_violation
            if db_err.code().as_deref() == Some("23505") {
                return StoreError::UniqueViolation {
                    constraint: db_err.constraint().unwrap_or("unknown").to_string(),
                };
            }
        }
        StoreError::Database(err)
    }
}

impl StoreError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation { .. })
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("user {user_id} is already enrolled in course {course_id}")]
    AlreadyEnrolled { user_id: Uuid, course_id: Uuid },

    #[error("attempt {0} was already submitted")]
    AlreadySubmitted(Uuid),

    #[error("{0} is already completed")]
    AlreadyCompleted(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("no attempts left for quiz {quiz_id} (limit {limit})")]
    AttemptLimitReached { quiz_id: Uuid, limit: i32 },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    External(#[from] StoreError),
}

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        CoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::AccessDenied(_) => "access_denied",
            CoreError::AlreadyEnrolled { .. } => "already_enrolled",
            CoreError::AlreadySubmitted(_) => "already_submitted",
            CoreError::AlreadyCompleted(_) => "already_completed",
            CoreError::InvalidState(_) => "invalid_state",
            CoreError::AttemptLimitReached { .. } => "attempt_limit_reached",
            CoreError::NotFound { .. } => "not_found",
            CoreError::Validation(_) => "validation_error",
            CoreError::External(_) => "external_service_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            CoreError::AccessDenied(_) => StatusCode::FORBIDDEN,
            CoreError::AlreadyEnrolled { .. }
            | CoreError::AlreadySubmitted(_)
            | CoreError::AlreadyCompleted(_)
            | CoreError::InvalidState(_)
            | CoreError::AttemptLimitReached { .. } => StatusCode::CONFLICT,
            CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            CoreError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::External(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = self.status();
        if let CoreError::External(e) = &self {
            tracing::error!(error = %e, "storage failure");
        }
        let body = Json(serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}
