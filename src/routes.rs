use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    error::{CoreError, Result},
    models::*,
    runtime::Runtime,
};

/// Caller identity, set by the upstream auth layer.
pub const USER_HEADER: &str = "x-user-id";
const DEFAULT_PENDING_LIMIT: i64 = 50;

pub fn router(rt: Runtime) -> Router {
    Router::new()
        // checkout + admin
        .route("/api/checkout", post(start_checkout))
        .route("/api/checkout/confirm", post(confirm_payment))
        .route("/api/checkout/fail", post(fail_payment))
        .route("/api/admin/enrollments", post(admin_grant))
        // learner
        .route("/api/courses/:course_id/enrollment", get(enrollment_status))
        .route("/api/courses/:course_id/progress", get(course_progress))
        .route("/api/courses/:course_id/certificate", get(course_certificate))
        .route("/api/modules/:module_id/complete", post(complete_module))
        .route("/api/quizzes/:quiz_id/attempts", post(start_attempt).get(attempt_history))
        .route("/api/attempts/:attempt_id/answers", put(save_answer))
        .route("/api/attempts/:attempt_id/submit", post(submit_attempt))
        // certificate renderer
        .route("/api/certificates/pending", get(pending_certificates))
        .route("/api/certificates/:certificate_id/generated", post(certificate_generated))
        .with_state(rt)
}

fn learner(headers: &HeaderMap) -> Result<Uuid> {
    let raw = headers
        .get(USER_HEADER)
        .ok_or_else(|| CoreError::AccessDenied(format!("missing {USER_HEADER} header")))?;
    raw.to_str()
        .ok()
        .and_then(|s| Uuid::parse_str(s.trim()).ok())
        .ok_or_else(|| CoreError::Validation(format!("{USER_HEADER} must be a UUID")))
}

// --- enrollment ---

async fn start_checkout(
    State(rt): State<Runtime>,
    headers: HeaderMap,
    Json(req): Json<CheckoutReq>,
) -> Result<Json<Enrollment>> {
    let user_id = learner(&headers)?;
    if req.external_txn_ref.trim().is_empty() {
        return Err(CoreError::Validation("external_txn_ref is required".into()));
    }
    let enrollment = rt
        .ledger
        .grant_or_reconcile(
            user_id,
            req.course_id,
            GrantOptions::checkout(req.external_txn_ref, req.amount_paid),
        )
        .await?;
    Ok(Json(enrollment))
}

async fn confirm_payment(
    State(rt): State<Runtime>,
    Json(req): Json<ConfirmPaymentReq>,
) -> Result<Json<Enrollment>> {
    let enrollment = rt
        .ledger
        .activate_by_external_ref(&req.external_txn_ref, req.user_id, req.course_id)
        .await?;
    Ok(Json(enrollment))
}

async fn fail_payment(
    State(rt): State<Runtime>,
    Json(req): Json<FailPaymentReq>,
) -> Result<Json<Enrollment>> {
    Ok(Json(rt.ledger.fail_by_external_ref(&req.external_txn_ref).await?))
}

async fn admin_grant(
    State(rt): State<Runtime>,
    Json(req): Json<AdminGrantReq>,
) -> Result<Json<Enrollment>> {
    let enrollment = rt
        .ledger
        .grant_or_reconcile(req.user_id, req.course_id, GrantOptions::manual_grant())
        .await?;
    Ok(Json(enrollment))
}

async fn enrollment_status(
    State(rt): State<Runtime>,
    headers: HeaderMap,
    Path(course_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>> {
    let user_id = learner(&headers)?;
    let enrollment = rt.ledger.get(user_id, course_id).await?;
    Ok(Json(serde_json::json!({
        "course_id": course_id,
        "active": enrollment.as_ref().is_some_and(Enrollment::is_active),
        "enrollment": enrollment,
    })))
}

// --- progress ---

async fn course_progress(
    State(rt): State<Runtime>,
    headers: HeaderMap,
    Path(course_id): Path<Uuid>,
) -> Result<Json<CompletionOverview>> {
    let user_id = learner(&headers)?;
    Ok(Json(rt.progress.overview(user_id, course_id).await?))
}

async fn course_certificate(
    State(rt): State<Runtime>,
    headers: HeaderMap,
    Path(course_id): Path<Uuid>,
) -> Result<Json<Certificate>> {
    let user_id = learner(&headers)?;
    rt.certificates
        .certificate_for(user_id, course_id)
        .await?
        .map(Json)
        .ok_or_else(|| CoreError::not_found("certificate", format!("{user_id}/{course_id}")))
}

async fn complete_module(
    State(rt): State<Runtime>,
    headers: HeaderMap,
    Path(module_id): Path<Uuid>,
) -> Result<Json<ModuleCompletion>> {
    let user_id = learner(&headers)?;
    Ok(Json(rt.complete_module(user_id, module_id).await?))
}

// --- quiz sessions ---

async fn start_attempt(
    State(rt): State<Runtime>,
    headers: HeaderMap,
    Path(quiz_id): Path<Uuid>,
) -> Result<Json<AttemptSession>> {
    let user_id = learner(&headers)?;
    Ok(Json(rt.quizzes.start_or_resume(user_id, quiz_id).await?))
}

async fn attempt_history(
    State(rt): State<Runtime>,
    headers: HeaderMap,
    Path(quiz_id): Path<Uuid>,
) -> Result<Json<Vec<QuizAttempt>>> {
    let user_id = learner(&headers)?;
    Ok(Json(rt.quizzes.history(user_id, quiz_id).await?))
}

async fn save_answer(
    State(rt): State<Runtime>,
    headers: HeaderMap,
    Path(attempt_id): Path<Uuid>,
    Json(req): Json<SaveAnswerReq>,
) -> Result<Json<QuizAnswer>> {
    let user_id = learner(&headers)?;
    let answer = rt
        .quizzes
        .save_answer(attempt_id, user_id, req.question_id, req.selected_option_id)
        .await?;
    Ok(Json(answer))
}

async fn submit_attempt(
    State(rt): State<Runtime>,
    headers: HeaderMap,
    Path(attempt_id): Path<Uuid>,
) -> Result<Json<SubmitOutcome>> {
    let user_id = learner(&headers)?;
    Ok(Json(rt.quizzes.submit(attempt_id, user_id).await?))
}

// --- certificate renderer hand-off ---

#[derive(Deserialize)]
struct PendingQuery {
    limit: Option<i64>,
}

async fn pending_certificates(
    State(rt): State<Runtime>,
    Query(q): Query<PendingQuery>,
) -> Result<Json<Vec<Certificate>>> {
    let limit = q.limit.unwrap_or(DEFAULT_PENDING_LIMIT);
    Ok(Json(rt.certificates.pending(limit).await?))
}

async fn certificate_generated(
    State(rt): State<Runtime>,
    Path(certificate_id): Path<Uuid>,
    Json(rendered): Json<RenderedCertificate>,
) -> Result<Json<Certificate>> {
    Ok(Json(rt.certificates.mark_generated(certificate_id, rendered).await?))
}
