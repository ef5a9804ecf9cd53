// One pending certificate per (user, course) once every module is complete.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{CoreError, Result, StoreError};
use crate::ids::IdGenerator;
use crate::models::{Certificate, CertificateStatus, RenderedCertificate};
use crate::progress::ProgressTracker;
use crate::store::LearningStore;

pub struct CertificateEligibilityMonitor {
    store: Arc<dyn LearningStore>,
    ids: Arc<dyn IdGenerator>,
    progress: Arc<ProgressTracker>,
}

impl CertificateEligibilityMonitor {
    pub fn new(
        store: Arc<dyn LearningStore>,
        ids: Arc<dyn IdGenerator>,
        progress: Arc<ProgressTracker>,
    ) -> Self {
        Self {
            store,
            ids,
            progress,
        }
    }

    /// Call after any module completion, new or repeated. Returns the
    /// certificate only when this call created it.
    pub async fn on_module_completed(&self, user_id: Uuid, course_id: Uuid) -> Result<Option<Certificate>> {
        let (completed, total) = self.progress.counts(user_id, course_id).await?;
        if total == 0 || completed < total {
            debug!(%user_id, %course_id, completed, total, "course not complete yet");
            return Ok(None);
        }

        if self.store.certificate(user_id, course_id).await?.is_some() {
            debug!(%user_id, %course_id, "certificate already exists");
            return Ok(None);
        }

        let certificate = Certificate::pending(self.ids.next_id(), user_id, course_id, Utc::now());
        match self.store.insert_certificate(&certificate).await {
            Ok(()) => {
                info!(%user_id, %course_id, certificate_id = %certificate.id, "certificate queued");
                Ok(Some(certificate))
            }
            Err(StoreError::UniqueViolation { .. }) => {
                debug!(%user_id, %course_id, "certificate insert raced, keeping existing row");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn certificate_for(&self, user_id: Uuid, course_id: Uuid) -> Result<Option<Certificate>> {
        Ok(self.store.certificate(user_id, course_id).await?)
    }

    /// Work queue for the renderer.
    pub async fn pending(&self, limit: i64) -> Result<Vec<Certificate>> {
        if limit <= 0 {
            return Err(CoreError::Validation("limit must be positive".into()));
        }
        Ok(self.store.pending_certificates(limit).await?)
    }

    /// pending -> generated, once.
    pub async fn mark_generated(
        &self,
        certificate_id: Uuid,
        rendered: RenderedCertificate,
    ) -> Result<Certificate> {
        if rendered.certificate_url.trim().is_empty() {
            return Err(CoreError::Validation("certificate_url is required".into()));
        }
        let current = self
            .store
            .certificate_by_id(certificate_id)
            .await?
            .ok_or_else(|| CoreError::not_found("certificate", certificate_id))?;
        if current.status == CertificateStatus::Generated {
            return Err(CoreError::AlreadyCompleted(format!("certificate {certificate_id}")));
        }

        match self
            .store
            .mark_certificate_generated(certificate_id, &rendered)
            .await?
        {
            Some(cert) => {
                info!(%certificate_id, user_id = %cert.user_id, course_id = %cert.course_id, "certificate generated");
                Ok(cert)
            }
            None => Err(CoreError::AlreadyCompleted(format!("certificate {certificate_id}"))),
        }
    }
}
