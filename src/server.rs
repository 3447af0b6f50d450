//! Admission webhook server
//!
//! Decodes AdmissionReviews, hands the pod to the [`Compensator`] and encodes
//! its verdict back into an AdmissionReview.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use kube::{
    api::DynamicObject,
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::compensator::{Compensator, PodAdmission, Verdict};
use crate::error::Error;

/// Shared state for webhook handlers
#[derive(Clone)]
pub struct WebhookState {
    pub compensator: Arc<Compensator>,
}

impl WebhookState {
    pub fn new(compensator: Compensator) -> Self {
        Self {
            compensator: Arc::new(compensator),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server
    pub addr: SocketAddr,
    /// TLS certificate PEM file
    pub cert_path: PathBuf,
    /// TLS private key PEM file
    pub key_path: PathBuf,
}

/// Query parameters the API server adds to webhook calls.
#[derive(Debug, Default, Deserialize)]
pub struct AdmissionParams {
    /// The caller's timeout as a Go duration, e.g. `10s`.
    pub timeout: Option<String>,
}

impl AdmissionParams {
    fn timeout(&self) -> Option<Duration> {
        let raw = self.timeout.as_deref()?;
        match humantime::parse_duration(raw) {
            Ok(timeout) => Some(timeout),
            Err(e) => {
                debug!(timeout = %raw, error = %e, "ignoring unparsable timeout");
                None
            }
        }
    }
}

/// Routes:
/// - POST /mutate-pod - capacity compensation for Deployment replicas
/// - GET /readyz, /healthz - liveness and readiness
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/mutate-pod", post(mutate_handler))
        .route("/readyz", get(|| async { "ok" }))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

/// Handle a mutating admission review for a pod
pub async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    Query(params): Query<AdmissionParams>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let response = review(&state, &req, params.timeout()).await;
    Json(response.into_review())
}

async fn review(
    state: &WebhookState,
    req: &AdmissionRequest<DynamicObject>,
    timeout: Option<Duration>,
) -> AdmissionResponse {
    let object = match req.object.as_ref().map(serde_json::to_value).transpose() {
        Ok(object) => object,
        Err(e) => return errored(req, 400, format!("decode error: {e}")),
    };
    let admission = PodAdmission {
        uid: req.uid.clone(),
        operation: req.operation.clone(),
        namespace: req.namespace.clone(),
        object,
        timeout,
    };

    // Run detached so a dropped connection cannot abandon a held lock, but
    // stop waiting for the lock once the caller is gone.
    let cancel = CancellationToken::new();
    let _abandon = cancel.clone().drop_guard();
    let compensator = state.compensator.clone();
    let task = tokio::spawn(async move { compensator.admit_cancellable(admission, cancel).await });
    let verdict = match task.await {
        Ok(verdict) => verdict,
        Err(e) => {
            error!(uid = %req.uid, error = %e, "compensation task failed");
            return errored(req, 500, format!("compensation task failed: {e}"));
        }
    };

    into_response(req, verdict)
}

fn errored(req: &AdmissionRequest<DynamicObject>, code: u16, message: String) -> AdmissionResponse {
    let mut response = AdmissionResponse::from(req).deny(message);
    response.result.code = code;
    response
}

fn into_response(req: &AdmissionRequest<DynamicObject>, verdict: Verdict) -> AdmissionResponse {
    match verdict {
        Verdict::Allowed(None) => AdmissionResponse::from(req),
        Verdict::Allowed(Some(patch)) => {
            info!(uid = %req.uid, patch_ops = patch.0.len(), "Applying patch to pod");
            match AdmissionResponse::from(req).with_patch(patch) {
                Ok(response) => response,
                Err(e) => {
                    error!(uid = %req.uid, error = %e, "Failed to serialize patch");
                    errored(req, 500, format!("patch serialization error: {e}"))
                }
            }
        }
        Verdict::Errored { code, message } => errored(req, code, message),
    }
}

/// Serve the webhook over TLS until interrupted.
pub async fn serve(config: ServerConfig, state: Arc<WebhookState>) -> Result<(), Error> {
    let tls_config = RustlsConfig::from_pem_file(&config.cert_path, &config.key_path)
        .await
        .map_err(|e| Error::config(format!("TLS config error: {e}")))?;

    let handle = axum_server::Handle::new();
    let shutdown = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, draining webhook server");
            shutdown.graceful_shutdown(Some(Duration::from_secs(10)));
        }
    });

    info!(addr = %config.addr, "Starting webhook server");

    axum_server::bind_rustls(config.addr, tls_config)
        .handle(handle)
        .serve(webhook_router(state).into_make_service())
        .await
        .map_err(|e| Error::internal(format!("server error: {e}")))?;

    Ok(())
}
