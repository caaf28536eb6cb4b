//! The platform's own webhook receiver.
//!
//! Tenants can point an endpoint at `/webhooks/test-receiver` (signed with the configured
//! `test_receiver_secret`) to check the whole delivery path end to end.

use axum::{Json, body::Bytes, extract::State, http::HeaderMap};
use serde::Serialize;

use crate::AppState;
use crate::errors::{Error, Result};
use crate::webhooks::signing::{self, SIGNATURE_HEADER};
use crate::webhooks::{Envelope, EventName};

#[derive(Debug, Serialize)]
pub struct ReceiverAck {
    pub received: bool,
    pub event: EventName,
}

/// Verify the signature over the raw body, then acknowledge the envelope.
pub async fn test_receiver(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<ReceiverAck>> {
    let secret = state
        .config
        .webhooks
        .test_receiver_secret
        .as_deref()
        .ok_or_else(|| Error::Internal {
            operation: "verify webhook: no test receiver secret configured".to_string(),
        })?;

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| Error::Unauthenticated {
            message: Some(format!("Missing {} header", SIGNATURE_HEADER)),
        })?;

    if !signing::verify(&body, signature, secret) {
        tracing::info!("Rejected webhook with invalid signature");
        return Err(Error::Unauthenticated {
            message: Some("Invalid webhook signature".to_string()),
        });
    }

    let envelope: Envelope = serde_json::from_slice(&body).map_err(|e| Error::BadRequest {
        message: format!("Body is not a webhook envelope: {e}"),
    })?;

    tracing::info!(
        event = %envelope.event(),
        session_id = ?envelope.session_id(),
        "Test receiver accepted webhook"
    );

    Ok(Json(ReceiverAck {
        received: true,
        event: envelope.event(),
    }))
}
