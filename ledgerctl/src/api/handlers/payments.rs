//! Payment gateway callback endpoint.

use axum::{
    extract::State,
    http::HeaderMap,
    response::Json,
};
use chrono::Utc;

use crate::{
    AppState,
    api::models::payments::CallbackAck,
    errors::{Error, Result},
    recharge::{
        CallbackOutcome, PaymentCallback, RechargeError,
        signing::{NONCE_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER},
    },
    storage::Storage,
};

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Apply a gateway payment notification.
///
/// Credited and redelivered callbacks answer `SUCCESS`. Outcomes a redelivery cannot change
/// (expired, closed, mismatched amount, reused transaction) answer `REJECTED` with 200 so the
/// gateway stops retrying. Storage failures answer 500 and the gateway redelivers.
#[tracing::instrument(skip_all)]
pub async fn payment_callback<S: Storage>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<CallbackAck>> {
    if let Some(verifier) = &state.callback_verifier {
        verifier
            .verify(
                header(&headers, TIMESTAMP_HEADER),
                header(&headers, NONCE_HEADER),
                header(&headers, SIGNATURE_HEADER),
                &body,
                Utc::now(),
            )
            .map_err(|e| Error::Unauthenticated {
                message: Some(format!("Invalid callback signature: {e}")),
            })?;
    }

    let callback: PaymentCallback = serde_json::from_str(&body).map_err(|e| Error::BadRequest {
        message: format!("Invalid callback payload: {e}"),
    })?;

    match state.recharge.handle_payment_callback(&callback).await {
        Ok(CallbackOutcome::Credited { .. } | CallbackOutcome::AlreadyProcessed(_)) => Ok(Json(CallbackAck::success())),
        Err(
            e @ (RechargeError::OrderExpired(_)
            | RechargeError::AmountMismatch { .. }
            | RechargeError::OrderClosed { .. }
            | RechargeError::DuplicateTransaction(_)),
        ) => {
            tracing::warn!(order_id = %callback.order_id, error = %e, "Payment callback rejected");
            Ok(Json(CallbackAck::rejected(e.to_string())))
        }
        Err(e) => Err(e.into()),
    }
}
