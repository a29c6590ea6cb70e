//! HTTP handlers for balance accounts and operator adjustments.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use rust_decimal::Decimal;

use crate::{
    AppState,
    api::models::balances::{AdjustmentCreate, AdjustmentResponse, BalanceResponse},
    errors::{Error, Result},
    storage::Storage,
    types::UserId,
};

/// Current balance of one user
#[tracing::instrument(skip_all, fields(user_id = %user_id))]
pub async fn get_balance<S: Storage>(
    State(state): State<AppState<S>>,
    Path(user_id): Path<UserId>,
) -> Result<Json<BalanceResponse>> {
    let balance = state.balances.get(user_id).await?;
    Ok(Json(BalanceResponse::from(balance)))
}

/// Open a zero balance for a newly registered user. Idempotent: an existing account is returned
/// unchanged.
#[tracing::instrument(skip_all, fields(user_id = %user_id))]
pub async fn open_account<S: Storage>(
    State(state): State<AppState<S>>,
    Path(user_id): Path<UserId>,
) -> Result<Json<BalanceResponse>> {
    let balance = state.balances.ensure_account(user_id).await?;
    Ok(Json(BalanceResponse::from(balance)))
}

/// Grant or deduct credits and record the operator in the audit log
#[tracing::instrument(skip_all, fields(user_id = %user_id))]
pub async fn create_adjustment<S: Storage>(
    State(state): State<AppState<S>>,
    Path(user_id): Path<UserId>,
    Json(data): Json<AdjustmentCreate>,
) -> Result<(StatusCode, Json<AdjustmentResponse>)> {
    if data.amount <= Decimal::ZERO {
        return Err(Error::BadRequest {
            message: "Amount must be greater than zero".to_string(),
        });
    }

    let (entry, balance) = state
        .adjustments
        .adjust(data.admin_id, user_id, data.operation_type, data.amount, data.reason)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(AdjustmentResponse {
            entry: entry.into(),
            balance: balance.into(),
        }),
    ))
}

#[cfg(test)]
mod tests {
    use crate::api::models::balances::{AdjustmentResponse, BalanceResponse};
    use crate::test_utils::{create_test_server, fund_user};
    use axum::http::StatusCode;
    use rust_decimal::Decimal;
    use serde_json::json;
    use uuid::Uuid;

    #[test_log::test(tokio::test)]
    async fn test_open_account_is_idempotent() {
        let (server, _state) = create_test_server();
        let user_id = Uuid::new_v4();

        let response = server.post(&format!("/admin/api/v1/users/{user_id}/balance")).await;
        response.assert_status_ok();
        let balance: BalanceResponse = response.json();
        assert_eq!(balance.available, Decimal::ZERO);

        server
            .post(&format!("/admin/api/v1/users/{user_id}/balance"))
            .await
            .assert_status_ok();
        let balance: BalanceResponse = server.get(&format!("/admin/api/v1/users/{user_id}/balance")).await.json();
        assert_eq!(balance.user_id, user_id);
        assert_eq!(balance.total, Decimal::ZERO);
    }

    #[test_log::test(tokio::test)]
    async fn test_unknown_account_is_not_found() {
        let (server, _state) = create_test_server();
        server
            .get(&format!("/admin/api/v1/users/{}/balance", Uuid::new_v4()))
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }

    #[test_log::test(tokio::test)]
    async fn test_adjustments_move_balance_and_are_audited() {
        let (server, state) = create_test_server();
        let user_id = fund_user(&state, Decimal::new(50, 0)).await;
        let admin_id = Uuid::new_v4();

        let response = server
            .post(&format!("/admin/api/v1/users/{user_id}/balance/adjustments"))
            .json(&json!({
                "admin_id": admin_id,
                "operation_type": "deduct",
                "amount": "20",
                "reason": "chargeback"
            }))
            .await;
        response.assert_status(StatusCode::CREATED);
        let body: AdjustmentResponse = response.json();
        assert_eq!(body.balance.available, Decimal::new(30, 0));
        assert_eq!(body.entry.admin_id, admin_id);
        assert_eq!(body.entry.reason.as_deref(), Some("chargeback"));

        let entries = state.audit_log.entries(Some(user_id), 10).await.unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn test_adjustment_validation() {
        let (server, state) = create_test_server();
        let user_id = fund_user(&state, Decimal::new(10, 0)).await;
        let url = format!("/admin/api/v1/users/{user_id}/balance/adjustments");

        server
            .post(&url)
            .json(&json!({ "admin_id": Uuid::new_v4(), "operation_type": "grant", "amount": "0" }))
            .await
            .assert_status(StatusCode::BAD_REQUEST);

        server
            .post(&url)
            .json(&json!({ "admin_id": Uuid::new_v4(), "operation_type": "deduct", "amount": "11" }))
            .await
            .assert_status(StatusCode::BAD_REQUEST);

        let balance = state.balances.get(user_id).await.unwrap();
        assert_eq!(balance.available, Decimal::new(10, 0));
    }
}
