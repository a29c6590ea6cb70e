//! HTTP handlers for recharge orders.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};

use crate::{
    AppState,
    api::models::recharge_orders::{RechargeOrderCreate, RechargeOrderResponse},
    errors::Result,
    storage::Storage,
    types::OrderId,
};

/// Open a pending order the user can pay through the gateway
#[tracing::instrument(skip_all, fields(user_id = %data.user_id))]
pub async fn create_order<S: Storage>(
    State(state): State<AppState<S>>,
    Json(data): Json<RechargeOrderCreate>,
) -> Result<(StatusCode, Json<RechargeOrderResponse>)> {
    let order = state
        .recharge
        .create_order(data.user_id, data.package_id, data.amount)
        .await?;
    Ok((StatusCode::CREATED, Json(order.into())))
}

#[tracing::instrument(skip_all, fields(order_id = %order_id))]
pub async fn get_order<S: Storage>(
    State(state): State<AppState<S>>,
    Path(order_id): Path<OrderId>,
) -> Result<Json<RechargeOrderResponse>> {
    let order = state.recharge.get_order(&order_id).await?;
    Ok(Json(order.into()))
}
