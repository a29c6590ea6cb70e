use axum::{
    extract::{Path, State},
    response::Json,
};

use crate::{
    AppState,
    api::models::freeze_records::FreezeRecordResponse,
    errors::{Error, Result},
    storage::Storage,
    types::RequestId,
};

/// Look up the ledger record for one billable attempt
#[tracing::instrument(skip_all, fields(request_id = %request_id))]
pub async fn get_freeze_record<S: Storage>(
    State(state): State<AppState<S>>,
    Path(request_id): Path<RequestId>,
) -> Result<Json<FreezeRecordResponse>> {
    let record = state
        .billing
        .ledger()
        .get(&request_id)
        .await?
        .ok_or_else(|| Error::NotFound {
            resource: "Freeze record".to_string(),
            id: request_id.to_string(),
        })?;

    Ok(Json(record.into()))
}

#[cfg(test)]
mod tests {
    use crate::api::models::freeze_records::FreezeRecordResponse;
    use crate::billing::{ChargeRequest, TokenUsage};
    use crate::db::models::freeze_records::FreezeStatus;
    use crate::test_utils::{TEST_MODEL, create_test_server, fund_user};
    use axum::http::StatusCode;
    use rust_decimal::Decimal;

    #[test_log::test(tokio::test)]
    async fn test_settled_record_is_visible() {
        let (server, state) = create_test_server();
        let user_id = fund_user(&state, Decimal::new(5000, 0)).await;

        let request = ChargeRequest::builder()
            .request_id("req-api-1")
            .user_id(user_id)
            .model_id(TEST_MODEL)
            .assumed_max_tokens(100)
            .build();
        state
            .billing
            .charge(request, |marker| async move {
                marker.mark_dispatched();
                Ok(TokenUsage {
                    input_tokens: 10,
                    output_tokens: 20,
                })
            })
            .await
            .unwrap();

        let response = server.get("/admin/api/v1/freeze-records/req-api-1").await;
        response.assert_status_ok();
        let record: FreezeRecordResponse = response.json();
        assert_eq!(record.status, FreezeStatus::Settled);
        assert_eq!(record.user_id, user_id);
        assert_eq!(record.input_tokens, Some(10));
        assert_eq!(record.output_tokens, Some(20));
        assert!(record.finalized_at.is_some());
    }

    #[test_log::test(tokio::test)]
    async fn test_missing_record_is_not_found() {
        let (server, _state) = create_test_server();
        server
            .get("/admin/api/v1/freeze-records/nope")
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }
}
