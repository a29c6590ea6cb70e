use axum::{
    extract::{Query, State},
    response::Json,
};

use crate::{
    AppState,
    api::models::audit_log::{AuditLogQuery, AuditLogResponse, DEFAULT_AUDIT_PAGE},
    audit::MAX_AUDIT_PAGE,
    errors::Result,
    storage::Storage,
};

/// Manual adjustments, newest first
#[tracing::instrument(skip_all)]
pub async fn list_audit_log<S: Storage>(
    State(state): State<AppState<S>>,
    Query(query): Query<AuditLogQuery>,
) -> Result<Json<AuditLogResponse>> {
    let limit = query.limit.unwrap_or(DEFAULT_AUDIT_PAGE).clamp(1, MAX_AUDIT_PAGE);
    let entries = state.audit_log.entries(query.user_id, limit).await?;

    Ok(Json(AuditLogResponse {
        data: entries.into_iter().map(Into::into).collect(),
        limit,
    }))
}

#[cfg(test)]
mod tests {
    use crate::api::models::audit_log::AuditLogResponse;
    use crate::db::models::audit_log::AdjustmentKind;
    use crate::test_utils::{create_test_server, fund_user};
    use rust_decimal::Decimal;
    use uuid::Uuid;

    #[test_log::test(tokio::test)]
    async fn test_audit_feed_filters_and_limits() {
        let (server, state) = create_test_server();
        let alice = fund_user(&state, Decimal::new(10, 0)).await;
        let bob = fund_user(&state, Decimal::new(20, 0)).await;
        state
            .adjustments
            .adjust(Uuid::new_v4(), alice, AdjustmentKind::Deduct, Decimal::new(5, 0), None)
            .await
            .unwrap();

        let all: AuditLogResponse = server.get("/admin/api/v1/audit-log").await.json();
        assert_eq!(all.data.len(), 3);
        assert_eq!(all.limit, 100);
        assert_eq!(all.data[0].operation_type, AdjustmentKind::Deduct);

        let bobs: AuditLogResponse = server
            .get("/admin/api/v1/audit-log")
            .add_query_param("user_id", bob)
            .await
            .json();
        assert_eq!(bobs.data.len(), 1);
        assert_eq!(bobs.data[0].amount, Decimal::new(20, 0));

        let capped: AuditLogResponse = server
            .get("/admin/api/v1/audit-log")
            .add_query_param("limit", 5000)
            .await
            .json();
        assert_eq!(capped.limit, 1000);
    }
}
