//! Test utilities for integration testing (available with `test-utils` feature).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum_test::TestServer;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::billing::{PricingModel, RetryPolicy};
use crate::config::{Config, DatabaseConfig};
use crate::db::models::audit_log::AdjustmentKind;
use crate::recharge::RechargePackage;
use crate::storage::in_memory::InMemoryStorage;
use crate::types::UserId;
use crate::{AppState, build_router};

/// Priced at base fee 10, rate 1, input weight 1, output weight 3, capped at 4096 output tokens
pub const TEST_MODEL: &str = "test-model";
/// Costs 30, credits 35
pub const TEST_PACKAGE: &str = "starter";
pub const TEST_CALLBACK_SECRET: &str = "test-callback-secret";

/// In-memory config with one model and one package. Background tasks are off so tests drive
/// sweeps explicitly.
pub fn test_config() -> Config {
    let mut config = Config {
        database: DatabaseConfig::Memory,
        ..Default::default()
    };

    config.billing.retry = RetryPolicy {
        max_attempts: 5,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    };
    config.pricing = HashMap::from([(
        TEST_MODEL.to_string(),
        PricingModel {
            rate_multiplier: Decimal::ONE,
            base_fee: Decimal::new(10, 0),
            input_weight: Decimal::ONE,
            output_weight: Decimal::new(3, 0),
            max_tokens_per_request: 4096,
        },
    )]);
    config.recharge.packages = HashMap::from([(
        TEST_PACKAGE.to_string(),
        RechargePackage {
            price: Decimal::new(30, 0),
            credits: Decimal::new(35, 0),
        },
    )]);
    config.reconciliation.enabled = false;
    config.recharge.sweeper_enabled = false;
    config
}

pub fn create_test_state(config: Config) -> AppState<InMemoryStorage> {
    AppState::new(Arc::new(InMemoryStorage::new()), config)
}

pub fn create_test_server() -> (TestServer, AppState<InMemoryStorage>) {
    create_test_server_with(test_config())
}

pub fn create_test_server_with(config: Config) -> (TestServer, AppState<InMemoryStorage>) {
    let state = create_test_state(config);
    let server = TestServer::new(build_router(state.clone()).into_make_service()).expect("Failed to create test server");
    (server, state)
}

/// Open an account for a fresh user and grant `amount` through the audited adjustment path
pub async fn fund_user(state: &AppState<InMemoryStorage>, amount: Decimal) -> UserId {
    let user_id = Uuid::new_v4();
    state
        .balances
        .ensure_account(user_id)
        .await
        .expect("Failed to open test account");

    if amount > Decimal::ZERO {
        state
            .adjustments
            .adjust(Uuid::nil(), user_id, AdjustmentKind::Grant, amount, Some("test funding".to_string()))
            .await
            .expect("Failed to fund test account");
    }
    user_id
}
