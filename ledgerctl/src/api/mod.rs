//! HTTP layer over the ledger services.
//!
//! - **[`handlers`]**: Axum route handlers
//! - **[`models`]**: Request/response data structures, kept separate from the storage rows
//!
//! # API Structure
//!
//! - **Health** (`/healthz`)
//! - **Payment callbacks** (`/webhooks/payments`): gateway notifications, optionally HMAC-signed
//! - **Balances** (`/admin/api/v1/users/{user_id}/balance*`): accounts and operator adjustments
//! - **Ledger** (`/admin/api/v1/freeze-records/*`): per-request billing records
//! - **Recharge** (`/admin/api/v1/recharge-orders/*`): order creation and lookup
//! - **Audit** (`/admin/api/v1/audit-log`): manual adjustment history
//! - **Metrics** (`/internal/metrics`): Prometheus scrape endpoint, when enabled
//!
//! Authentication of the admin routes is left to the deployment (e.g. an SSO proxy in front).

pub mod handlers;
pub mod models;
