//! Application router configuration.

use axum::{
    Json, Router, middleware,
    routing::{get, post},
};
use serde_json::{Value, json};

use crate::{
    AppState,
    callback::callback_endpoint,
    endpoints,
    logging::logging_middleware,
    payment::{get_payment_endpoint, initiate_payment_endpoint, request_balance_endpoint},
};

/// Return a router with all the app's routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(endpoints::HEALTH, get(get_health))
        .route(endpoints::PAYMENTS, post(initiate_payment_endpoint))
        .route(endpoints::PAYMENT, get(get_payment_endpoint))
        .route(endpoints::BALANCE, get(request_balance_endpoint))
        .route(endpoints::CALLBACK, post(callback_endpoint))
        .layer(middleware::from_fn(logging_middleware))
        .with_state(state)
}

async fn get_health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}
