//! The API endpoints URIs.

/// The route for checking that the server is up.
pub const HEALTH: &str = "/api/health";
/// The route to start a payment.
pub const PAYMENTS: &str = "/api/payments";
/// The route to get a payment request by its checkout request ID.
pub const PAYMENT: &str = "/api/payments/{checkout_request_id}";
/// The route the provider posts STK push results to.
pub const CALLBACK: &str = "/api/mpesa/callback";
/// The route to ask the provider for the account balance.
pub const BALANCE: &str = "/api/mpesa/balance";

// These tests are here so that we know when we call `Uri::from_shared` it will not panic.
#[cfg(test)]
mod endpoints_tests {
    use axum::http::Uri;

    use crate::endpoints;

    fn assert_endpoint_is_valid_uri(uri: &str) {
        assert!(uri.parse::<Uri>().is_ok());
    }

    #[test]
    fn endpoints_are_valid_uris() {
        assert_endpoint_is_valid_uri(endpoints::HEALTH);
        assert_endpoint_is_valid_uri(endpoints::PAYMENTS);
        assert_endpoint_is_valid_uri(endpoints::PAYMENT);
        assert_endpoint_is_valid_uri(endpoints::CALLBACK);
        assert_endpoint_is_valid_uri(endpoints::BALANCE);
    }
}
