//! Starting STK push payments and tracking them until the provider reports a
//! result.

mod endpoint;
mod initiator;
mod request;

pub use endpoint::{get_payment_endpoint, initiate_payment_endpoint, request_balance_endpoint};
pub use initiator::{InitiatePayment, PaymentInitiator};
pub use request::{
    PaymentRequest, PaymentState, create_payment_request_table, get_overdue_requests,
    get_payment_request, mark_failed, mark_succeeded, mark_timed_out, purge_resolved_requests,
    record_poll_attempt,
};

#[cfg(test)]
pub(crate) use request::test_utils;
