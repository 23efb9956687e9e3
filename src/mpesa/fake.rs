//! An in-memory [PaymentProvider] for tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;

use crate::{
    mpesa::{PaymentProvider, ProviderError, ProviderOutcome, PushAccepted, PushRequest},
    payment::PaymentRequest,
};

/// Accepts every push with sequential checkout IDs and answers status queries
/// from a per-request script. Unscripted queries are [ProviderOutcome::Pending].
#[derive(Debug, Default)]
pub struct FakeProvider {
    push_error: Mutex<Option<ProviderError>>,
    pushes: Mutex<Vec<PushRequest>>,
    outcomes: Mutex<HashMap<String, VecDeque<Result<ProviderOutcome, ProviderError>>>>,
    queries: AtomicUsize,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every push fail with `error`.
    pub fn fail_pushes_with(&self, error: ProviderError) {
        *self.push_error.lock().unwrap() = Some(error);
    }

    /// Queue the answer to the next status query for `checkout_request_id`.
    pub fn script(
        &self,
        checkout_request_id: &str,
        outcome: Result<ProviderOutcome, ProviderError>,
    ) {
        self.outcomes
            .lock()
            .unwrap()
            .entry(checkout_request_id.to_owned())
            .or_default()
            .push_back(outcome);
    }

    pub fn pushes(&self) -> Vec<PushRequest> {
        self.pushes.lock().unwrap().clone()
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentProvider for FakeProvider {
    async fn request_payment(&self, request: &PushRequest) -> Result<PushAccepted, ProviderError> {
        if let Some(error) = self.push_error.lock().unwrap().clone() {
            return Err(error);
        }

        let mut pushes = self.pushes.lock().unwrap();
        pushes.push(request.clone());
        let n = pushes.len();

        Ok(PushAccepted {
            merchant_request_id: format!("merchant-{n}"),
            checkout_request_id: format!("ws_CO_{n}"),
            customer_message: "Success. Request accepted for processing".to_owned(),
        })
    }

    async fn query_status(
        &self,
        request: &PaymentRequest,
    ) -> Result<ProviderOutcome, ProviderError> {
        self.queries.fetch_add(1, Ordering::SeqCst);

        self.outcomes
            .lock()
            .unwrap()
            .get_mut(&request.checkout_request_id)
            .and_then(|script| script.pop_front())
            .unwrap_or(Ok(ProviderOutcome::Pending))
    }
}
