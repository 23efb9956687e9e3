//! Applies provider results to payment requests and the ledger.
//!
//! Callbacks and status queries both end up here, so a payment reported by
//! both paths is settled the same way and recorded once.

use std::{
    fmt::Debug,
    sync::{Arc, Mutex},
};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

use crate::{
    Error, LedgerWriter, RecordOutcome,
    callback::parse_callback,
    database_id::CategoryId,
    ledger::{PaymentResult, is_provisional_receipt, provisional_receipt},
    mpesa::{PaymentDetails, ProviderOutcome},
    payment::{PaymentRequest, get_payment_request, mark_failed, mark_succeeded},
    reconciliation::{
        NewReconciliationItem, ReconciliationItem, ReconciliationKind, enqueue, get_retryable,
        record_attempt, resolve_item, resolve_items_for_checkout,
    },
};

const SUCCESS_DESCRIPTION: &str = "The service request is processed successfully.";

/// What happened to a provider result.
#[derive(Debug, Clone, PartialEq)]
pub enum Settled {
    /// The payment is in the ledger, either newly written or already there.
    Recorded(RecordOutcome),
    /// The provider reported that the payment did not go through.
    Failed,
    /// The customer has not finished paying yet.
    Pending,
    /// The result could not be applied and was queued for reconciliation.
    Queued(ReconciliationKind),
}

/// The data stored with retryable reconciliation items so they can be
/// replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ReplayPayload {
    /// A raw callback body that was never processed, stored base64 encoded
    /// so any bytes replay exactly.
    Callback {
        #[serde(with = "base64_body")]
        body: Vec<u8>,
    },
    /// A parsed payment that could not be written.
    Payment {
        payment: PaymentResult,
        category_id: Option<CategoryId>,
    },
}

impl ReplayPayload {
    pub(crate) fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(Error::from)
    }
}

mod base64_body {
    use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(de::Error::custom)
    }
}

/// The result of replaying the retryable reconciliation items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Items that were settled and resolved.
    pub resolved: usize,
    /// Items that failed again.
    pub failed: usize,
}

/// A payment that could not be written and must be retried later.
struct Deferred {
    kind: ReconciliationKind,
    payment: PaymentResult,
    category_id: Option<CategoryId>,
    error: Error,
}

enum Step {
    Done(Settled),
    Deferred(Deferred),
}

/// Where a provider result came from.
#[derive(Debug, Clone, Copy)]
enum Source<'a> {
    /// A callback, with its raw body.
    Callback(&'a str),
    /// The answer to a status query, which never carries a receipt number.
    StatusQuery,
}

impl<'a> Source<'a> {
    fn raw(&self) -> Option<&'a str> {
        match *self {
            Source::Callback(raw) => Some(raw),
            Source::StatusQuery => None,
        }
    }
}

/// Settles provider results against stored payment requests.
pub struct Settlement {
    db_connection: Arc<Mutex<Connection>>,
    ledger: LedgerWriter,
    provider_offset: UtcOffset,
}

impl Debug for Settlement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settlement")
            .field("ledger", &self.ledger)
            .field("provider_offset", &self.provider_offset)
            .finish_non_exhaustive()
    }
}

impl Settlement {
    /// Create a settlement for the provider whose timestamps are in
    /// `provider_offset`.
    pub fn new(
        db_connection: Arc<Mutex<Connection>>,
        ledger: LedgerWriter,
        provider_offset: UtcOffset,
    ) -> Self {
        Self {
            db_connection,
            ledger,
            provider_offset,
        }
    }

    /// The ledger writer results are recorded with.
    pub fn ledger(&self) -> &LedgerWriter {
        &self.ledger
    }

    /// Settle a raw callback body.
    ///
    /// A body that is not a callback, or a success that lacks an amount or
    /// receipt number, is queued for reconciliation with the raw body and
    /// nothing is written to the ledger.
    ///
    /// # Errors
    /// Returns an error only if the result could neither be applied nor
    /// queued, e.g. the database is unavailable.
    pub fn apply_callback(&self, body: &[u8]) -> Result<Settled, Error> {
        let received_at = OffsetDateTime::now_utc();
        let raw = String::from_utf8_lossy(body);

        let parsed = match parse_callback(body, self.provider_offset) {
            Ok(parsed) => parsed,
            Err(error) => {
                let connection = self.lock()?;
                enqueue(
                    ReconciliationKind::MalformedCallback,
                    NewReconciliationItem {
                        payload: Some(&raw),
                        reason: &error.to_string(),
                        ..Default::default()
                    },
                    &connection,
                )?;

                return Ok(Settled::Queued(ReconciliationKind::MalformedCallback));
            }
        };

        tracing::info!(
            checkout_request_id = parsed.checkout_request_id.as_deref(),
            merchant_request_id = parsed.merchant_request_id.as_deref(),
            "Received payment callback"
        );

        let step = self.settle(
            parsed.checkout_request_id.as_deref(),
            parsed.outcome,
            received_at,
            Source::Callback(&raw),
        )?;

        self.finish(step)
    }

    /// Settle the answer to a status query for the request
    /// `checkout_request_id`. `received_at` is used as the transaction date
    /// when the outcome has none.
    ///
    /// Status queries do not report receipt numbers, so a success is
    /// recorded under a provisional receipt number that the callback replaces
    /// if it arrives later.
    ///
    /// # Errors
    /// Returns an error only if the result could neither be applied nor
    /// queued, e.g. the database is unavailable.
    pub fn apply(
        &self,
        checkout_request_id: &str,
        outcome: ProviderOutcome,
        received_at: OffsetDateTime,
    ) -> Result<Settled, Error> {
        let step = self.settle(
            Some(checkout_request_id),
            outcome,
            received_at,
            Source::StatusQuery,
        )?;

        self.finish(step)
    }

    /// Replay up to `limit` retryable reconciliation items that have been
    /// tried fewer than `max_attempts` times.
    ///
    /// # Errors
    /// Returns an error if the queue cannot be read.
    pub fn replay_pending(&self, max_attempts: u32, limit: u32) -> Result<ReplaySummary, Error> {
        let items = {
            let connection = self.lock()?;
            get_retryable(max_attempts, limit, &connection)?
        };

        let mut summary = ReplaySummary::default();

        for item in items {
            match self.replay(&item) {
                Ok(()) => {
                    let connection = self.lock()?;
                    resolve_item(item.id, &connection)?;
                    summary.resolved += 1;
                }
                Err(error) => {
                    tracing::warn!(item_id = item.id, kind = %item.kind, "Replay failed: {error}");
                    let connection = self.lock()?;
                    record_attempt(item.id, &error.to_string(), &connection)?;
                    summary.failed += 1;
                }
            }
        }

        if summary.resolved + summary.failed > 0 {
            tracing::info!(
                resolved = summary.resolved,
                failed = summary.failed,
                "Replayed reconciliation items"
            );
        }

        Ok(summary)
    }

    fn replay(&self, item: &ReconciliationItem) -> Result<(), Error> {
        let payload = item
            .payload
            .as_deref()
            .ok_or_else(|| Error::JSONSerializationError("item has no payload".to_owned()))?;

        match serde_json::from_str::<ReplayPayload>(payload)? {
            // A callback that cannot be settled now is queued again as a new
            // item, which takes over from this one.
            ReplayPayload::Callback { body } => self.apply_callback(&body).map(|_| ()),
            ReplayPayload::Payment {
                payment,
                category_id,
            } => match self.record(payment, category_id)? {
                Step::Done(_) => Ok(()),
                Step::Deferred(deferred) => Err(deferred.error),
            },
        }
    }

    fn settle(
        &self,
        checkout_request_id: Option<&str>,
        outcome: ProviderOutcome,
        received_at: OffsetDateTime,
        source: Source<'_>,
    ) -> Result<Step, Error> {
        match outcome {
            ProviderOutcome::Pending => Ok(Step::Done(Settled::Pending)),
            ProviderOutcome::Failed {
                result_code,
                description,
            } => {
                if let Some(checkout_request_id) = checkout_request_id {
                    let connection = self.lock()?;
                    let changed =
                        mark_failed(checkout_request_id, &result_code, &description, &connection)?;

                    if changed {
                        tracing::info!(
                            checkout_request_id,
                            result_code = %result_code,
                            "Payment failed: {description}"
                        );
                    } else {
                        tracing::info!(
                            checkout_request_id,
                            result_code = %result_code,
                            "Ignoring failure for a request that is no longer waiting"
                        );
                    }
                }

                Ok(Step::Done(Settled::Failed))
            }
            ProviderOutcome::Succeeded(details) => {
                self.settle_success(checkout_request_id, details, received_at, source)
            }
        }
    }

    fn settle_success(
        &self,
        checkout_request_id: Option<&str>,
        details: PaymentDetails,
        received_at: OffsetDateTime,
        source: Source<'_>,
    ) -> Result<Step, Error> {
        let request = match checkout_request_id {
            Some(checkout_request_id) => self.find_request(checkout_request_id)?,
            None => None,
        };

        let receipt_number = match (details.receipt_number, source, checkout_request_id) {
            (Some(receipt_number), _, _) => Some(receipt_number),
            (None, Source::StatusQuery, Some(checkout_request_id)) => {
                Some(provisional_receipt(checkout_request_id))
            }
            (None, _, _) => None,
        };

        let (Some(amount), Some(receipt_number)) = (details.amount, receipt_number) else {
            let reason = if details.amount.is_none() {
                "success reported without an amount"
            } else {
                "success reported without a receipt number"
            };
            let connection = self.lock()?;
            enqueue(
                ReconciliationKind::MalformedCallback,
                NewReconciliationItem {
                    checkout_request_id,
                    receipt_number: None,
                    payload: source.raw(),
                    reason,
                },
                &connection,
            )?;
            if let Some(checkout_request_id) = checkout_request_id {
                mark_succeeded(checkout_request_id, None, SUCCESS_DESCRIPTION, &connection)?;
            }

            return Ok(Step::Done(Settled::Queued(
                ReconciliationKind::MalformedCallback,
            )));
        };

        let payment = PaymentResult {
            receipt_number,
            amount,
            phone_number: details.phone_number.or_else(|| {
                request
                    .as_ref()
                    .map(|request| request.phone_number.clone())
            }),
            transaction_date: details.transaction_date.unwrap_or(received_at),
            checkout_request_id: checkout_request_id.map(str::to_owned),
        };
        let category_id = request.as_ref().and_then(|request| request.category_id);

        if let Some(request) = &request {
            if request.amount != payment.amount {
                tracing::warn!(
                    checkout_request_id = %request.checkout_request_id,
                    requested = %request.amount,
                    paid = %payment.amount,
                    "Paid amount differs from the requested amount"
                );
            }
        }

        self.record(payment, category_id)
    }

    fn record(&self, payment: PaymentResult, category_id: Option<CategoryId>) -> Result<Step, Error> {
        match self.ledger.record_payment(&payment, category_id) {
            Ok(outcome) => {
                if let Some(checkout_request_id) = &payment.checkout_request_id {
                    let connection = self.lock()?;
                    mark_succeeded(
                        checkout_request_id,
                        confirmed_receipt(&outcome.entry().receipt_number),
                        SUCCESS_DESCRIPTION,
                        &connection,
                    )?;
                    for kind in [
                        ReconciliationKind::TimedOut,
                        ReconciliationKind::MalformedCallback,
                    ] {
                        resolve_items_for_checkout(kind, checkout_request_id, &connection)?;
                    }
                }

                Ok(Step::Done(Settled::Recorded(outcome)))
            }
            Err(error) => {
                let kind = match error {
                    Error::AggregateFailed(_) => ReconciliationKind::PendingAggregate,
                    _ => ReconciliationKind::ProcessingFailed,
                };
                tracing::error!(
                    receipt_number = %payment.receipt_number,
                    kind = %kind,
                    "Could not record payment: {error}"
                );

                Ok(Step::Deferred(Deferred {
                    kind,
                    payment,
                    category_id,
                    error,
                }))
            }
        }
    }

    /// Queue a deferred payment for replay.
    fn finish(&self, step: Step) -> Result<Settled, Error> {
        let deferred = match step {
            Step::Done(settled) => return Ok(settled),
            Step::Deferred(deferred) => deferred,
        };

        let payload = ReplayPayload::Payment {
            payment: deferred.payment.clone(),
            category_id: deferred.category_id,
        }
        .to_json()?;

        let connection = self.lock()?;
        enqueue(
            deferred.kind,
            NewReconciliationItem {
                checkout_request_id: deferred.payment.checkout_request_id.as_deref(),
                receipt_number: Some(&deferred.payment.receipt_number),
                payload: Some(&payload),
                reason: &deferred.error.to_string(),
            },
            &connection,
        )?;

        // The provider confirmed the payment, so stop polling for it.
        if let Some(checkout_request_id) = &deferred.payment.checkout_request_id {
            mark_succeeded(
                checkout_request_id,
                confirmed_receipt(&deferred.payment.receipt_number),
                SUCCESS_DESCRIPTION,
                &connection,
            )?;
        }

        Ok(Settled::Queued(deferred.kind))
    }

    fn find_request(&self, checkout_request_id: &str) -> Result<Option<PaymentRequest>, Error> {
        let connection = self.lock()?;

        match get_payment_request(checkout_request_id, &connection) {
            Ok(request) => Ok(Some(request)),
            Err(Error::NotFound) => {
                tracing::warn!(checkout_request_id, "Result for an unknown payment request");
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, Error> {
        self.db_connection
            .lock()
            .map_err(|_| Error::DatabaseLockError)
    }
}

/// The receipt number to store on a payment request, `None` until the
/// provider has sent the real one.
fn confirmed_receipt(receipt_number: &str) -> Option<&str> {
    (!is_provisional_receipt(receipt_number)).then_some(receipt_number)
}


#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::{Arc, Mutex},
    };

    use serde_json::json;
    use time::{OffsetDateTime, macros::datetime};

    use crate::{
        Amount, PhoneNumber,
        aggregate::get_aggregate,
        ledger::{
            count_entries, get_entry_by_checkout_request, get_entry_by_receipt,
            is_provisional_receipt,
        },
        mpesa::{PaymentDetails, ProviderOutcome},
        payment::{PaymentState, get_payment_request, mark_timed_out, test_utils::insert_test_request},
        reconciliation::{ReconciliationKind, count_items, get_unresolved},
    };

    use super::{
        ReplayPayload, Settled,
        test_utils::{SettlementFixture, settlement_fixture},
    };

    fn callback_body(checkout_request_id: &str, items: serde_json::Value) -> Vec<u8> {
        json!({
            "Body": {
                "stkCallback": {
                    "MerchantRequestID": "29115-34620561-1",
                    "CheckoutRequestID": checkout_request_id,
                    "ResultCode": 0,
                    "ResultDesc": "The service request is processed successfully.",
                    "CallbackMetadata": { "Item": items }
                }
            }
        })
        .to_string()
        .into_bytes()
    }

    fn full_callback(checkout_request_id: &str) -> Vec<u8> {
        callback_body(
            checkout_request_id,
            json!([
                {"Name": "Amount", "Value": 500},
                {"Name": "MpesaReceiptNumber", "Value": "ABC123"},
                {"Name": "TransactionDate", "Value": 20251005123000u64},
                {"Name": "PhoneNumber", "Value": 254712345678u64}
            ]),
        )
    }

    /// Log lines written while `f` runs.
    fn captured_logs(f: impl FnOnce()) -> String {
        #[derive(Clone, Default)]
        struct LogBuffer(Arc<Mutex<Vec<u8>>>);

        impl io::Write for LogBuffer {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let buffer = LogBuffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, f);

        let bytes = buffer.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    /// What a status query reports for the request made by `with_request`.
    fn queried_success() -> ProviderOutcome {
        ProviderOutcome::Succeeded(PaymentDetails {
            amount: Some(Amount::from_shillings(500)),
            receipt_number: None,
            phone_number: Some(PhoneNumber::new_unchecked("254712345678")),
            transaction_date: None,
        })
    }

    fn with_request(fixture: &SettlementFixture, checkout_request_id: &str) {
        let connection = fixture.connection.lock().unwrap();
        insert_test_request(
            checkout_request_id,
            Some(fixture.scope.category_id),
            OffsetDateTime::now_utc(),
            &connection,
        );
    }

    #[test]
    fn callback_records_payment_once() {
        let fixture = settlement_fixture();
        with_request(&fixture, "ws_CO_1");

        let first = fixture.settlement.apply_callback(&full_callback("ws_CO_1")).unwrap();
        let second = fixture.settlement.apply_callback(&full_callback("ws_CO_1")).unwrap();

        assert!(matches!(first, Settled::Recorded(ref outcome) if !outcome.is_duplicate()));
        assert!(matches!(second, Settled::Recorded(ref outcome) if outcome.is_duplicate()));

        let connection = fixture.connection.lock().unwrap();
        assert_eq!(count_entries(&connection), Ok(1));
        assert_eq!(
            get_aggregate(fixture.scope, &connection).unwrap().spent,
            Amount::from_shillings(500)
        );
        let request = get_payment_request("ws_CO_1", &connection).unwrap();
        assert_eq!(request.state, PaymentState::Succeeded);
        assert_eq!(request.receipt_number.as_deref(), Some("ABC123"));
        let entry = get_entry_by_receipt("ABC123", &connection).unwrap();
        assert_eq!(entry.transaction_date, datetime!(2025-10-05 09:30:00 UTC));
    }

    #[test]
    fn missing_receipt_writes_nothing_and_queues_one_item() {
        let fixture = settlement_fixture();
        with_request(&fixture, "ws_CO_1");
        let body = callback_body(
            "ws_CO_1",
            json!([
                {"Name": "Amount", "Value": 500},
                {"Name": "PhoneNumber", "Value": 254712345678u64}
            ]),
        );

        let mut settled = None;
        let logs = captured_logs(|| settled = Some(fixture.settlement.apply_callback(&body)));

        assert_eq!(
            settled,
            Some(Ok(Settled::Queued(ReconciliationKind::MalformedCallback)))
        );
        assert_eq!(
            logs.matches("kind=malformed_callback").count(),
            1,
            "want the malformed callback logged once, got:\n{logs}"
        );
        let connection = fixture.connection.lock().unwrap();
        assert_eq!(count_entries(&connection), Ok(0));
        assert_eq!(
            count_items(ReconciliationKind::MalformedCallback, &connection),
            Ok(1)
        );
        let items = get_unresolved(&connection).unwrap();
        assert_eq!(items[0].payload.as_deref(), Some(&*String::from_utf8(body).unwrap()));
    }

    #[test]
    fn unparseable_body_is_queued() {
        let fixture = settlement_fixture();

        let settled = fixture.settlement.apply_callback(b"{not json").unwrap();

        assert_eq!(settled, Settled::Queued(ReconciliationKind::MalformedCallback));
        let connection = fixture.connection.lock().unwrap();
        assert_eq!(count_entries(&connection), Ok(0));
        assert_eq!(
            count_items(ReconciliationKind::MalformedCallback, &connection),
            Ok(1)
        );
    }

    #[test]
    fn failure_is_stored_without_ledger_write() {
        let fixture = settlement_fixture();
        with_request(&fixture, "ws_CO_1");

        let settled = fixture
            .settlement
            .apply(
                "ws_CO_1",
                ProviderOutcome::Failed {
                    result_code: "1032".to_owned(),
                    description: "Request cancelled by user".to_owned(),
                },
                OffsetDateTime::now_utc(),
            )
            .unwrap();

        assert_eq!(settled, Settled::Failed);
        let connection = fixture.connection.lock().unwrap();
        let request = get_payment_request("ws_CO_1", &connection).unwrap();
        assert_eq!(request.state, PaymentState::Failed);
        assert_eq!(request.result_code.as_deref(), Some("1032"));
        assert_eq!(count_entries(&connection), Ok(0));
    }

    #[test]
    fn poll_and_callback_settle_the_same_way() {
        let by_callback = settlement_fixture();
        with_request(&by_callback, "ws_CO_1");
        by_callback
            .settlement
            .apply_callback(&full_callback("ws_CO_1"))
            .unwrap();

        let by_poll = settlement_fixture();
        with_request(&by_poll, "ws_CO_1");
        let settled = by_poll
            .settlement
            .apply("ws_CO_1", queried_success(), OffsetDateTime::now_utc())
            .unwrap();

        assert!(matches!(settled, Settled::Recorded(ref outcome) if !outcome.is_duplicate()));
        let a = by_callback.connection.lock().unwrap();
        let b = by_poll.connection.lock().unwrap();
        let entry_a = get_entry_by_checkout_request("ws_CO_1", &a).unwrap();
        let entry_b = get_entry_by_checkout_request("ws_CO_1", &b).unwrap();
        assert_eq!(entry_a.amount, entry_b.amount);
        assert_eq!(entry_a.user_id, entry_b.user_id);
        assert_eq!(entry_a.category_id, entry_b.category_id);
        assert_eq!(entry_a.phone_number, entry_b.phone_number);
        assert_eq!(count_entries(&a), count_entries(&b));
        assert_eq!(
            get_aggregate(by_callback.scope, &a).unwrap().spent,
            get_aggregate(by_poll.scope, &b).unwrap().spent
        );
        assert_eq!(
            get_payment_request("ws_CO_1", &a).unwrap().state,
            get_payment_request("ws_CO_1", &b).unwrap().state
        );
        assert!(get_unresolved(&b).unwrap().is_empty());
    }

    #[test]
    fn callback_after_poll_confirms_the_receipt() {
        let fixture = settlement_fixture();
        with_request(&fixture, "ws_CO_1");
        fixture
            .settlement
            .apply("ws_CO_1", queried_success(), OffsetDateTime::now_utc())
            .unwrap();
        {
            let connection = fixture.connection.lock().unwrap();
            let entry = get_entry_by_checkout_request("ws_CO_1", &connection).unwrap();
            assert!(is_provisional_receipt(&entry.receipt_number));
            assert_eq!(
                get_payment_request("ws_CO_1", &connection)
                    .unwrap()
                    .receipt_number,
                None
            );
        }

        let settled = fixture
            .settlement
            .apply_callback(&full_callback("ws_CO_1"))
            .unwrap();

        assert!(matches!(settled, Settled::Recorded(ref outcome) if outcome.is_duplicate()));
        let connection = fixture.connection.lock().unwrap();
        assert_eq!(count_entries(&connection), Ok(1));
        assert_eq!(
            get_entry_by_receipt("ABC123", &connection).unwrap().checkout_request_id.as_deref(),
            Some("ws_CO_1")
        );
        assert_eq!(
            get_payment_request("ws_CO_1", &connection)
                .unwrap()
                .receipt_number
                .as_deref(),
            Some("ABC123")
        );
        assert_eq!(
            get_aggregate(fixture.scope, &connection).unwrap().spent,
            Amount::from_shillings(500)
        );
    }

    #[test]
    fn absurd_amount_is_not_recorded() {
        let fixture = settlement_fixture();
        with_request(&fixture, "ws_CO_1");
        let body = callback_body(
            "ws_CO_1",
            json!([
                {"Name": "Amount", "Value": 1e300},
                {"Name": "MpesaReceiptNumber", "Value": "ABC123"}
            ]),
        );

        let settled = fixture.settlement.apply_callback(&body).unwrap();

        assert_eq!(settled, Settled::Queued(ReconciliationKind::MalformedCallback));
        let connection = fixture.connection.lock().unwrap();
        assert_eq!(count_entries(&connection), Ok(0));
        assert_eq!(
            get_aggregate(fixture.scope, &connection).unwrap().spent,
            Amount::ZERO
        );
    }

    #[test]
    fn late_callback_after_time_out_records_money() {
        let fixture = settlement_fixture();
        with_request(&fixture, "ws_CO_1");
        {
            let connection = fixture.connection.lock().unwrap();
            assert_eq!(mark_timed_out("ws_CO_1", &connection), Ok(true));
        }

        fixture.settlement.apply_callback(&full_callback("ws_CO_1")).unwrap();

        let connection = fixture.connection.lock().unwrap();
        assert_eq!(
            get_payment_request("ws_CO_1", &connection).unwrap().state,
            PaymentState::Succeeded
        );
        assert_eq!(count_entries(&connection), Ok(1));
    }

    #[test]
    fn missing_phone_falls_back_to_request() {
        let fixture = settlement_fixture();
        with_request(&fixture, "ws_CO_1");
        let body = callback_body(
            "ws_CO_1",
            json!([
                {"Name": "Amount", "Value": 500},
                {"Name": "MpesaReceiptNumber", "Value": "ABC123"}
            ]),
        );

        fixture.settlement.apply_callback(&body).unwrap();

        let connection = fixture.connection.lock().unwrap();
        let entry = get_entry_by_receipt("ABC123", &connection).unwrap();
        assert_eq!(
            entry.phone_number,
            Some(PhoneNumber::new_unchecked("254712345678"))
        );
        assert_eq!(entry.user_id, Some(fixture.scope.user_id));
        assert_eq!(entry.category_id, Some(fixture.scope.category_id));
    }

    #[test]
    fn failed_aggregate_is_queued_and_replayed() {
        let fixture = settlement_fixture();
        with_request(&fixture, "ws_CO_1");
        fixture
            .connection
            .lock()
            .unwrap()
            .execute_batch("ALTER TABLE category_aggregate RENAME TO category_aggregate_hidden")
            .unwrap();

        let settled = fixture.settlement.apply_callback(&full_callback("ws_CO_1")).unwrap();

        assert_eq!(settled, Settled::Queued(ReconciliationKind::PendingAggregate));
        {
            let connection = fixture.connection.lock().unwrap();
            assert_eq!(count_entries(&connection), Ok(0));
            let items = get_unresolved(&connection).unwrap();
            assert_eq!(items.len(), 1);
            let payload: ReplayPayload =
                serde_json::from_str(items[0].payload.as_deref().unwrap()).unwrap();
            assert!(matches!(payload, ReplayPayload::Payment { .. }));
            connection
                .execute_batch("ALTER TABLE category_aggregate_hidden RENAME TO category_aggregate")
                .unwrap();
        }

        let summary = fixture.settlement.replay_pending(5, 10).unwrap();

        assert_eq!(summary.resolved, 1);
        assert_eq!(summary.failed, 0);
        let connection = fixture.connection.lock().unwrap();
        assert_eq!(count_entries(&connection), Ok(1));
        assert!(get_unresolved(&connection).unwrap().is_empty());
        assert_eq!(
            get_aggregate(fixture.scope, &connection).unwrap().spent,
            Amount::from_shillings(500)
        );
    }

    #[test]
    fn queued_callback_body_is_replayed() {
        let fixture = settlement_fixture();
        with_request(&fixture, "ws_CO_1");
        let body = full_callback("ws_CO_1");
        {
            let connection = fixture.connection.lock().unwrap();
            crate::reconciliation::enqueue(
                ReconciliationKind::ProcessingFailed,
                crate::reconciliation::NewReconciliationItem {
                    payload: Some(&ReplayPayload::Callback { body }.to_json().unwrap()),
                    reason: "callback queue full",
                    ..Default::default()
                },
                &connection,
            )
            .unwrap();
        }

        let summary = fixture.settlement.replay_pending(5, 10).unwrap();

        assert_eq!(summary.resolved, 1);
        let connection = fixture.connection.lock().unwrap();
        assert_eq!(count_entries(&connection), Ok(1));
    }
}
