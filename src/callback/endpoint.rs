//! The webhook the provider posts STK push results to.
//!
//! The handler only hands the raw body to a worker and acknowledges. The
//! provider treats a slow or failed acknowledgement as a failed delivery, so
//! no ledger work happens on this path.

use std::sync::{Arc, Mutex};

use axum::{
    body::Bytes,
    extract::{FromRef, State},
    http::{StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use rusqlite::Connection;
use tokio::sync::{
    Semaphore,
    mpsc::{self, error::TrySendError},
};

use crate::{
    AppState, Error,
    reconciliation::{NewReconciliationItem, ReconciliationKind, enqueue},
    settlement::{ReplayPayload, Settlement},
};

/// The body sent in response to every callback.
pub const CALLBACK_ACKNOWLEDGEMENT: &str = r#"{"ResultCode":0,"ResultDesc":"Accepted"}"#;

/// A bounded queue of raw callback bodies waiting to be settled.
///
/// Bodies that do not fit are written to the reconciliation queue instead so
/// an acknowledged callback is never lost.
#[derive(Debug, Clone)]
pub struct CallbackQueue {
    sender: mpsc::Sender<Bytes>,
    db_connection: Arc<Mutex<Connection>>,
}

impl CallbackQueue {
    /// Create a queue holding up to `capacity` bodies and the receiver that
    /// [run_callback_worker] drains.
    pub fn new(
        capacity: usize,
        db_connection: Arc<Mutex<Connection>>,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        let (sender, receiver) = mpsc::channel(capacity);

        (
            Self {
                sender,
                db_connection,
            },
            receiver,
        )
    }

    /// Queue `body` for settlement.
    ///
    /// Returns `false` if the queue was full or closed, in which case the body
    /// was stored as a `processing_failed` reconciliation item.
    pub fn submit(&self, body: Bytes) -> bool {
        let body = match self.sender.try_send(body) {
            Ok(()) => return true,
            Err(TrySendError::Full(body)) => {
                tracing::warn!("Callback queue is full, storing callback for replay");
                body
            }
            Err(TrySendError::Closed(body)) => {
                tracing::error!("Callback queue is closed, storing callback for replay");
                body
            }
        };

        if let Err(error) = self.store_for_replay(&body) {
            tracing::error!(
                body = %String::from_utf8_lossy(&body),
                "Could not store callback for replay: {error}"
            );
        }

        false
    }

    fn store_for_replay(&self, body: &[u8]) -> Result<(), Error> {
        let payload = ReplayPayload::Callback {
            body: body.to_vec(),
        }
        .to_json()?;

        let connection = self
            .db_connection
            .lock()
            .map_err(|_| Error::DatabaseLockError)?;

        enqueue(
            ReconciliationKind::ProcessingFailed,
            NewReconciliationItem {
                payload: Some(&payload),
                reason: "callback queue was unavailable",
                ..Default::default()
            },
            &connection,
        )?;

        Ok(())
    }
}

impl FromRef<AppState> for CallbackQueue {
    fn from_ref(state: &AppState) -> Self {
        state.callback_queue.clone()
    }
}

/// A route handler for the provider's result callback.
///
/// Always responds `200 OK` with [CALLBACK_ACKNOWLEDGEMENT], whatever the
/// body contains.
pub async fn callback_endpoint(State(queue): State<CallbackQueue>, body: Bytes) -> Response {
    queue.submit(body);

    acknowledgement()
}

/// The `200 OK` response to a callback.
pub fn acknowledgement() -> Response {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "application/json")],
        CALLBACK_ACKNOWLEDGEMENT,
    )
        .into_response()
}

/// Settle queued callback bodies until every [CallbackQueue] sender has been
/// dropped, then wait for the settlements still running.
///
/// Each body is settled on its own blocking task so one slow database write
/// does not hold up the rest. At most `max_in_flight` bodies are taken off the
/// queue at once, so a backlog fills the queue and the overflow is stored for
/// replay instead of piling up in memory.
pub async fn run_callback_worker(
    mut receiver: mpsc::Receiver<Bytes>,
    settlement: Arc<Settlement>,
    max_in_flight: usize,
) {
    let max_in_flight = max_in_flight.max(1);
    let permits = Arc::new(Semaphore::new(max_in_flight));
    tracing::info!(max_in_flight, "Callback worker started");

    loop {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let Some(body) = receiver.recv().await else {
            break;
        };
        let settlement = settlement.clone();

        tokio::task::spawn_blocking(move || {
            let _permit = permit;

            if let Err(error) = settlement.apply_callback(&body) {
                tracing::error!(
                    body = %String::from_utf8_lossy(&body),
                    "Could not settle callback: {error}"
                );
            }
        });
    }

    let all_permits = u32::try_from(max_in_flight).unwrap_or(u32::MAX);
    if permits.acquire_many(all_permits).await.is_err() {
        tracing::error!("Could not wait for callbacks still being settled");
    }

    tracing::info!("Callback worker stopped");
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex, mpsc as std_mpsc},
        thread,
    };

    use axum::{Router, body::Bytes, http::StatusCode, routing::post};
    use axum_test::TestServer;
    use rusqlite::Connection;
    use serde_json::{Value, json};

    use crate::{
        db::initialize,
        endpoints,
        ledger::count_entries,
        reconciliation::{ReconciliationKind, count_items, get_unresolved},
        settlement::{ReplayPayload, test_utils::settlement_fixture},
    };

    use super::{CALLBACK_ACKNOWLEDGEMENT, CallbackQueue, callback_endpoint, run_callback_worker};

    fn valid_callback() -> Value {
        json!({
            "Body": {
                "stkCallback": {
                    "MerchantRequestID": "29115-34620561-1",
                    "CheckoutRequestID": "ws_CO_1",
                    "ResultCode": 0,
                    "ResultDesc": "The service request is processed successfully.",
                    "CallbackMetadata": {
                        "Item": [
                            {"Name": "Amount", "Value": 500},
                            {"Name": "MpesaReceiptNumber", "Value": "ABC123"},
                            {"Name": "PhoneNumber", "Value": 254712345678u64}
                        ]
                    }
                }
            }
        })
    }

    #[tokio::test]
    async fn acknowledges_every_body() {
        let fixture = settlement_fixture();
        let (queue, _receiver) = CallbackQueue::new(16, fixture.connection.clone());
        let app = Router::new()
            .route(endpoints::CALLBACK, post(callback_endpoint))
            .with_state(queue);
        let server = TestServer::try_new(app).expect("Could not create test server.");

        let bodies = [
            Bytes::from_static(b""),
            Bytes::from_static(b"<xml>nope</xml>"),
            Bytes::from_static(b"{\"Body\":{}}"),
            Bytes::from(valid_callback().to_string()),
        ];

        for body in bodies {
            let response = server.post(endpoints::CALLBACK).bytes(body).await;

            response.assert_status(StatusCode::OK);
            assert_eq!(response.text(), CALLBACK_ACKNOWLEDGEMENT);
        }
    }

    #[tokio::test]
    async fn full_queue_stores_body_for_replay() {
        let fixture = settlement_fixture();
        let (queue, _receiver) = CallbackQueue::new(1, fixture.connection.clone());
        let body: &[u8] = b"{\"Body\": \xff\xfe}";

        assert!(queue.submit(Bytes::from_static(b"first")));
        assert!(!queue.submit(Bytes::from_static(body)));

        let connection = fixture.connection.lock().unwrap();
        assert_eq!(
            count_items(ReconciliationKind::ProcessingFailed, &connection),
            Ok(1)
        );
        let items = get_unresolved(&connection).unwrap();
        let payload: ReplayPayload =
            serde_json::from_str(items[0].payload.as_deref().unwrap()).unwrap();
        assert_eq!(
            payload,
            ReplayPayload::Callback {
                body: body.to_vec()
            }
        );
    }

    #[tokio::test]
    async fn worker_settles_queued_callbacks() {
        let fixture = settlement_fixture();
        let (queue, receiver) = CallbackQueue::new(16, fixture.connection.clone());
        let worker = tokio::spawn(run_callback_worker(receiver, fixture.settlement.clone(), 4));

        for _ in 0..3 {
            assert!(queue.submit(Bytes::from(valid_callback().to_string())));
        }
        drop(queue);
        worker.await.unwrap();

        let connection = fixture.connection.lock().unwrap();
        assert_eq!(count_entries(&connection), Ok(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn busy_worker_sends_backlog_to_replay() {
        let fixture = settlement_fixture();
        let replay_connection = Connection::open_in_memory().unwrap();
        initialize(&replay_connection).unwrap();
        let replay_connection = Arc::new(Mutex::new(replay_connection));
        let (queue, receiver) = CallbackQueue::new(1, replay_connection.clone());
        let worker = tokio::spawn(run_callback_worker(receiver, fixture.settlement.clone(), 1));

        // Hold the ledger database so no settlement can finish.
        let connection = fixture.connection.clone();
        let (locked_tx, locked_rx) = std_mpsc::channel();
        let (release_tx, release_rx) = std_mpsc::channel::<()>();
        let holder = thread::spawn(move || {
            let _guard = connection.lock().unwrap();
            locked_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });
        locked_rx.recv().unwrap();

        let submitted = 50;
        let mut stored_for_replay = 0;
        for _ in 0..submitted {
            if !queue.submit(Bytes::from(valid_callback().to_string())) {
                stored_for_replay += 1;
            }
            tokio::task::yield_now().await;
        }

        // At most one body in flight and one waiting in the queue.
        assert!(
            stored_for_replay >= submitted - 2,
            "only {stored_for_replay} of {submitted} callbacks were stored for replay"
        );
        assert_eq!(
            count_items(
                ReconciliationKind::ProcessingFailed,
                &replay_connection.lock().unwrap()
            ),
            Ok(stored_for_replay)
        );

        release_tx.send(()).unwrap();
        holder.join().unwrap();
        drop(queue);
        worker.await.unwrap();

        let connection = fixture.connection.lock().unwrap();
        assert_eq!(count_entries(&connection), Ok(1));
    }
}
