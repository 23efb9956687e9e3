//! Implements a struct that holds the state of the REST server.

use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use crate::{
    CallbackQueue, Error, PaymentProvider, RateLimiter, db::initialize,
    payment::PaymentInitiator,
};

/// The state of the REST server.
#[derive(Clone)]
pub struct AppState {
    /// The database connection.
    pub db_connection: Arc<Mutex<Connection>>,

    /// The payment provider used to send and query payments.
    pub provider: Arc<dyn PaymentProvider>,

    /// Sends STK push requests.
    pub initiator: PaymentInitiator,

    /// Hands received callbacks to the settlement worker.
    pub callback_queue: CallbackQueue,

    /// Limits how often a phone number can be prompted to pay.
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    /// Create a new [AppState] from a shared SQLite database connection.
    ///
    /// This function will initialize the database by adding the tables for the domain models.
    ///
    /// # Errors
    /// Returns an error if the database cannot be initialized.
    pub fn new(
        db_connection: Arc<Mutex<Connection>>,
        provider: Arc<dyn PaymentProvider>,
        callback_queue: CallbackQueue,
        rate_limiter: Arc<RateLimiter>,
    ) -> Result<Self, Error> {
        {
            let connection = db_connection
                .lock()
                .map_err(|_| Error::DatabaseLockError)?;
            initialize(&connection)?;
        }

        let initiator =
            PaymentInitiator::new(db_connection.clone(), provider.clone(), rate_limiter.clone());

        Ok(Self {
            db_connection,
            provider,
            initiator,
            callback_queue,
            rate_limiter,
        })
    }
}
