//! Integration with Safaricom's M-Pesa (Daraja) API.

mod client;
mod credentials;
mod errors;
mod provider;
pub(crate) mod types;

pub use client::{MpesaClient, MpesaConfig, SANDBOX_BASE_URL};
pub use credentials::StkCredential;
pub use errors::ProviderError;
pub use provider::{PaymentDetails, PaymentProvider, ProviderOutcome, PushAccepted, PushRequest};
pub use types::AccountBalanceResponse;

#[cfg(test)]
pub(crate) use client::test_utils;
#[cfg(test)]
pub(crate) mod fake;
