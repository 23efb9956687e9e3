//! Receiving the provider's asynchronous STK push results.

mod endpoint;
mod payload;

pub use endpoint::{
    CALLBACK_ACKNOWLEDGEMENT, CallbackQueue, acknowledgement, callback_endpoint,
    run_callback_worker,
};
pub use payload::parse_callback;
