use std::{
    env,
    fs::OpenOptions,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    Router,
    extract::{MatchedPath, Request},
};
use axum_server::Handle;
use clap::Parser;
use rusqlite::Connection;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{Layer, filter, layer::SubscriberExt, util::SubscriberInitExt};

use mpesa_ledger::{
    AppState, CallbackQueue, EventBus, LedgerWriter, MpesaClient, MpesaConfig, PROVIDER_TIMEZONE,
    PollerConfig, RateLimiter, Settlement, SqliteAccountDirectory, SqliteCategoryScopeResolver,
    StatusPoller, build_router, get_local_offset, graceful_shutdown, run_callback_worker,
};

/// The REST API server for M-Pesa payments and the payment ledger.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// File path to the application SQLite database.
    #[arg(long)]
    db_path: String,

    /// The port to serve the API from.
    #[arg(short, long, default_value_t = 3000)]
    port: u16,

    /// The provider's canonical timezone, used for request and callback
    /// timestamps.
    #[arg(long, default_value = PROVIDER_TIMEZONE)]
    timezone: String,

    /// The provider API base URL.
    #[arg(long, default_value = mpesa_ledger::SANDBOX_BASE_URL)]
    mpesa_base_url: String,

    /// The business short code payments are made to.
    #[arg(long, default_value = "174379")]
    short_code: String,

    /// The public URL the provider posts payment results to.
    #[arg(long)]
    callback_url: String,

    /// The public URL the provider posts account balance results to.
    #[arg(long, default_value = "")]
    balance_result_url: String,

    /// How many seconds to wait for a callback before polling.
    #[arg(long, default_value_t = 60)]
    callback_timeout_secs: u64,

    /// Seconds between polling cycles.
    #[arg(long, default_value_t = 30)]
    poll_interval_secs: u64,

    /// Status queries per request before it times out.
    #[arg(long, default_value_t = 10)]
    max_poll_attempts: u32,

    /// Payment requests a phone number may make per minute.
    #[arg(long, default_value_t = 3)]
    requests_per_minute: usize,

    /// The number of callbacks that may wait for the settlement worker.
    #[arg(long, default_value_t = 1024)]
    callback_queue_capacity: usize,

    /// The number of callbacks that may be settled at the same time.
    #[arg(long, default_value_t = 8)]
    max_concurrent_callbacks: usize,
}

#[tokio::main]
async fn main() {
    setup_logging();

    let args = Args::parse();

    let addr = SocketAddr::from(([127, 0, 0, 1], args.port));

    let provider_offset = get_local_offset(&args.timezone)
        .unwrap_or_else(|| panic!("{} is not a valid timezone", args.timezone));

    let config = MpesaConfig {
        base_url: args.mpesa_base_url.clone(),
        consumer_key: required_env("MPESA_CONSUMER_KEY"),
        consumer_secret: required_env("MPESA_CONSUMER_SECRET"),
        short_code: args.short_code.clone(),
        passkey: required_env("MPESA_PASSKEY"),
        callback_url: args.callback_url.clone(),
        security_credential: env::var("MPESA_SECURITY_CREDENTIAL").unwrap_or_default(),
        balance_result_url: args.balance_result_url.clone(),
        balance_timeout_url: args.balance_result_url.clone(),
        ..Default::default()
    };
    let provider =
        Arc::new(MpesaClient::new(config, provider_offset).expect("Could not create HTTP client"));

    let conn = Connection::open(&args.db_path).expect("Could not open database");
    let conn = Arc::new(Mutex::new(conn));

    let rate_limiter = Arc::new(RateLimiter::new(
        args.requests_per_minute,
        Duration::from_secs(60),
    ));
    let (callback_queue, callback_receiver) =
        CallbackQueue::new(args.callback_queue_capacity, conn.clone());

    let state = AppState::new(
        conn.clone(),
        provider.clone(),
        callback_queue,
        rate_limiter.clone(),
    )
    .expect("Could not initialize the database");

    let ledger = LedgerWriter::new(
        conn.clone(),
        Arc::new(SqliteAccountDirectory::new(conn.clone())),
        Arc::new(SqliteCategoryScopeResolver::new(conn.clone())),
        EventBus::default(),
    );
    let settlement = Arc::new(Settlement::new(conn.clone(), ledger, provider_offset));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = StatusPoller::new(
        conn.clone(),
        provider,
        settlement.clone(),
        PollerConfig {
            callback_timeout: Duration::from_secs(args.callback_timeout_secs),
            poll_interval: Duration::from_secs(args.poll_interval_secs),
            max_attempts: args.max_poll_attempts,
            ..Default::default()
        },
    )
    .with_rate_limiter(rate_limiter);
    let poller_task = tokio::spawn(poller.run(shutdown_rx));
    let worker_task = tokio::spawn(run_callback_worker(
        callback_receiver,
        settlement,
        args.max_concurrent_callbacks,
    ));

    let handle = Handle::new();
    tokio::spawn(graceful_shutdown(handle.clone()));

    let router = add_tracing_layer(build_router(state));

    tracing::info!("HTTP server listening on {}", addr);
    axum_server::bind(addr)
        .handle(handle)
        .serve(router.into_make_service())
        .await
        .expect("Server error");

    // The worker ends once the router, and with it the callback queue, is dropped.
    let _ = shutdown_tx.send(true);
    if let Err(error) = poller_task.await {
        tracing::error!("Status poller task failed: {error}");
    }
    match tokio::time::timeout(Duration::from_secs(5), worker_task).await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => tracing::error!("Callback worker task failed: {error}"),
        Err(_) => tracing::warn!("Callback worker did not stop in time"),
    }
}

fn required_env(name: &str) -> String {
    env::var(name).unwrap_or_else(|_| panic!("The environment variable '{name}' must be set"))
}

fn setup_logging() {
    let stdout_log = tracing_subscriber::fmt::layer().pretty();

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open("debug.log")
        .expect("Could not create log file");

    let debug_log = tracing_subscriber::fmt::layer()
        .pretty()
        .with_writer(Arc::new(log_file));

    tracing_subscriber::registry()
        .with(
            stdout_log
                .with_filter(filter::LevelFilter::INFO)
                .and_then(debug_log)
                .with_filter(filter::LevelFilter::DEBUG),
        )
        .init();
}

fn add_tracing_layer(router: Router) -> Router {
    let tracing_layer = TraceLayer::new_for_http()
        .make_span_with(|req: &Request| {
            let method = req.method();
            let uri = req.uri();

            let matched_path = req
                .extensions()
                .get::<MatchedPath>()
                .map(|matched_path| matched_path.as_str());

            tracing::debug_span!("request", %method, %uri, matched_path)
        })
        // By default, `TraceLayer` will log 5xx responses but we're doing our specific
        // logging of errors so disable that
        .on_failure(());

    router.layer(tracing_layer)
}
