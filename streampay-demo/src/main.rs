//! In-process streaming payment demonstration.
//!
//! Boots a provider whose premium route sits behind the stream gate, then
//! drives it with a consumer whose HTTP client negotiates payment
//! automatically: the first request hits 402, funds a stream, and retries;
//! every later request rides the same stream. Afterwards the clock is
//! advanced so the provider can withdraw accrued value, the stream is
//! cancelled, and the final balances are reported.
//!
//! # Usage
//!
//! ```bash
//! RUST_LOG=info cargo run -p streampay-demo -- --requests 5
//! ```

use std::error::Error;
use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use streampay::amount;
use streampay::{InMemoryVault, ManualClock, StreamLedger};
use streampay_http::client::{LedgerFunder, ReqwestWithStreaming, StreamClient};
use streampay_http::server::{LedgerValidator, RouteTerms, StreamGate};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

const AGENT: &str = "0xDemoAgent";
const PROVIDER: &str = "0xDemoProvider";
const LEDGER_CONTRACT: &str = "streampay-ledger";
const ASSET_DECIMALS: u8 = 18;

#[derive(Debug, Parser)]
#[command(
    name = "streampay-demo",
    about = "Provider/consumer demo for automatic streaming payments"
)]
struct Args {
    /// Requests to issue against the gated route.
    #[arg(long, default_value_t = 5)]
    requests: u32,

    /// Price per second of access, in whole tokens.
    #[arg(long, default_value = "0.0001")]
    rate: String,

    /// Seconds of access each negotiated stream funds.
    #[arg(long, default_value_t = 3_600)]
    funding_duration: u64,

    /// Seconds of accrual to simulate before settling.
    #[arg(long, default_value_t = 120)]
    accrue: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run(Args::parse()).await {
        tracing::error!("Demo failed: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    // Shared settlement state: vault, simulated clock, ledger.
    let vault = Arc::new(InMemoryVault::new());
    let clock = ManualClock::starting_at(1_700_000_000);
    let ledger = Arc::new(StreamLedger::new(Arc::clone(&vault), clock.clone()));

    let deposit = amount::base_units("1", ASSET_DECIMALS)?;
    vault.mint(AGENT, deposit);
    vault.approve(AGENT, deposit);

    // Provider: premium content behind the stream gate.
    let gate = StreamGate::new(Arc::new(LedgerValidator::new(Arc::clone(&ledger))));
    let app = Router::new()
        .route(
            "/api/premium",
            get(premium).layer(gate.route(
                RouteTerms::new(args.rate.clone(), PROVIDER, LEDGER_CONTRACT)
                    .with_decimals(ASSET_DECIMALS),
            )),
        )
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Provider server failed: {e}");
        }
    });
    tracing::info!(%addr, "Provider listening");

    // Consumer: a plain reqwest client with the negotiator attached.
    let negotiator = Arc::new(
        StreamClient::new(LedgerFunder::new(Arc::clone(&ledger), AGENT.to_owned()))
            .with_funding_duration(args.funding_duration)
            .with_metadata("demo consumer")
            .with_spending_limit(deposit),
    );
    let client = reqwest::Client::new()
        .with_streaming(Arc::clone(&negotiator))
        .build();

    let url = format!("http://{addr}/api/premium");
    for i in 1..=args.requests {
        let response = client.get(&url).send().await?;
        tracing::info!(request = i, status = %response.status(), "Premium request served");
    }

    let metrics = negotiator.metrics();
    tracing::info!(
        requests_sent = metrics.requests_sent,
        signers_triggered = metrics.signers_triggered,
        served_by_reuse = metrics.requests_sent - metrics.signers_triggered,
        "Efficiency report"
    );

    // Let some access time accrue, then settle both sides.
    clock.advance(args.accrue);
    for id in ledger.streams_for(AGENT) {
        let withdrawn = ledger.withdraw(id, PROVIDER).await?;
        let settled = ledger.cancel(id, AGENT).await?;
        tracing::info!(
            stream = %id,
            withdrawn,
            refunded = settled.sender_refund,
            "Stream settled"
        );
    }
    tracing::info!(
        provider_balance = vault.balance_of(PROVIDER),
        agent_balance = vault.balance_of(AGENT),
        escrowed = vault.escrowed(),
        "Final balances"
    );

    Ok(())
}

async fn premium() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "data": "premium content delivered via streaming payment"
    }))
}
