//! ReconBot - Three-Way Match Reconciliation Engine
//!
//! CLI runner: loads three parsed documents from JSON files, runs one
//! reconciliation session against the configured provider chain (the
//! deterministic fallback alone when no provider is configured), streams
//! progress events to stdout and prints the frozen session record.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use reconbot_backend::agents::PipelineDeps;
use reconbot_backend::bus::ProgressBus;
use reconbot_backend::cancel::CancelToken;
use reconbot_backend::config::Config;
use reconbot_backend::models::Document;
use reconbot_backend::stores::{
    InMemoryDivergenceSink, InMemoryDocumentStore, InMemoryFeedbackStore, InMemoryInvoiceHistory,
    InMemoryVectorStore,
};
use reconbot_backend::supervisor::Pipeline;
use reconbot_backend::threshold::AdaptiveThresholdStore;

#[derive(Debug, Parser)]
#[command(name = "reconbot", about = "Three-way match reconciliation runner")]
struct Args {
    /// Parsed purchase order JSON
    #[arg(long)]
    po: PathBuf,

    /// Parsed goods receipt note JSON
    #[arg(long)]
    grn: PathBuf,

    /// Parsed supplier invoice JSON
    #[arg(long)]
    invoice: PathBuf,

    #[arg(long, default_value = "default")]
    tenant: String,

    /// Session id; random when omitted
    #[arg(long)]
    session: Option<String>,
}

fn load_document(path: &PathBuf) -> Result<Document> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "reconbot_backend=info,reconbot=info".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;
    info!(
        providers = config.providers.len(),
        "🔍 ReconBot starting (deterministic fallback always last in chain)"
    );

    let documents = Arc::new(InMemoryDocumentStore::new());
    let po = load_document(&args.po)?;
    let grn = load_document(&args.grn)?;
    let invoice = load_document(&args.invoice)?;
    let (po_id, grn_id, invoice_id) = (
        po.document_id.clone(),
        grn.document_id.clone(),
        invoice.document_id.clone(),
    );
    documents.insert(po);
    documents.insert(grn);
    documents.insert(invoice);

    let feedback = Arc::new(InMemoryFeedbackStore::new());
    let bus = Arc::new(ProgressBus::new());
    let keepalive = bus.spawn_keepalive();

    let deps = PipelineDeps {
        router: Arc::new(config.build_router()?),
        bus: Arc::clone(&bus),
        documents: documents.clone(),
        vectors: Arc::new(InMemoryVectorStore::new(documents.clone())),
        thresholds: Arc::new(AdaptiveThresholdStore::new(feedback)),
        invoice_history: Arc::new(InMemoryInvoiceHistory::new()),
        divergence_sink: Arc::new(InMemoryDivergenceSink::new()),
    };
    let pipeline = Pipeline::new(deps, config.supervisor_config());

    let session_id = args
        .session
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let cancel = CancelToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("cancellation requested");
            ctrl_c_cancel.cancel();
        }
    });

    let mut subscription = pipeline.subscribe(&session_id);
    let printer = tokio::spawn(async move {
        while let Some(envelope) = subscription.recv().await {
            match serde_json::to_string(&envelope) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "event not serializable"),
            }
        }
    });

    let record = pipeline
        .run(&session_id, &args.tenant, &po_id, &grn_id, &invoice_id, cancel)
        .await;

    let _ = printer.await;
    keepalive.abort();

    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}
