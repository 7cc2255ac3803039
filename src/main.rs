//! wirespan agent entry point.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use wirespan::cli::Args;
use wirespan::driver::Driver;
use wirespan::handlers::{run_emitter, JsonLinesHandler};
use wirespan_core::io::CaptureSource;
use wirespan_core::stream::{Assembler, HttpStreamFactory};
use wirespan_core::{EventQueue, Stats};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries events only.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| args.log_filter().into()))
        .init();

    args.validate()?;
    info!(
        version = wirespan::VERSION,
        interface = %args.interface,
        source = args.packet_source.as_str(),
        read_file = ?args.read_file,
        "starting wirespan"
    );

    let source_config = args.source_config();
    let source = CaptureSource::open(&source_config).with_context(|| {
        format!(
            "failed to open {} capture on {}",
            source_config.kind.as_str(),
            source_config.interface
        )
    })?;
    let offline = source.is_offline();
    info!(backend = source.describe(), filter = %source_config.filter_text(), "capture source open");

    let stats = Arc::new(Stats::new());
    let queue = Arc::new(EventQueue::new(args.channel_buffer_size, Arc::clone(&stats)));
    let factory = HttpStreamFactory::new(
        tokio::runtime::Handle::current(),
        Arc::clone(&queue),
        Arc::clone(&stats),
        Arc::new(args.http_config()),
        args.channel_buffer_size,
    );
    let tracker = factory.tracker();
    let assembler = Assembler::new(args.assembler_config(), factory, Arc::clone(&stats));
    let driver = Driver::new(
        source,
        offline,
        assembler,
        args.driver_config(),
        Arc::clone(&stats),
        Arc::clone(&queue),
    );

    let emitter = tokio::spawn(run_emitter(
        Arc::clone(&queue),
        JsonLinesHandler::stdout(),
        args.record_options(),
    ));

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let driver_cancel = cancel.clone();
    let outcome = tokio::task::spawn_blocking(move || driver.run(driver_cancel))
        .await
        .context("capture thread panicked")?;

    // Every flow is closed by now; give the parser tasks a bounded window
    // to drain before the queue stops accepting exchanges.
    tracker.close();
    if tokio::time::timeout(args.stream_flush_timeout, tracker.wait())
        .await
        .is_err()
    {
        warn!(
            pending = tracker.len(),
            "stream tasks still running after the flush timeout"
        );
    }
    queue.close();
    let emitted = emitter.await.context("event emitter panicked")?;

    let summary = outcome.context("capture failed")?;
    info!(
        packets = summary.packets,
        flows_closed = summary.flows_closed,
        events = emitted,
        reason = ?summary.reason,
        "wirespan stopped"
    );
    Ok(())
}

/// Cancel on SIGINT, or SIGTERM on Unix.
async fn cancel_on_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install sigterm handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
    cancel.cancel();
}
