use clap::Parser;
use colored::*;
use futures_util::FutureExt;
use oneline::constants::ENV_CONFIG_MARKER;
use oneline::logging::{init_tracing, setup_panic_hook};
use oneline::main_helper::{build_http_client, ClientConfig, EnvConfig};
use oneline::relay::RelayChunk;
use oneline::server::router;
use oneline::*;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn print_event(event: &TimelineEvent) {
    println!("{}  {}", event.date.bold().cyan(), event.title.bold());
    if !event.description.is_empty() {
        println!("    {}", event.description);
    }
    for person in &event.people {
        println!("    {} ({})", person.name.green(), person.role);
    }
    match &event.source_url {
        Some(url) => println!("    {} {}", event.source.dimmed(), url.underline()),
        None => println!("    {}", event.source.dimmed()),
    }
    println!();
}

/// One timeline for `query` against the server-side configuration.
async fn run_query(state: Arc<AppState>, query: &str, stream: bool) -> std::process::ExitCode {
    let client = ClientConfig {
        api_key: Some(ENV_CONFIG_MARKER.to_string()),
        ..Default::default()
    };
    let config = match state.resolve(&client) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e.inner);
            return std::process::ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let outcome = if stream {
        state
            .orchestrator
            .stream_timeline(&config, query, &cancel, |chunk| match chunk {
                RelayChunk::Progress { message, .. } => eprintln!("{}", message.dimmed()),
                RelayChunk::Summary { summary } => println!("{}\n", summary.italic()),
                RelayChunk::Event { event } => print_event(&event),
                _ => {}
            })
            .await
            .map(|_| ())
    } else {
        state
            .orchestrator
            .fetch_timeline(&config, query, &cancel)
            .await
            .map(|result| {
                println!("{}\n", result.summary.italic());
                result.events.iter().for_each(print_event);
            })
    };

    match outcome {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(report) => {
            eprintln!("{} {}", "error:".red().bold(), report.message);
            std::process::ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let _guard = init_tracing(&args.log_dir);
    setup_panic_hook();

    let env = EnvConfig::from_env();
    env.log_summary();

    let client = match build_http_client(&args) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to build HTTP client: {}", e.inner);
            return std::process::ExitCode::FAILURE;
        }
    };

    let query = args.query.clone();
    let stream = args.stream;
    let state = Arc::new(AppState::new(args, client, env));

    if let Some(query) = query {
        return run_query(state, &query, stream).await;
    }

    let addr = format!("{}:{}", state.args.host, state.args.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            return std::process::ExitCode::FAILURE;
        }
    };

    tracing::info!("oneline listening on {}", addr);
    let app = router(state);
    let server = async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("Shutting down");
            })
            .await
    };

    match std::panic::AssertUnwindSafe(server).catch_unwind().await {
        Ok(Ok(())) => std::process::ExitCode::SUCCESS,
        Ok(Err(e)) => {
            tracing::error!("Server error: {}", e);
            std::process::ExitCode::FAILURE
        }
        Err(panic_payload) => {
            let message = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                *s
            } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                s.as_str()
            } else {
                "Unknown panic"
            };
            tracing::error!(target: "panic", "CRITICAL: Server task panicked: {}", message);
            std::process::ExitCode::FAILURE
        }
    }
}
