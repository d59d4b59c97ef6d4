use std::process::ExitCode;

use serde::Serialize;

use danci_core::config::AppConfig;
use danci_core::facade::ExportDocument;
use danci_core::learning::interleave_session_words;
use danci_core::logging::init_tracing;
use danci_core::storage::StorageResult;
use danci_core::AppContext;

const USAGE: &str = "usage: danci-core [health | analytics | export [FILE] | import FILE | session LANG | run]";

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::FAILURE;
        }
    };
    let _log_guard = init_tracing(&config.log_level);

    let ctx = match AppContext::new(config) {
        Ok(ctx) => ctx,
        Err(err) => {
            tracing::error!(error = %err, "failed to build application context");
            return ExitCode::FAILURE;
        }
    };

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("health");
    let ok = match command {
        "health" => print_result(ctx.health().await),
        "analytics" => print_result(ctx.facade.get_storage_analytics().await),
        "export" => export(&ctx, args.get(1).map(String::as_str)).await,
        "import" => match args.get(1) {
            Some(path) => import(&ctx, path).await,
            None => usage(),
        },
        "session" => match args.get(1) {
            Some(language) => session(&ctx, language).await,
            None => usage(),
        },
        "run" => {
            run(&ctx).await;
            true
        }
        _ => usage(),
    };

    let report = ctx.shutdown().await;
    if report.failed > 0 {
        tracing::warn!(failed = report.failed, "some changes were not saved");
    }
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn usage() -> bool {
    eprintln!("{USAGE}");
    false
}

fn print_json<T: Serialize>(value: &T) -> bool {
    match serde_json::to_string_pretty(value) {
        Ok(text) => {
            println!("{text}");
            true
        }
        Err(err) => {
            tracing::error!(error = %err, "failed to render output");
            false
        }
    }
}

fn print_result<T: Serialize>(result: StorageResult<T>) -> bool {
    let ok = result.success;
    if !ok {
        tracing::error!(error = ?result.error, "command failed");
    }
    print_json(&result) && ok
}

async fn export(ctx: &AppContext, path: Option<&str>) -> bool {
    let result = ctx.export_data().await;
    let Some(path) = path else {
        return print_result(result);
    };
    let document = match result.into_result() {
        Ok(Some(document)) => document,
        Ok(None) => return false,
        Err(err) => {
            tracing::error!(error = %err, "export failed");
            return false;
        }
    };
    let text = match serde_json::to_vec_pretty(&document) {
        Ok(text) => text,
        Err(err) => {
            tracing::error!(error = %err, "failed to serialize export");
            return false;
        }
    };
    match tokio::fs::write(path, text).await {
        Ok(()) => {
            tracing::info!(path = %path, languages = document.metadata.total_languages, "export written");
            true
        }
        Err(err) => {
            tracing::error!(path = %path, error = %err, "failed to write export");
            false
        }
    }
}

async fn import(ctx: &AppContext, path: &str) -> bool {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(err) => {
            tracing::error!(path = %path, error = %err, "failed to read import file");
            return false;
        }
    };
    let document: ExportDocument = match serde_json::from_slice(&raw) {
        Ok(document) => document,
        Err(err) => {
            tracing::error!(path = %path, error = %err, "import file is not an export document");
            return false;
        }
    };
    print_result(ctx.import_data(&document).await)
}

async fn session(ctx: &AppContext, language: &str) -> bool {
    let words = match ctx.language_data.get_or_load(language).await {
        Ok(words) => words,
        Err(err) => {
            tracing::error!(language = %language, error = %err, "word list unavailable");
            return false;
        }
    };
    let session = match ctx
        .scheduler
        .plan_session(language, &words, ctx.clock.now())
        .await
        .into_result()
    {
        Ok(Some(session)) => session,
        Ok(None) => return false,
        Err(err) => {
            tracing::error!(language = %language, error = %err, "could not plan session");
            return false;
        }
    };
    let order = interleave_session_words(&session, &mut rand::rng());
    print_json(&serde_json::json!({ "session": session, "order": order }))
}

/// Keeps the background tasks alive until Ctrl+C or SIGTERM.
async fn run(ctx: &AppContext) {
    ctx.start();
    tracing::info!("danci-core running, press Ctrl+C to stop");
    shutdown_signal().await;
    tracing::info!("shutdown requested");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for Ctrl+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
