use std::process;

use featuretag::{
    application::{context::AppContext, error::AppError},
    config,
    infra::{db, telemetry},
    listener,
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Cleanup(_) => run_cleanup(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let context = AppContext::build(&settings).await?;

    if !settings.listener.enabled {
        info!(
            target = "featuretag::serve",
            "Change listener disabled; cached etags follow reads only"
        );
        shutdown_signal().await;
        return Ok(());
    }

    let mut change_listener = context.change_listener();
    change_listener
        .initialize(&settings.catalog.filter())
        .await?;

    let outcome = tokio::select! {
        _ = shutdown_signal() => Ok(()),
        result = change_listener.run_until_stopped() => result,
    };

    change_listener.close().await;
    info!(
        target = "featuretag::serve",
        cached_etags = context.cache.size().await,
        "Stopped"
    );

    outcome.map_err(AppError::from)
}

async fn run_cleanup(settings: config::Settings) -> Result<(), AppError> {
    let pool = db::connect(&settings.database).await?;
    let dropped = listener::remove_leftovers(&pool, &settings.listener.temp_schema).await?;
    info!(
        target = "featuretag::cleanup",
        triggers = dropped,
        schema = %settings.listener.temp_schema,
        "Removed notification objects"
    );
    pool.close().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
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
    info!(target = "featuretag::serve", "shutdown signal received");
}
