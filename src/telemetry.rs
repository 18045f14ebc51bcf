use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter applied when RUST_LOG is not set: the control plane logs at info,
/// HTTP client internals and the mailer stay at warn. Individual subsystems
/// can be raised selectively, e.g. RUST_LOG=powerctl::plan=debug to watch
/// slot selection or RUST_LOG=powerctl::device=debug to trace relay RPCs.
const DEFAULT_DIRECTIVES: &[&str] = &[
    "info",
    "powerctl=info",
    "hyper=warn",
    "reqwest=warn",
    "lettre=warn",
];

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        DEFAULT_DIRECTIVES
            .iter()
            .fold(EnvFilter::default(), |filter, directive| {
                filter.add_directive(directive.parse().expect("static directive parses"))
            })
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

/// Resolves when the operator asks the daemon to stop. Both SIGINT and
/// SIGTERM are honoured so a ^C and a service manager stop behave the same;
/// the signal that fired is logged for the post-mortem trail.
#[cfg(unix)]
pub async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt()).expect("SIGINT handler");
    let mut terminate = signal(SignalKind::terminate()).expect("SIGTERM handler");
    let which = tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
    };
    info!(signal = which, "shutdown requested");
}

#[cfg(not(unix))]
pub async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}
