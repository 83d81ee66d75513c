mod cli;
mod error;

use std::time::Duration;

use clap::Parser;
use tcpee_proxy::{KeepAlive, ProxyError, ProxyOptions, TcpProxy};
use tcpee_settings::{Config, DurationKnob, InstanceSettings};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use cli::Cli;
use error::CliError;

/// How long a signal-triggered drain may take before the process exits hard.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    // Usage problems exit 1, not clap's default 2. Help and version output
    // are not errors.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() { 1 } else { 0 };
            let _ = err.print();
            std::process::exit(code);
        }
    };
    setup_tracing(cli.verbose);

    if let Err(err) = run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = Config::load(&cli.config)?;
    if config.instances.is_empty() {
        warn!(config = %cli.config.display(), "no proxy instances configured");
    }

    // Route tasks report non-sentinel failures here; the channel closing
    // with no report means every route ended through close().
    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<(String, ProxyError)>();
    let mut proxies: Vec<TcpProxy> = Vec::new();

    for (name, settings) in &config.instances {
        let opts = build_options(settings)?;
        let routes = settings.routes()?;
        let proxy = TcpProxy::new(name.clone(), opts)?;
        info!(proxy = %name, routes = routes.len(), "starting proxy");

        for route in routes {
            let runner = proxy.clone();
            let fatal_tx = fatal_tx.clone();
            tokio::spawn(async move {
                if let Err(err) = runner.run(&route.src, &route.dst).await {
                    if !err.is_closed() {
                        let _ = fatal_tx.send((runner.name().to_string(), err));
                    }
                }
            });
        }
        proxies.push(proxy);
    }
    drop(fatal_tx);

    enum Exit {
        Signal(&'static str),
        Fatal(String, ProxyError),
    }

    let exit = tokio::select! {
        _ = tokio::signal::ctrl_c() => Exit::Signal("SIGINT"),
        _ = terminate_signal() => Exit::Signal("SIGTERM"),
        Some((name, err)) = fatal_rx.recv() => Exit::Fatal(name, err),
    };

    match exit {
        Exit::Signal(signal) => {
            info!(signal, "signal received, closing proxies");
            match tokio::time::timeout(SHUTDOWN_GRACE, close_all(&proxies)).await {
                Ok(()) => Ok(()),
                Err(_) => {
                    error!(grace = ?SHUTDOWN_GRACE, "proxies still running, forcing exit");
                    std::process::exit(1);
                }
            }
        }
        Exit::Fatal(name, err) => {
            error!(proxy = %name, error = %err, "proxy failed");
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, close_all(&proxies)).await;
            Err(CliError::Proxy(err))
        }
    }
}

/// Close every instance concurrently and wait for all drains.
async fn close_all(proxies: &[TcpProxy]) {
    let handles: Vec<_> = proxies
        .iter()
        .map(|proxy| {
            let proxy = proxy.clone();
            tokio::spawn(async move { proxy.close().await })
        })
        .collect();
    for handle in handles {
        let _ = handle.await;
    }
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sig) => {
            sig.recv().await;
        }
        Err(_) => std::future::pending().await,
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await
}

fn build_options(settings: &InstanceSettings) -> Result<ProxyOptions, CliError> {
    let knobs = settings.knobs()?;
    Ok(ProxyOptions {
        proxy_proto: settings.proxy_proto,
        transparent: settings.transparent,
        dial_timeout: timeout_from(knobs.dial_timeout),
        client_idle_timeout: timeout_from(knobs.client_timeout),
        server_idle_timeout: timeout_from(knobs.server_timeout),
        client_keep_alive: keepalive_from(knobs.client_keepalive),
        server_keep_alive: keepalive_from(knobs.server_keepalive),
        ..Default::default()
    })
}

/// Idle and dial budgets: a disabled or defaulted knob means "no deadline".
fn timeout_from(knob: DurationKnob) -> Duration {
    match knob {
        DurationKnob::Value(value) => value,
        DurationKnob::Default | DurationKnob::Disabled => Duration::ZERO,
    }
}

fn keepalive_from(knob: DurationKnob) -> KeepAlive {
    match knob {
        DurationKnob::Default => KeepAlive::Default,
        DurationKnob::Disabled => KeepAlive::Disabled,
        DurationKnob::Value(period) => KeepAlive::Period(period),
    }
}

fn setup_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let filter = std::env::var("TCPEE_LOG").unwrap_or_else(|_| level.to_string());

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_knob_mapping() {
        assert_eq!(timeout_from(DurationKnob::Default), Duration::ZERO);
        assert_eq!(timeout_from(DurationKnob::Disabled), Duration::ZERO);
        assert_eq!(
            timeout_from(DurationKnob::Value(Duration::from_secs(9))),
            Duration::from_secs(9)
        );

        assert_eq!(keepalive_from(DurationKnob::Default), KeepAlive::Default);
        assert_eq!(keepalive_from(DurationKnob::Disabled), KeepAlive::Disabled);
        assert_eq!(
            keepalive_from(DurationKnob::Value(Duration::from_secs(15))),
            KeepAlive::Period(Duration::from_secs(15))
        );
    }

    #[test]
    fn test_build_options_carries_flags() {
        let config = Config::parse(
            "[web]\nproxy-proto = true\nclient-timeout = \"30s\"\nproxy = [\"a:1 -> b:2\"]\n",
        )
        .unwrap();
        let opts = build_options(&config.instances["web"]).unwrap();
        assert!(opts.proxy_proto);
        assert!(!opts.transparent);
        assert_eq!(opts.client_idle_timeout, Duration::from_secs(30));
        assert_eq!(opts.server_idle_timeout, Duration::ZERO);
    }
}
