//! scryd: a guacamole-protocol remote desktop proxy. One backend connection
//! per credential fingerprint, any number of viewers on top of it.

use clap::{App, Arg};
use flint::logging::{self, error, info, warn};
use scryd::config::{self, Config};
use scryd::errdefs::ServiceError;
use scryd::proxy::Proxy;
use scryd::routers;
use std::future::IntoFuture;
use std::process;
use std::time::Duration;

/// How long in-flight connections get to wind down after an interrupt.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// The documented invocation is `scryd -conf <path>`; clap only matches
/// two-dash long flags, so the single-dash spelling is rewritten before
/// parsing.
fn normalize_conf_flag(arg: String) -> String {
    if arg == "-conf" {
        return "--conf".to_string();
    }
    if let Some(path) = arg.strip_prefix("-conf=") {
        return format!("--conf={}", path);
    }
    arg
}

fn main() {
    let matches = App::new("scryd")
        .version(config::VERSION)
        .about("A guacamole-protocol based remote desktop proxy.")
        .arg(
            Arg::with_name("conf")
                .long("conf")
                .value_name("PATH")
                .takes_value(true)
                .default_value("./scryd.toml")
                .help("Path to the runtime config file"),
        )
        .get_matches_from(std::env::args().map(normalize_conf_flag));

    let conf_path = matches.value_of("conf").expect("flag has a default");
    let config = match Config::load(conf_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("scryd: cannot load config file {}: {}", conf_path, e);
            process::exit(1);
        }
    };

    let log = match logging::init(&config.max_log_level) {
        Ok(log) => log,
        Err(e) => {
            eprintln!("scryd: cannot initialize logging: {}", e);
            process::exit(1);
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime");
    if let Err(e) = runtime.block_on(serve(config, log.clone())) {
        error!(log, "proxy terminated with error"; "error" => %e);
        process::exit(1);
    }
}

async fn serve(config: Config, log: logging::Logger) -> Result<(), ServiceError> {
    let address = config.address.clone();
    let proxy = Proxy::new(config, log.clone())?;
    let app = routers::routers(proxy);

    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!(log, "starting proxy"; "address" => %address,
        "version" => config::VERSION, "commit" => config::GIT_COMMIT);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .into_future(),
    );

    tokio::signal::ctrl_c().await?;
    info!(log, "shutting down proxy");
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(SHUTDOWN_DRAIN, server).await {
        Ok(Ok(Ok(()))) => info!(log, "proxy is down, good bye"),
        Ok(Ok(Err(e))) => warn!(log, "server shut down with error"; "error" => %e),
        Ok(Err(e)) => warn!(log, "server task failed"; "error" => %e),
        Err(_) => warn!(log, "drain window elapsed, aborting open connections"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_conf_flag() {
        assert_eq!(normalize_conf_flag("-conf".into()), "--conf");
        assert_eq!(
            normalize_conf_flag("-conf=./scryd.toml".into()),
            "--conf=./scryd.toml"
        );
        // Everything else passes through untouched.
        assert_eq!(normalize_conf_flag("--conf".into()), "--conf");
        assert_eq!(normalize_conf_flag("./scryd.toml".into()), "./scryd.toml");
        assert_eq!(normalize_conf_flag("scryd".into()), "scryd");
    }
}
