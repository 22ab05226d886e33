#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;

use parley_server::config;
use parley_server::quic::config::QuicServerConfig;
use parley_server::server::connection::{ConnectionSettings, serve};
use parley_server::server::health::{HealthState, spawn_health_server};
use parley_server::server::service::ChatService;
use parley_server::server::stats::{StatisticsObserver, StatisticsStore};
use parley_server::server::validation::{ContentValidator, RateLimitValidator, ValidationChain};
use parley_server::util::endpoint::ListenEndpoint;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_LISTEN: &str = "0.0.0.0:50051";

fn print_usage() {
	eprintln!(
		"Usage: parley_server [--listen host:port] [--config path]\n\
\n\
Options:\n\
\t--listen  Listen address (default: {DEFAULT_LISTEN})\n\
\t--config  Config file (default: ~/.parley/config.toml)\n\
\t--help    Show this help\n\
"
	);
}

fn usage_and_exit() -> ! {
	print_usage();
	std::process::exit(1)
}

struct Args {
	listen: SocketAddr,
	config_path: Option<PathBuf>,
}

fn parse_args() -> Args {
	let mut listen = DEFAULT_LISTEN.to_string();
	let mut config_path: Option<PathBuf> = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => {
				print_usage();
				std::process::exit(0);
			}
			"--listen" | "-l" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--listen must be non-empty (expected host:port)");
					usage_and_exit();
				}
				listen = v;
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let endpoint = ListenEndpoint::parse(&listen).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	let listen: SocketAddr = endpoint.to_socket_addr().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	Args { listen, config_path }
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,parley_server=debug".to_string());

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let args = parse_args();

	let config_path = match args.config_path {
		Some(path) => path,
		None => config::default_config_path()?,
	};
	let server_cfg = config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let stats_store = if server_cfg.persistence.enabled {
		let Some(database_url) = server_cfg.persistence.database_url.as_deref() else {
			return Err(anyhow::anyhow!("persistence enabled but no database_url configured"));
		};
		let store = StatisticsStore::connect(database_url).await?;
		store.log_snapshot().await?;
		info!(database_url, "statistics persistence enabled");
		store
	} else {
		StatisticsStore::disabled()
	};
	let stats = StatisticsObserver::spawn(stats_store);

	let validation = ValidationChain::new()
		.with(ContentValidator::new(
			server_cfg.validation.min_content_len,
			server_cfg.validation.max_content_len,
		))
		.with(RateLimitValidator::new(server_cfg.validation.min_message_interval));

	let service = ChatService::build(validation, Some(stats));

	let quic_cfg = QuicServerConfig::dev(args.listen);
	let endpoint = if let (Some(cert_path), Some(key_path)) = (
		server_cfg.server.tls_cert_path.as_deref(),
		server_cfg.server.tls_key_path.as_deref(),
	) {
		info!(cert = %cert_path.display(), key = %key_path.display(), "loading TLS cert/key");
		quic_cfg.bind_endpoint_with_tls(cert_path, key_path)?
	} else {
		let (endpoint, cert_der) = quic_cfg.bind_dev_endpoint()?;
		info!(
			bind = %args.listen,
			cert_der_len = cert_der.len(),
			"QUIC endpoint ready (dev self-signed cert)"
		);
		endpoint
	};

	health_state.mark_ready();
	info!(listen = %args.listen, "parley server listening");

	serve(endpoint, service, ConnectionSettings::default()).await;

	Ok(())
}
