#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use murmur_server::config::{default_config_path, load_server_config_from_path};
use murmur_server::server::connection::serve;
use murmur_server::server::health::{HealthState, spawn_health_server};
use murmur_server::server::history::{
	DisabledHistoryBackend, HistoryBackend, InMemoryHistoryBackend, PersistentHistoryBackend,
};
use murmur_server::server::room::Room;
use murmur_server::util::time::SystemClock;
use murmur_util::endpoint::WsEndpoint;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: murmur_server [--bind ws://host:port] [--config path]\n\
\n\
Options:\n\
\t--bind     Bind endpoint (default: ws://127.0.0.1:8787)\n\
\t          Format: ws://host:port\n\
\t--config   Config file (default: ~/.murmur/config.toml)\n\
\t--help     Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	bind: SocketAddr,
	config: Option<PathBuf>,
}

fn parse_args() -> Args {
	let mut bind_endpoint = "ws://127.0.0.1:8787".to_string();
	let mut config = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected ws://host:port)");
					usage_and_exit();
				}
				bind_endpoint = v;
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				config = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let endpoint = WsEndpoint::parse(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	let bind = endpoint.to_socket_addr_if_ip_literal().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	Args { bind, config }
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,murmur_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("murmur_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
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
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => default_config_path()?,
	};
	let server_cfg = load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let room_cfg = server_cfg.room_config()?;
	let conn_settings = Arc::new(server_cfg.connection_settings());

	let backend: Arc<dyn HistoryBackend> = if server_cfg.persistence.enabled {
		match server_cfg.persistence.database_url.as_deref() {
			Some(database_url) => Arc::new(PersistentHistoryBackend::connect(database_url).await?),
			None => Arc::new(InMemoryHistoryBackend::default()),
		}
	} else {
		Arc::new(DisabledHistoryBackend)
	};

	let room = Room::open(room_cfg, backend, Arc::new(SystemClock)).await?;
	let _cleanup = room.spawn_cleanup_task();

	let health_state = HealthState::new(room.stats());
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => spawn_health_server(addr, health_state.clone()),
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let listener = TcpListener::bind(args.bind).await?;
	info!(bind = %args.bind, "murmur_server: websocket listener ready");

	health_state.mark_ready();

	tokio::select! {
		() = serve(listener, room, conn_settings) => {}
		_ = tokio::signal::ctrl_c() => info!("shutting down"),
	}

	Ok(())
}
