use std::net::SocketAddr;
use std::sync::Arc;

use aiguard::app::{self, AppState};
use aiguard::auth::identity::{FirebaseVerifier, IdentityVerifier};
use aiguard::config::Config;
use aiguard::ratelimit::local::LocalBackend;
use aiguard::ratelimit::shared::SharedBackend;
use aiguard::ratelimit::RateLimitBackend;
use aiguard::scheduler;
use aiguard::store::mongo::MongoStore;
use aiguard::store::Stores;
use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let filter = EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info"));
	tracing_subscriber::fmt().with_env_filter(filter).init();

	let config = Arc::new(Config::from_env().context("loading configuration")?);

	let stores = match &config.mongodb_uri {
		Some(uri) => MongoStore::connect(uri, &config.mongodb_db_name)
			.await
			.context("connecting to document store")?,
		None => {
			warn!("MONGODB_URI not set, using volatile in-memory stores");
			Stores::in_memory()
		},
	};

	let client = reqwest::Client::builder()
		.build()
		.context("building upstream client")?;

	let verifier: Option<Arc<dyn IdentityVerifier>> = match &config.firebase_project_id {
		Some(project_id) => match FirebaseVerifier::new(project_id, client.clone()).await {
			Ok(v) => Some(Arc::new(v)),
			Err(e) => {
				warn!(error = %e, "identity verifier unavailable, serving PAT-only traffic");
				None
			},
		},
		None => None,
	};

	let rate_backend: Arc<dyn RateLimitBackend> = match &config.redis_url {
		Some(url) => match SharedBackend::connect(url).await {
			Ok(backend) => Arc::new(backend),
			Err(e) => {
				warn!(error = %e, "shared rate-limit backend unavailable, using local windows");
				Arc::new(LocalBackend::default())
			},
		},
		None => Arc::new(LocalBackend::default()),
	};

	let state = Arc::new(AppState::new(
		config.clone(),
		stores.clone(),
		verifier,
		rate_backend,
		client,
	));
	scheduler::spawn_counter_resets(stores);

	let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
	let listener = tokio::net::TcpListener::bind(addr)
		.await
		.with_context(|| format!("binding {addr}"))?;
	info!(%addr, "aiguard listening");

	axum::serve(
		listener,
		app::router(state).into_make_service_with_connect_info::<SocketAddr>(),
	)
	.with_graceful_shutdown(shutdown_signal())
	.await
	.context("serving")?;
	info!("shutdown complete");
	Ok(())
}

async fn shutdown_signal() {
	let ctrl_c = async {
		let _ = tokio::signal::ctrl_c().await;
	};
	#[cfg(unix)]
	let terminate = async {
		match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
			Ok(mut sig) => {
				sig.recv().await;
			},
			Err(_) => std::future::pending().await,
		}
	};
	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}
	info!("shutdown signal received");
}
