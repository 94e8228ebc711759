use anyhow::Result;
use axum::Router;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use upload_coordinator::{
    config::{self, SessionStoreKind},
    db, routes,
    services::{
        catalog::SqliteCatalog,
        object_store::ObjectStore,
        presign::PartUrlSigner,
        session_store::{MemorySessionStore, SessionStore, SqliteSessionStore},
        storage_service::LocalObjectStore,
        upload_service::{CoordinatorSettings, UploadCoordinator},
    },
    state::AppState,
};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting upload-coordinator with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    tracing::debug!("Connecting using raw URL => {}", cfg.database_url);
    let db = Arc::new(db::connect(&cfg.database_url).await?);

    // --- Schema (idempotent), then exit in migration mode ---
    db::run_migrations(&db).await?;
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    // --- Initialize core services ---
    let secret = match &cfg.signing_secret {
        Some(secret) => secret.as_bytes().to_vec(),
        None => {
            tracing::warn!(
                "No UPLOADS_SIGNING_SECRET set; generated a per-process secret. \
                 Pre-signed URLs will not survive a restart or work across instances."
            );
            [Uuid::new_v4().into_bytes(), Uuid::new_v4().into_bytes()].concat()
        }
    };
    let signer = PartUrlSigner::new(secret, cfg.public_base_url.clone());
    let storage = Arc::new(LocalObjectStore::new(cfg.storage_dir.clone(), signer));

    let sessions: Arc<dyn SessionStore> = match cfg.session_store {
        SessionStoreKind::Memory => Arc::new(MemorySessionStore::new(cfg.max_buffered_bytes)),
        SessionStoreKind::Sqlite => Arc::new(SqliteSessionStore::new(
            db.clone(),
            cfg.max_buffered_bytes,
        )),
    };
    let policies = cfg.load_policies()?;
    let max_part_bytes = usize::try_from(policies.largest_part_size()).unwrap_or(usize::MAX);

    let coordinator = UploadCoordinator::new(
        storage.clone() as Arc<dyn ObjectStore>,
        sessions,
        Arc::new(SqliteCatalog::new(db.clone())),
        policies,
        CoordinatorSettings {
            session_ttl: cfg.session_ttl,
            presign_expiry: cfg.presign_expiry,
        },
    );
    coordinator.start_sweeper(cfg.sweep_interval);

    // --- Build router ---
    let app: Router = routes::routes::routes(max_part_bytes).with_state(AppState {
        coordinator,
        storage,
        db,
    });

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
