//! Server test utilities.

use super::faults::{FlakyCatalog, FlakyStorage};
use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};
use tempfile::TempDir;
use upload_coordinator::{
    config::SessionStoreKind,
    db,
    routes::routes::routes,
    services::{
        catalog::SqliteCatalog,
        policy::PolicyTable,
        presign::PartUrlSigner,
        session_store::{MemorySessionStore, SessionStore, SqliteSessionStore},
        storage_service::LocalObjectStore,
        upload_service::{CoordinatorSettings, UploadCoordinator},
    },
    state::AppState,
};

pub const TEST_BASE_URL: &str = "http://uploads.test";

/// Knobs for building a `TestServer`.
#[allow(dead_code)]
pub struct TestOptions {
    pub session_store: SessionStoreKind,
    pub session_ttl: Duration,
    pub max_buffered_bytes: u64,
    pub policies: PolicyTable,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            session_store: SessionStoreKind::Memory,
            session_ttl: Duration::from_secs(3600),
            max_buffered_bytes: 256 * 1024 * 1024,
            policies: PolicyTable::default(),
        }
    }
}

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub coordinator: UploadCoordinator,
    pub storage: Arc<FlakyStorage>,
    pub local: Arc<LocalObjectStore>,
    pub catalog: Arc<FlakyCatalog>,
    pub sqlite_catalog: SqliteCatalog,
    pub sessions: Arc<dyn SessionStore>,
    pub db: Arc<SqlitePool>,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    pub async fn new() -> Self {
        Self::with_options(TestOptions::default()).await
    }

    pub async fn with_options(options: TestOptions) -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");

        let storage_path = temp_dir.path().join("storage");
        std::fs::create_dir_all(&storage_path).expect("Failed to create storage directory");
        let signer = PartUrlSigner::new(b"test-signing-secret".to_vec(), TEST_BASE_URL);
        let local = Arc::new(LocalObjectStore::new(&storage_path, signer));
        let storage = Arc::new(FlakyStorage::new(local.clone()));

        let db_url = format!("sqlite://{}", temp_dir.path().join("meta.db").display());
        let pool = db::connect(&db_url)
            .await
            .expect("Failed to open test database");
        db::run_migrations(&pool)
            .await
            .expect("Failed to run migrations");
        let db = Arc::new(pool);

        let sqlite_catalog = SqliteCatalog::new(db.clone());
        let catalog = Arc::new(FlakyCatalog::new(sqlite_catalog.clone()));

        let sessions: Arc<dyn SessionStore> = match options.session_store {
            SessionStoreKind::Memory => {
                Arc::new(MemorySessionStore::new(options.max_buffered_bytes))
            }
            SessionStoreKind::Sqlite => Arc::new(SqliteSessionStore::new(
                db.clone(),
                options.max_buffered_bytes,
            )),
        };

        let max_part_bytes = options.policies.largest_part_size() as usize;
        let coordinator = UploadCoordinator::new(
            storage.clone(),
            sessions.clone(),
            catalog.clone(),
            options.policies,
            CoordinatorSettings {
                session_ttl: options.session_ttl,
                presign_expiry: Duration::from_secs(900),
            },
        );

        let router = routes(max_part_bytes).with_state(AppState {
            coordinator: coordinator.clone(),
            storage: local.clone(),
            db: db.clone(),
        });

        Self {
            router,
            coordinator,
            storage,
            local,
            catalog,
            sqlite_catalog,
            sessions,
            db,
            _temp_dir: temp_dir,
        }
    }

    pub async fn media_count(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM media_items")
            .fetch_one(&*self.db)
            .await
            .expect("Failed to count media items")
    }
}
