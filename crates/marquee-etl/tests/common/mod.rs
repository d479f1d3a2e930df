//! Shared fixtures for the integration tests
//!
//! Dumps are written as real gzip files with the production headers, so the
//! fetcher and parser run exactly as they do against downloaded data.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use marquee_etl::config::StoreBackend;
use marquee_etl::store::PgStore;
use marquee_etl::{Dataset, EtlConfig};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use testcontainers::core::IntoContainerPort;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("marquee_etl=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Gzip `content` into `path`
pub fn write_gz(path: &Path, content: &[u8]) {
    let file = std::fs::File::create(path).unwrap();
    let mut encoder = GzEncoder::new(file, Compression::default());
    encoder.write_all(content).unwrap();
    encoder.finish().unwrap();
}

/// Header line plus `rows`, tab-separated, newline-terminated
pub fn dump_text(dataset: Dataset, rows: &[&str]) -> String {
    let mut text = dataset.expected_header().join("\t");
    text.push('\n');
    for row in rows {
        text.push_str(row);
        text.push('\n');
    }
    text
}

/// Gzipped dump bytes for serving over HTTP
pub fn dump_bytes(dataset: Dataset, rows: &[&str]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(dump_text(dataset, rows).as_bytes())
        .unwrap();
    encoder.finish().unwrap()
}

/// Write the dump of `dataset` into `dir` under its production file name
pub fn write_dump(dir: &Path, dataset: Dataset, rows: &[&str]) -> PathBuf {
    let path = dir.join(dataset.file_name());
    write_gz(&path, dump_text(dataset, rows).as_bytes());
    path
}

pub const PEOPLE: &[&str] = &[
    "nm0000001\tAnna Arden\t1950\t\\N\tactress,producer\ttt0000001,tt0000002",
    "nm0000002\tBruno Blake\t1962\t2020\tactor\ttt0000001",
    "nm0000003\tCora Crane\t1970\t\\N\tdirector\ttt0000003",
];

pub const TITLES: &[&str] = &[
    "tt0000001\tmovie\tFirst Light\tFirst Light\t0\t1999\t\\N\t100\tDrama",
    "tt0000002\tmovie\tSecond Wind\tSecond Wind\t0\t2004\t\\N\t120\tComedy,Drama",
    "tt0000003\tshort\tThird Act\tThird Act\t0\t2010\t\\N\t\\N\tShort",
];

pub const RATINGS: &[&str] = &[
    "tt0000001\t8.0\t1200",
    "tt0000002\t6.0\t300",
    "tt0000003\t7.0\t45",
];

pub const PARTICIPATIONS: &[&str] = &[
    "tt0000001\t1\tnm0000002\tactor\t\\N\t[\"Jack\"]",
    "tt0000001\t2\tnm0000001\tactress\t\\N\t[\"Jill\"]",
    "tt0000002\t1\tnm0000001\tactress\t\\N\t[\"Mona\"]",
    "tt0000003\t1\tnm0000002\tactor\t\\N\t\\N",
    "tt0000003\t2\tnm0000003\tdirector\t\\N\t\\N",
];

/// Write every dataset of the standard fixture into `dir`
pub fn write_fixture(dir: &Path) {
    write_dump(dir, Dataset::People, PEOPLE);
    write_dump(dir, Dataset::Titles, TITLES);
    write_dump(dir, Dataset::Ratings, RATINGS);
    write_dump(dir, Dataset::Participations, PARTICIPATIONS);
}

/// In-memory store, local source directory, fast retries
pub fn local_config(source: &Path, data: &TempDir) -> EtlConfig {
    EtlConfig {
        store: StoreBackend::Memory,
        source_url: source.display().to_string(),
        data_dir: data.path().to_path_buf(),
        batch_size: 2,
        max_retries: 2,
        retry_backoff_ms: 1,
        ..EtlConfig::default()
    }
}

// ============================================================================
// PostgreSQL test container
// ============================================================================

pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    store: PgStore,
}

impl TestPostgres {
    /// Start a container and apply the migrations
    pub async fn start() -> Result<Self> {
        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&format!("postgresql://postgres:postgres@{}:{}/postgres", host, port))
            .await
            .context("Failed to connect to PostgreSQL")?;

        let store = PgStore::from_pool(pool);
        store.migrate().await.context("Failed to run migrations")?;

        Ok(Self {
            _container: container,
            store,
        })
    }

    pub fn store(&self) -> PgStore {
        self.store.clone()
    }
}
