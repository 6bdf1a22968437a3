//! Application configuration loaded from the environment.

use crate::connectors::normalize::DateLocale;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub base_currency: String,
    pub date_locale: DateLocale,
    /// Rows per ingestion commit batch.
    pub ingest_batch_size: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./cashops.db".to_string());

        let base_currency = std::env::var("BASE_CURRENCY")
            .unwrap_or_else(|_| "EUR".to_string())
            .to_uppercase();

        let date_locale = std::env::var("DATE_LOCALE")
            .ok()
            .and_then(|v| DateLocale::parse(&v))
            .unwrap_or(DateLocale::Iso);

        let ingest_batch_size = std::env::var("INGEST_BATCH_SIZE")
            .unwrap_or_else(|_| "100".to_string())
            .parse()
            .unwrap_or(100);

        Ok(Self {
            database_path,
            base_currency,
            date_locale,
            ingest_batch_size,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "./cashops.db".to_string(),
            base_currency: "EUR".to_string(),
            date_locale: DateLocale::Iso,
            ingest_batch_size: 100,
        }
    }
}
