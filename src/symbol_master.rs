// =============================================================================
// Symbol Master — daily KOSPI/KOSDAQ listing refresh
// =============================================================================
//
// The original source downloads the full listing from a third-party data
// provider rather than a broker TR — modeled here as an external-collaborator
// trait boundary, the same way the vision model and the market-calendar
// holiday oracle are, with an HTTP implementation and a stub for tests.
// =============================================================================

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tracing::{info, warn};

use crate::store::Store;
use crate::types::{Market, Symbol};

const STALE_AFTER_DAYS: i64 = 1;

#[async_trait]
pub trait SymbolMasterProvider: Send + Sync {
    async fn fetch(&self) -> anyhow::Result<Vec<Symbol>>;
}

/// Fetches a KOSPI and a KOSDAQ listing from two configured URLs, each
/// expected to return a JSON array of `{code, name}` (or `{Code, Name}`)
/// objects.
pub struct HttpSymbolMasterProvider {
    http: reqwest::Client,
    kospi_url: String,
    kosdaq_url: String,
}

impl HttpSymbolMasterProvider {
    pub fn new(http: reqwest::Client, kospi_url: String, kosdaq_url: String) -> Self {
        Self {
            http,
            kospi_url,
            kosdaq_url,
        }
    }

    async fn fetch_listing(&self, url: &str, market: Market) -> anyhow::Result<Vec<Symbol>> {
        let rows: Vec<serde_json::Value> = self
            .http
            .get(url)
            .timeout(std::time::Duration::from_secs(20))
            .send()
            .await?
            .json()
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let code = row
                    .get("code")
                    .or_else(|| row.get("Code"))?
                    .as_str()?
                    .to_string();
                let name = row
                    .get("name")
                    .or_else(|| row.get("Name"))?
                    .as_str()?
                    .to_string();
                Some(Symbol { code, name, market })
            })
            .collect())
    }
}

#[async_trait]
impl SymbolMasterProvider for HttpSymbolMasterProvider {
    async fn fetch(&self) -> anyhow::Result<Vec<Symbol>> {
        let mut symbols = self.fetch_listing(&self.kospi_url, Market::Kospi).await?;
        symbols.extend(self.fetch_listing(&self.kosdaq_url, Market::Kosdaq).await?);
        Ok(symbols)
    }
}

/// Deterministic stub used by tests and when no listing URLs are configured.
pub struct StubSymbolMasterProvider {
    pub symbols: Vec<Symbol>,
}

#[async_trait]
impl SymbolMasterProvider for StubSymbolMasterProvider {
    async fn fetch(&self) -> anyhow::Result<Vec<Symbol>> {
        Ok(self.symbols.clone())
    }
}

/// Refresh the Store's symbol master listing if absent or more than a
/// calendar day old. Best-effort: a provider failure leaves whatever listing
/// is already cached in place and logs a warning rather than blocking
/// startup on a third-party outage.
pub async fn refresh_if_stale(store: &Store, provider: &dyn SymbolMasterProvider) {
    let last_updated: Option<NaiveDate> = store.get_kv("master_stocks_updated_at").await;
    let today = Utc::now().date_naive();
    if let Some(last) = last_updated {
        if (today - last).num_days() < STALE_AFTER_DAYS {
            return;
        }
    }

    match provider.fetch().await {
        Ok(symbols) if !symbols.is_empty() => {
            let count = symbols.len();
            store.save_master_stocks(&symbols).await;
            store.set_kv("master_stocks_updated_at", &today).await;
            info!(count, "symbol master listing refreshed");
        }
        Ok(_) => warn!("symbol master provider returned an empty listing, keeping prior data"),
        Err(e) => warn!(error = %e, "symbol master refresh failed, keeping prior data"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refresh_skips_when_fresh() {
        let store = Store::open_in_memory().unwrap();
        store.set_kv("master_stocks_updated_at", &Utc::now().date_naive()).await;
        let provider = StubSymbolMasterProvider { symbols: vec![] };
        refresh_if_stale(&store, &provider).await;
        assert!(store.load_master_stocks().await.is_empty());
    }

    #[tokio::test]
    async fn refresh_populates_when_absent() {
        let store = Store::open_in_memory().unwrap();
        let provider = StubSymbolMasterProvider {
            symbols: vec![Symbol {
                code: "005930".to_string(),
                name: "Samsung Electronics".to_string(),
                market: Market::Kospi,
            }],
        };
        refresh_if_stale(&store, &provider).await;
        assert_eq!(store.load_master_stocks().await.len(), 1);
    }

    #[tokio::test]
    async fn refresh_keeps_prior_data_on_provider_error() {
        struct FailingProvider;
        #[async_trait]
        impl SymbolMasterProvider for FailingProvider {
            async fn fetch(&self) -> anyhow::Result<Vec<Symbol>> {
                Err(anyhow::anyhow!("network error"))
            }
        }

        let store = Store::open_in_memory().unwrap();
        store
            .save_master_stocks(&[Symbol {
                code: "000660".to_string(),
                name: "SK Hynix".to_string(),
                market: Market::Kospi,
            }])
            .await;
        refresh_if_stale(&store, &FailingProvider).await;
        assert_eq!(store.load_master_stocks().await.len(), 1);
    }
}
