use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{SalesSource, SalesSourceError};

#[derive(Debug, Deserialize)]
struct SalesResponse {
    data: Vec<SalesRow>,
}

#[derive(Debug, Deserialize)]
struct SalesRow {
    id: u64,
    sales: u64,
}

/// `GET {base}?ids=1,2,3` → `{"data":[{"id":1,"sales":10}, ...]}`
pub struct HttpSalesSource {
    client: reqwest::Client,
    base: reqwest::Url,
}

impl HttpSalesSource {
    pub fn new(base: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("catalog-mirror/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base: reqwest::Url::parse(base)?,
        })
    }

    fn request_url(&self, ids: &[u64]) -> reqwest::Url {
        let joined = ids
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let mut url = self.base.clone();
        url.query_pairs_mut().append_pair("ids", &joined);
        url
    }
}

#[async_trait]
impl SalesSource for HttpSalesSource {
    fn name(&self) -> &str {
        self.base.as_str()
    }

    async fn fetch_sales(&self, ids: &[u64]) -> Result<HashMap<u64, u64>, SalesSourceError> {
        let resp = self
            .client
            .get(self.request_url(ids))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SalesSourceError::Timeout
                } else {
                    SalesSourceError::Network(e.to_string())
                }
            })?;
        if !resp.status().is_success() {
            return Err(SalesSourceError::BadResponse(format!(
                "status {}",
                resp.status()
            )));
        }
        let body: SalesResponse = resp
            .json()
            .await
            .map_err(|e| SalesSourceError::BadResponse(e.to_string()))?;
        Ok(body.data.into_iter().map(|r| (r.id, r.sales)).collect())
    }
}
