use async_trait::async_trait;
use reqwest::StatusCode;
use url::Url;

use super::OperatorCatalog;
use crate::config::SessionConfig;
use crate::error::Result;
use crate::http::{endpoint, Payload, RestClient, Verb};
use crate::model::Operator;

/// REST client of the operator catalog (implementations only).
#[derive(Debug, Clone)]
pub struct CatalogClient {
    rest: RestClient,
    root: Url,
}

impl CatalogClient {
    pub fn new(config: &SessionConfig) -> Result<Self> {
        Ok(Self { rest: RestClient::new(config.timeout())?, root: config.catalog_url()? })
    }
}

#[async_trait]
impl OperatorCatalog for CatalogClient {
    async fn list(&self) -> Result<Vec<Operator>> {
        let url = endpoint(&self.root, &["implementations"])?;
        let resp = self.rest.send(Verb::Get, url, &[], Payload::Empty, None).await?;
        if resp.status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        resp.check("Listing operators")?;
        resp.json_as()
    }

    async fn get(&self, name: &str) -> Result<Operator> {
        let url = endpoint(&self.root, &["implementations", name])?;
        let resp = self.rest.send(Verb::Get, url, &[], Payload::Empty, None).await?;
        resp.check(&format!("No implementation found matching {}", name))?;
        resp.json_as()
    }
}
