//! A read-only substituter served over HTTP.

use reqwest::{Client, StatusCode};
use tracing::debug;

use super::{Realisation, SubstituteError};
use crate::store::StorePath;
use crate::util::hash::Fingerprint;

#[derive(Debug, Clone)]
pub struct HttpCache {
  base: String,
  client: Client,
}

impl HttpCache {
  pub fn new(base: &str) -> Self {
    Self {
      base: base.trim_end_matches('/').to_string(),
      client: Client::new(),
    }
  }

  pub fn base_url(&self) -> &str {
    &self.base
  }

  /// GET a resource. A 404 is `Ok(None)`.
  async fn get(&self, resource: &str) -> Result<Option<Vec<u8>>, SubstituteError> {
    let url = format!("{}/{}", self.base, resource);
    debug!(url = %url, "querying substituter");

    let http_err = |source| SubstituteError::Http {
      url: url.clone(),
      source,
    };

    let response = self.client.get(&url).send().await.map_err(http_err)?;
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
      return Ok(None);
    }
    if !status.is_success() {
      return Err(SubstituteError::Status {
        url,
        status: status.as_u16(),
      });
    }

    let bytes = response.bytes().await.map_err(http_err)?;
    Ok(Some(bytes.to_vec()))
  }

  pub async fn query(&self, fingerprint: &Fingerprint) -> Result<Option<Realisation>, SubstituteError> {
    let resource = format!("realisations/{}.json", fingerprint);
    let Some(body) = self.get(&resource).await? else {
      return Ok(None);
    };
    serde_json::from_slice(&body)
      .map(Some)
      .map_err(|source| SubstituteError::Decode {
        location: format!("{}/{}", self.base, resource),
        source,
      })
  }

  pub async fn fetch(&self, path: &StorePath) -> Result<Vec<u8>, SubstituteError> {
    self
      .get(&format!("objects/{}.tar", path))
      .await?
      .ok_or_else(|| SubstituteError::NotFound { path: path.clone() })
  }
}
