//! Remote persistence API boundary.

use color_eyre::{eyre::eyre, Result};
use reqwest::{Method, RequestBuilder};
use std::future::Future;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::cache::{Record, Table};
use crate::config::RemoteConfig;

/// The three verbs the sync processor replays queued operations with.
///
/// Any error counts as a failed attempt; the processor does not look at
/// what went wrong.
pub trait RemoteApi: Send + Sync {
  fn insert(&self, table: Table, record: &Record) -> impl Future<Output = Result<()>> + Send;

  fn update(
    &self,
    table: Table,
    id: &str,
    fields: &Record,
  ) -> impl Future<Output = Result<()>> + Send;

  fn delete(&self, table: Table, id: &str) -> impl Future<Output = Result<()>> + Send;
}

/// REST client for a PostgREST-style endpoint (`/{table}?id=eq.{id}`).
#[derive(Clone)]
pub struct HttpRemote {
  client: reqwest::Client,
  base: Url,
  api_key: Option<String>,
}

impl HttpRemote {
  pub fn new(config: &RemoteConfig, api_key: Option<String>) -> Result<Self> {
    let mut base =
      Url::parse(&config.url).map_err(|e| eyre!("Invalid remote url {}: {}", config.url, e))?;
    // Url::join drops the last segment unless the path ends with a slash
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }

    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base,
      api_key,
    })
  }

  fn table_url(&self, table: Table, id: Option<&str>) -> Result<Url> {
    let mut url = self
      .base
      .join(table.name())
      .map_err(|e| eyre!("Failed to build url for {}: {}", table, e))?;
    if let Some(id) = id {
      url
        .query_pairs_mut()
        .append_pair("id", &format!("eq.{}", id));
    }
    Ok(url)
  }

  fn request(&self, method: Method, url: Url) -> RequestBuilder {
    let builder = self
      .client
      .request(method, url)
      .header("Prefer", "return=minimal");
    match &self.api_key {
      Some(key) => builder.header("apikey", key).bearer_auth(key),
      None => builder,
    }
  }

  async fn send(&self, builder: RequestBuilder, what: &str) -> Result<reqwest::Response> {
    builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to {}: {}", what, e))?
      .error_for_status()
      .map_err(|e| eyre!("Failed to {}: {}", what, e))
  }

  /// Bulk read used to refill the cache.
  pub async fn select(&self, table: Table, limit: Option<usize>) -> Result<Vec<Record>> {
    let mut url = self.table_url(table, None)?;
    url.query_pairs_mut().append_pair("select", "*");
    if let Some(limit) = limit {
      url
        .query_pairs_mut()
        .append_pair("limit", &limit.to_string());
    }

    let response = self
      .send(self.request(Method::GET, url), &format!("read {}", table))
      .await?;
    response
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse {} response: {}", table, e))
  }

  /// Whether the endpoint answers at all. Any HTTP status counts as reachable.
  pub async fn ping(&self) -> bool {
    self
      .request(Method::GET, self.base.clone())
      .send()
      .await
      .is_ok()
  }
}

impl RemoteApi for HttpRemote {
  async fn insert(&self, table: Table, record: &Record) -> Result<()> {
    let url = self.table_url(table, None)?;
    self
      .send(
        self.request(Method::POST, url).json(record),
        &format!("insert into {}", table),
      )
      .await?;
    debug!(%table, "remote insert");
    Ok(())
  }

  async fn update(&self, table: Table, id: &str, fields: &Record) -> Result<()> {
    let url = self.table_url(table, Some(id))?;
    self
      .send(
        self.request(Method::PATCH, url).json(fields),
        &format!("update {} {}", table, id),
      )
      .await?;
    debug!(%table, id, "remote update");
    Ok(())
  }

  async fn delete(&self, table: Table, id: &str) -> Result<()> {
    let url = self.table_url(table, Some(id))?;
    self
      .send(
        self.request(Method::DELETE, url),
        &format!("delete {} {}", table, id),
      )
      .await?;
    debug!(%table, id, "remote delete");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;
  use tokio::task::JoinHandle;

  fn remote(url: &str) -> HttpRemote {
    let config = RemoteConfig {
      url: url.to_string(),
      timeout_secs: 5,
    };
    HttpRemote::new(&config, Some("secret".into())).unwrap()
  }

  /// Answer a single request with `status` and `body`; yields the raw request.
  async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let mut raw = Vec::new();
      let mut buf = [0u8; 4096];
      loop {
        let n = socket.read(&mut buf).await.unwrap();
        raw.extend_from_slice(&buf[..n]);
        let text = String::from_utf8_lossy(&raw).to_string();
        if let Some(end) = text.find("\r\n\r\n") {
          let length = text[..end]
            .lines()
            .find_map(|l| {
              l.to_ascii_lowercase()
                .strip_prefix("content-length:")
                .map(|v| v.trim().parse::<usize>().unwrap())
            })
            .unwrap_or(0);
          if raw.len() >= end + 4 + length {
            break;
          }
        }
        if n == 0 {
          break;
        }
      }

      let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
      );
      socket.write_all(response.as_bytes()).await.unwrap();
      String::from_utf8_lossy(&raw).to_string()
    });

    (format!("http://{}/rest/v1", addr), handle)
  }

  fn record(value: serde_json::Value) -> Record {
    value.as_object().cloned().unwrap()
  }

  #[test]
  fn test_table_url_keeps_base_path() {
    let remote = remote("https://example.com/rest/v1");
    assert_eq!(
      remote.table_url(Table::PipelineItems, None).unwrap().as_str(),
      "https://example.com/rest/v1/pipeline_items"
    );
    assert_eq!(
      remote.table_url(Table::Posts, Some("p1")).unwrap().as_str(),
      "https://example.com/rest/v1/posts?id=eq.p1"
    );
  }

  #[test]
  fn test_invalid_url_is_rejected() {
    let config = RemoteConfig {
      url: "not a url".into(),
      timeout_secs: 5,
    };
    assert!(HttpRemote::new(&config, None).is_err());
  }

  #[tokio::test]
  async fn test_insert_posts_record() {
    let (url, server) = serve_once("201 Created", "").await;
    remote(&url)
      .insert(Table::Posts, &record(json!({"id": "p1", "title": "A"})))
      .await
      .unwrap();

    let request = server.await.unwrap();
    assert!(request.starts_with("POST /rest/v1/posts "));
    assert!(request.to_ascii_lowercase().contains("authorization: bearer secret"));
    assert!(request.contains(r#""title":"A""#));
  }

  #[tokio::test]
  async fn test_update_patches_by_id() {
    let (url, server) = serve_once("204 No Content", "").await;
    remote(&url)
      .update(Table::Posts, "p1", &record(json!({"title": "B"})))
      .await
      .unwrap();

    let request = server.await.unwrap();
    assert!(request.starts_with("PATCH /rest/v1/posts?id=eq.p1 "));
  }

  #[tokio::test]
  async fn test_server_error_is_a_failure() {
    let (url, server) = serve_once("500 Internal Server Error", "").await;
    let result = remote(&url).delete(Table::Posts, "p1").await;
    assert!(result.is_err());
    server.await.unwrap();
  }

  #[tokio::test]
  async fn test_select_parses_records() {
    let (url, server) = serve_once("200 OK", r#"[{"id":"p1"},{"id":"p2"}]"#).await;
    let records = remote(&url).select(Table::Posts, Some(10)).await.unwrap();
    assert_eq!(records.len(), 2);

    let request = server.await.unwrap();
    assert!(request.starts_with("GET /rest/v1/posts?select=*&limit=10 "));
  }

  #[tokio::test]
  async fn test_ping_unreachable() {
    // Bind then drop to get a port nobody listens on
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    assert!(!remote(&format!("http://{}/", addr)).ping().await);
  }
}
