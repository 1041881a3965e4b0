use std::io::Read;
use std::time::Duration;

use coffre_protocol::{format_range_header, ByteRange, ResourceKind};
use coffre_types::{CoffreError, Mac, Result};

/// Maximum number of retries on transient errors.
const MAX_RETRIES: u32 = 3;
const RETRY_DELAY_MS: u64 = 250;
const RETRY_MAX_DELAY_MS: u64 = 5_000;

/// Cap on a single blob fetched into memory (the packfile format caps
/// blob lengths at 32 bits anyway).
const MAX_BODY: u64 = u32::MAX as u64;

/// HTTP client for the remote storage server protocol:
/// `GET /` for the configuration, `GET|PUT|DELETE /resources/{kind}/{mac}`
/// and `GET /resources/{kind}` for listings. Range reads use the strict
/// `bytes=<start>-<end>` form with an exclusive end.
#[derive(Debug)]
pub struct HttpStore {
    base_url: String,
    location: String,
    agent: ureq::Agent,
}

impl HttpStore {
    pub fn new(base_url: &str) -> Result<Self> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .timeout_write(Duration::from_secs(300))
            .build();

        Ok(HttpStore {
            base_url: base_url.trim_end_matches('/').to_string(),
            location: base_url.to_string(),
            agent,
        })
    }

    fn resource_url(&self, kind: ResourceKind) -> String {
        format!("{}/resources/{}", self.base_url, kind.as_str())
    }

    fn blob_url(&self, kind: ResourceKind, mac: Mac) -> String {
        format!("{}/{}", self.resource_url(kind), mac.to_hex())
    }

    /// Retry a closure on transient errors with exponential backoff + jitter.
    fn retry_call<T>(
        &self,
        op_name: &str,
        f: impl Fn() -> std::result::Result<T, ureq::Error>,
    ) -> std::result::Result<T, ureq::Error> {
        let mut delay_ms = RETRY_DELAY_MS;
        let mut last_err = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let jitter = rand::random::<u64>() % delay_ms.max(1);
                std::thread::sleep(Duration::from_millis(delay_ms + jitter));
                delay_ms = (delay_ms * 2).min(RETRY_MAX_DELAY_MS);
            }
            match f() {
                Ok(val) => return Ok(val),
                Err(e) if is_retryable(&e) && attempt < MAX_RETRIES => {
                    tracing::warn!(
                        "storage {op_name}: transient error (attempt {}/{MAX_RETRIES}), retrying: {e}",
                        attempt + 1,
                    );
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap())
    }

    fn map_err(&self, op: &str, key: String, err: ureq::Error) -> CoffreError {
        match err {
            ureq::Error::Status(404, _) => CoffreError::ResourceNotFound(key),
            ureq::Error::Status(code, resp) => {
                let body = resp.into_string().unwrap_or_default();
                CoffreError::Storage(format!("{op} {key}: HTTP {code} {}", body.trim()))
            }
            ureq::Error::Transport(t) => CoffreError::Storage(format!("{op} {key}: {t}")),
        }
    }
}

fn is_retryable(err: &ureq::Error) -> bool {
    match err {
        ureq::Error::Transport(_) => true,
        ureq::Error::Status(code, _) => *code == 429 || *code >= 500,
    }
}

fn read_body(resp: ureq::Response) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    resp.into_reader()
        .take(MAX_BODY)
        .read_to_end(&mut buf)
        .map_err(|e| CoffreError::Storage(format!("reading response body: {e}")))?;
    Ok(buf)
}

impl super::Store for HttpStore {
    fn location(&self) -> &str {
        &self.location
    }

    fn open(&self) -> Result<Vec<u8>> {
        let url = format!("{}/", self.base_url);
        let resp = self
            .retry_call("open", || self.agent.get(&url).call())
            .map_err(|e| self.map_err("open", url.clone(), e))?;
        read_body(resp)
    }

    fn create(&self, _config: &[u8]) -> Result<()> {
        // Repositories behind the storage server are created server-side.
        Err(CoffreError::UnsupportedBackend(
            "creating repositories over http".into(),
        ))
    }

    fn list(&self, kind: ResourceKind) -> Result<Vec<Mac>> {
        let url = self.resource_url(kind);
        let resp = self
            .retry_call("list", || self.agent.get(&url).call())
            .map_err(|e| self.map_err("list", url.clone(), e))?;

        let hexes: Vec<String> = resp
            .into_json()
            .map_err(|e| CoffreError::Storage(format!("list {kind}: invalid JSON: {e}")))?;
        hexes
            .iter()
            .map(|h| {
                Mac::from_hex(h)
                    .ok_or_else(|| CoffreError::Storage(format!("list {kind}: bad MAC '{h}'")))
            })
            .collect()
    }

    fn get(&self, kind: ResourceKind, mac: Mac, range: Option<ByteRange>) -> Result<Vec<u8>> {
        let url = self.blob_url(kind, mac);
        let resp = self
            .retry_call("get", || {
                let req = self.agent.get(&url);
                let req = match range {
                    Some(r) => req.set("Range", &format_range_header(r)),
                    None => req,
                };
                req.call()
            })
            .map_err(|e| self.map_err("get", url.clone(), e))?;

        let body = read_body(resp)?;
        if let Some(r) = range {
            if body.len() != r.length as usize {
                return Err(CoffreError::Storage(format!(
                    "get {url}: expected {} bytes, got {}",
                    r.length,
                    body.len()
                )));
            }
        }
        Ok(body)
    }

    fn put(&self, kind: ResourceKind, mac: Mac, data: &[u8]) -> Result<u64> {
        let url = self.blob_url(kind, mac);
        self.retry_call("put", || self.agent.put(&url).send_bytes(data))
            .map_err(|e| self.map_err("put", url.clone(), e))?;
        Ok(data.len() as u64)
    }

    fn delete(&self, kind: ResourceKind, mac: Mac) -> Result<()> {
        let url = self.blob_url(kind, mac);
        self.retry_call("delete", || self.agent.delete(&url).call())
            .map_err(|e| self.map_err("delete", url.clone(), e))?;
        Ok(())
    }
}
