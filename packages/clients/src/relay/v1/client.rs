use std::{sync::Arc, time::Duration};

use color_eyre::{
    Result, Section, SectionExt,
    eyre::{Context, eyre},
};
use derive_more::{Debug, Display};
use reqwest::{StatusCode, blocking::Response, header};
use tracing::{instrument, trace};
use url::Url;

use crate::{
    Token,
    relay::v1::{
        ActionEntry, CasCheckRequest, CasCheckResponse, EntryGetResponse, EntryPutRequest,
        Fingerprint, Key, TargetEntry,
    },
};

/// Client for the Relay API.
///
/// All operations are synchronous and bounded by the configured per-request
/// timeout; callers treat any error as a cache miss.
///
/// ## Cloning
///
/// This type is cheaply cloneable, and clones share the underlying HTTP
/// connection pool.
#[derive(Clone, Debug, Display)]
#[display("{base}")]
pub struct Client {
    #[debug("{:?}", base.as_str())]
    base: Arc<Url>,

    #[debug(skip)]
    http: reqwest::blocking::Client,

    /// Compress blob bodies on the wire with zstd.
    compress: bool,

    #[debug(skip)]
    token: Option<Token>,
}

impl Client {
    /// Create a new client with the given base URL and per-request timeout.
    pub fn new(base: Url, timeout: Duration, compress: bool) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("build http client")?;
        Ok(Self {
            base: Arc::new(base),
            http,
            compress,
            token: None,
        })
    }

    /// Attach an authentication token sent with every request.
    pub fn with_token(mut self, token: Token) -> Self {
        self.token = Some(token);
        self
    }

    fn request(&self, builder: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token.expose()),
            None => builder,
        }
    }

    /// Check that the service is reachable.
    #[instrument(skip(self))]
    pub fn ping(&self) -> Result<()> {
        let url = self.base.join("api/v1/health")?;
        let response = self.request(self.http.get(url)).send().context("request")?;
        match response.status() {
            StatusCode::OK => Ok(()),
            status => Err(unexpected_status(status, response)),
        }
    }

    /// Check if a CAS blob exists.
    #[instrument(skip(self))]
    pub fn cas_exists(&self, key: &Key) -> Result<bool> {
        let url = self.base.join(&format!("api/v1/cas/{key}"))?;
        let response = self.request(self.http.head(url)).send().context("send")?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(unexpected_status(status, response)),
        }
    }

    /// Check which of the provided keys exist on the remote.
    #[instrument(skip(self, keys))]
    pub fn cas_exists_batch(
        &self,
        keys: impl IntoIterator<Item = impl Into<Key>>,
    ) -> Result<CasCheckResponse> {
        let url = self.base.join("api/v1/cas/check")?;
        let body = CasCheckRequest::new(keys);
        let response = self
            .request(self.http.post(url))
            .json(&body)
            .send()
            .context("send")?;
        match response.status() {
            StatusCode::OK => response.json().context("parse JSON response"),
            status => Err(unexpected_status(status, response)),
        }
    }

    /// Read a CAS blob.
    #[instrument(skip(self))]
    pub fn cas_read(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        let url = self.base.join(&format!("api/v1/cas/{key}"))?;
        let response = self.request(self.http.get(url)).send().context("send")?;
        match response.status() {
            StatusCode::OK => {
                let compressed = response
                    .headers()
                    .get(header::CONTENT_ENCODING)
                    .is_some_and(|encoding| encoding == "zstd");
                let body = response.bytes().context("read body")?;
                if compressed {
                    zstd::decode_all(body.as_ref())
                        .context("decompress body")
                        .map(Some)
                } else {
                    Ok(Some(body.to_vec()))
                }
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(unexpected_status(status, response)),
        }
    }

    /// Read multiple CAS blobs. Keys that miss are absent from the result.
    #[instrument(skip(self, keys))]
    pub fn cas_read_batch(
        &self,
        keys: impl IntoIterator<Item = impl Into<Key>>,
    ) -> Result<Vec<(Key, Vec<u8>)>> {
        let mut blobs = Vec::new();
        for key in keys {
            let key = key.into();
            if let Some(content) = self.cas_read(&key)? {
                blobs.push((key, content));
            }
        }
        Ok(blobs)
    }

    /// Write a CAS blob.
    #[instrument(skip(self, content), fields(bytes = content.len()))]
    pub fn cas_write(&self, key: &Key, content: &[u8]) -> Result<()> {
        let url = self.base.join(&format!("api/v1/cas/{key}"))?;
        let request = if self.compress {
            let body = zstd::encode_all(content, 0).context("compress body")?;
            trace!(raw = content.len(), compressed = body.len(), "compressed blob");
            self.http
                .put(url)
                .header(header::CONTENT_ENCODING, "zstd")
                .body(body)
        } else {
            self.http.put(url).body(content.to_vec())
        };

        let response = self.request(request).send().context("send")?;
        match response.status() {
            StatusCode::CREATED | StatusCode::OK => Ok(()),
            status => Err(unexpected_status(status, response)),
        }
    }

    /// Write multiple CAS blobs, skipping those the remote already has.
    #[instrument(skip(self, blobs))]
    pub fn cas_write_batch(&self, blobs: impl IntoIterator<Item = (Key, Vec<u8>)>) -> Result<()> {
        let blobs = blobs.into_iter().collect::<Vec<_>>();
        let present = self
            .cas_exists_batch(blobs.iter().map(|(key, _)| key))?
            .present;
        for (key, content) in blobs {
            if present.contains(&key) {
                trace!(?key, "skipped push: already present");
                continue;
            }
            self.cas_write(&key, &content)?;
        }
        Ok(())
    }

    /// Fetch a target cache entry by fingerprint.
    #[instrument(skip(self))]
    pub fn target_get(&self, fingerprint: &Fingerprint) -> Result<Option<TargetEntry>> {
        self.entry_get("targets", fingerprint)
    }

    /// Store a target cache entry.
    #[instrument(skip(self, entry))]
    pub fn target_put(&self, fingerprint: &Fingerprint, entry: &TargetEntry) -> Result<()> {
        self.entry_put("targets", fingerprint, entry)
    }

    /// Fetch an action cache entry by fingerprint.
    #[instrument(skip(self))]
    pub fn action_get(&self, fingerprint: &Fingerprint) -> Result<Option<ActionEntry>> {
        self.entry_get("actions", fingerprint)
    }

    /// Store an action cache entry.
    #[instrument(skip(self, entry))]
    pub fn action_put(&self, fingerprint: &Fingerprint, entry: &ActionEntry) -> Result<()> {
        self.entry_put("actions", fingerprint, entry)
    }

    fn entry_get<E: serde::de::DeserializeOwned>(
        &self,
        kind: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Option<E>> {
        let url = self
            .base
            .join(&format!("api/v1/cache/{kind}/{fingerprint}"))?;
        let response = self.request(self.http.get(url)).send().context("send")?;
        match response.status() {
            StatusCode::OK => {
                let mut data = response
                    .json::<EntryGetResponse<E>>()
                    .context("parse JSON response")?;
                Ok(data.entries.remove(fingerprint))
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(unexpected_status(status, response)),
        }
    }

    fn entry_put<E: serde::Serialize + Clone>(
        &self,
        kind: &str,
        fingerprint: &Fingerprint,
        entry: &E,
    ) -> Result<()> {
        let url = self.base.join(&format!("api/v1/cache/{kind}"))?;
        let body = EntryPutRequest::new([(fingerprint.clone(), entry.clone())]);
        let response = self
            .request(self.http.post(url))
            .json(&body)
            .send()
            .context("send")?;
        match response.status() {
            StatusCode::CREATED | StatusCode::OK => Ok(()),
            status => Err(unexpected_status(status, response)),
        }
    }
}

/// Convert an unexpected HTTP response into an error report annotated with
/// the URL and body for diagnosis.
fn unexpected_status(status: StatusCode, response: Response) -> color_eyre::Report {
    let url = response.url().to_string();
    let body = response.text().unwrap_or_default();
    eyre!("unexpected status code: {status}")
        .with_section(|| url.header("Url:"))
        .with_section(|| body.header("Body:"))
}
