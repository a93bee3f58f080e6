use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use reqwest::RequestBuilder;
use reqwest::Response;
use tracing::debug;
use tracing::warn;

use super::CasKeyspace;
use super::CasResponse;
use super::DeleteOptions;
use super::GetOptions;
use super::PrevExist;
use super::SetOptions;
use super::WatchOptions;
use crate::CasError;
use crate::Error;
use crate::Result;
use crate::TransportError;

const INDEX_HEADER: &str = "X-Etcd-Index";

/// etcd v2 keys API over HTTP.
///
/// Requests go to the last endpoint that answered; a connection failure
/// rotates to the next one. Watches are long polls with no request timeout.
#[derive(Debug)]
pub struct EtcdKeysApi {
    http: reqwest::Client,
    endpoints: Vec<String>,
    current: AtomicUsize,
    request_timeout: Duration,
}

impl EtcdKeysApi {
    pub fn new(
        endpoints: Vec<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            endpoints: endpoints
                .into_iter()
                .map(|e| e.trim_end_matches('/').to_string())
                .collect(),
            current: AtomicUsize::new(0),
            request_timeout,
        })
    }

    fn url(
        endpoint: &str,
        key: &str,
    ) -> String {
        format!("{}/v2/keys/{}", endpoint, key.trim_start_matches('/'))
    }

    async fn send(
        &self,
        method: Method,
        key: &str,
        timeout: Option<Duration>,
        build: impl Fn(RequestBuilder) -> RequestBuilder,
    ) -> Result<CasResponse> {
        let start = self.current.load(Ordering::Relaxed);
        let mut last_err = None;

        for attempt in 0..self.endpoints.len() {
            let idx = (start + attempt) % self.endpoints.len();
            let endpoint = &self.endpoints[idx];

            let mut req = build(self.http.request(method.clone(), Self::url(endpoint, key)));
            if let Some(timeout) = timeout {
                req = req.timeout(timeout);
            }

            match req.send().await {
                Ok(resp) => {
                    self.current.store(idx, Ordering::Relaxed);
                    return Self::decode(resp).await;
                }
                Err(e) if e.is_connect() => {
                    warn!(%endpoint, "cas endpoint unreachable: {}", e);
                    last_err = Some(e);
                }
                Err(e) if e.is_timeout() => {
                    return Err(TransportError::Timeout(timeout.unwrap_or_default()).into());
                }
                Err(e) => return Err(e.into()),
            }
        }

        match last_err {
            Some(e) => Err(e.into()),
            None => Err(TransportError::Status(0, "no cas endpoints configured".to_string()).into()),
        }
    }

    async fn decode(resp: Response) -> Result<CasResponse> {
        let index = resp
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();
        let status = resp.status();
        let body = resp.bytes().await?;

        if status.is_success() {
            let mut decoded: CasResponse = serde_json::from_slice(&body)?;
            decoded.index = index;
            return Ok(decoded);
        }

        match serde_json::from_slice::<CasError>(&body) {
            Ok(e) => {
                debug!(code = e.code, cause = %e.cause, "cas request refused");
                Err(e.into())
            }
            Err(_) => Err(Error::Transport(TransportError::Status(
                status.as_u16(),
                String::from_utf8_lossy(&body).into_owned(),
            ))),
        }
    }
}

fn flag(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

#[async_trait]
impl CasKeyspace for EtcdKeysApi {
    async fn get(
        &self,
        key: &str,
        opts: GetOptions,
    ) -> Result<CasResponse> {
        self.send(Method::GET, key, Some(self.request_timeout), |req| {
            req.query(&[("recursive", flag(opts.recursive)), ("sorted", flag(opts.sorted))])
        })
        .await
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        opts: SetOptions,
    ) -> Result<CasResponse> {
        let mut form: Vec<(&str, String)> = Vec::new();
        if opts.dir {
            form.push(("dir", "true".to_string()));
        } else {
            form.push(("value", value.to_string()));
        }
        if let Some(prev_exist) = opts.prev_exist {
            form.push(("prevExist", flag(prev_exist == PrevExist::Exist).to_string()));
        }
        if let Some(prev_value) = &opts.prev_value {
            form.push(("prevValue", prev_value.clone()));
        }
        if let Some(ttl) = opts.ttl {
            form.push(("ttl", ttl.as_secs_f64().ceil().max(1.0).to_string()));
        }

        self.send(Method::PUT, key, Some(self.request_timeout), |req| req.form(&form))
            .await
    }

    async fn delete(
        &self,
        key: &str,
        opts: DeleteOptions,
    ) -> Result<CasResponse> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(prev_value) = &opts.prev_value {
            query.push(("prevValue", prev_value.clone()));
        }
        if opts.recursive {
            query.push(("recursive", "true".to_string()));
        }
        if opts.dir {
            query.push(("dir", "true".to_string()));
        }

        self.send(Method::DELETE, key, Some(self.request_timeout), |req| req.query(&query))
            .await
    }

    async fn watch(
        &self,
        key: &str,
        opts: WatchOptions,
    ) -> Result<CasResponse> {
        let mut query = vec![
            ("wait", "true".to_string()),
            ("recursive", flag(opts.recursive).to_string()),
        ];
        if opts.wait_index > 0 {
            query.push(("waitIndex", opts.wait_index.to_string()));
        }

        self.send(Method::GET, key, None, |req| req.query(&query)).await
    }

    async fn index(&self) -> Result<u64> {
        Ok(self.get("/", GetOptions::default()).await?.index)
    }
}
