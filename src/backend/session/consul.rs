use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use reqwest::Method;
use reqwest::RequestBuilder;
use reqwest::Response;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

use super::Indexed;
use super::KvPair;
use super::QueryOptions;
use super::SessionKeyspace;
use crate::Error;
use crate::Result;
use crate::TransportError;

const INDEX_HEADER: &str = "X-Consul-Index";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WirePair {
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    create_index: u64,
    #[serde(default)]
    modify_index: u64,
    #[serde(default)]
    lock_index: u64,
    #[serde(default)]
    session: Option<String>,
}

impl TryFrom<WirePair> for KvPair {
    type Error = Error;

    fn try_from(wire: WirePair) -> Result<Self> {
        let value = match wire.value {
            Some(encoded) => STANDARD.decode(encoded).map_err(|e| {
                Error::Transport(TransportError::Session(format!("undecodable value at {}: {}", wire.key, e)))
            })?,
            None => Vec::new(),
        };
        Ok(KvPair {
            key: wire.key,
            value: Bytes::from(value),
            create_index: wire.create_index,
            modify_index: wire.modify_index,
            lock_index: wire.lock_index,
            session: wire.session,
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SessionRequest {
    #[serde(rename = "TTL")]
    ttl: String,
    behavior: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    checks: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct SessionCreated {
    #[serde(rename = "ID")]
    id: String,
}

/// Consul KV and session endpoints over HTTP.
#[derive(Debug)]
pub struct ConsulApi {
    http: reqwest::Client,
    endpoints: Vec<String>,
    current: AtomicUsize,
    request_timeout: Duration,
}

impl ConsulApi {
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

    async fn send(
        &self,
        method: Method,
        path: &str,
        timeout: Duration,
        build: impl Fn(RequestBuilder) -> RequestBuilder,
    ) -> Result<Response> {
        let start = self.current.load(Ordering::Relaxed);
        let mut last_err = None;

        for attempt in 0..self.endpoints.len() {
            let idx = (start + attempt) % self.endpoints.len();
            let endpoint = &self.endpoints[idx];
            let url = format!("{}/v1/{}", endpoint, path.trim_start_matches('/'));

            match build(self.http.request(method.clone(), url)).timeout(timeout).send().await {
                Ok(resp) => {
                    self.current.store(idx, Ordering::Relaxed);
                    return Ok(resp);
                }
                Err(e) if e.is_connect() => {
                    warn!(%endpoint, "session endpoint unreachable: {}", e);
                    last_err = Some(e);
                }
                Err(e) if e.is_timeout() => return Err(TransportError::Timeout(timeout).into()),
                Err(e) => return Err(e.into()),
            }
        }

        match last_err {
            Some(e) => Err(e.into()),
            None => Err(TransportError::Status(0, "no session endpoints configured".to_string()).into()),
        }
    }

    /// Blocking queries may legitimately run for the whole wait time.
    fn query_timeout(
        &self,
        opts: &QueryOptions,
    ) -> Duration {
        match (opts.wait_index, opts.wait_time) {
            (0, _) | (_, None) => self.request_timeout,
            (_, Some(wait)) => self.request_timeout + wait + wait / 16,
        }
    }

    async fn query(
        &self,
        key: &str,
        recurse: bool,
        opts: &QueryOptions,
    ) -> Result<Indexed<Vec<KvPair>>> {
        let mut params: Vec<(&str, String)> = Vec::new();
        if recurse {
            params.push(("recurse", "true".to_string()));
        }
        if opts.wait_index > 0 {
            params.push(("index", opts.wait_index.to_string()));
            if let Some(wait) = opts.wait_time {
                params.push(("wait", format!("{}s", wait.as_secs().max(1))));
            }
        }

        let resp = self
            .send(Method::GET, &format!("kv/{key}"), self.query_timeout(opts), |req| {
                req.query(&params)
            })
            .await?;

        let index = resp
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Indexed { value: Vec::new(), index });
        }

        let wire: Vec<WirePair> = checked(resp).await?.json().await?;
        let value = wire.into_iter().map(KvPair::try_from).collect::<Result<Vec<_>>>()?;
        Ok(Indexed { value, index })
    }

    async fn flag(
        &self,
        method: Method,
        path: &str,
        build: impl Fn(RequestBuilder) -> RequestBuilder,
    ) -> Result<bool> {
        let resp = self.send(method, path, self.request_timeout, build).await?;
        let body = checked(resp).await?.text().await?;
        Ok(body.trim() == "true")
    }
}

async fn checked(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(Error::Transport(TransportError::Status(status.as_u16(), body)))
}

#[async_trait]
impl SessionKeyspace for ConsulApi {
    async fn get(
        &self,
        key: &str,
        opts: QueryOptions,
    ) -> Result<Indexed<Option<KvPair>>> {
        let Indexed { value, index } = self.query(key, false, &opts).await?;
        Ok(Indexed {
            value: value.into_iter().find(|p| p.key == key),
            index,
        })
    }

    async fn list(
        &self,
        prefix: &str,
        opts: QueryOptions,
    ) -> Result<Indexed<Vec<KvPair>>> {
        self.query(prefix, true, &opts).await
    }

    async fn put(
        &self,
        key: &str,
        value: Bytes,
    ) -> Result<()> {
        if !self
            .flag(Method::PUT, &format!("kv/{key}"), |req| req.body(value.clone()))
            .await?
        {
            return Err(Error::Transport(TransportError::Session(format!("write refused at {key}"))));
        }
        Ok(())
    }

    async fn delete(
        &self,
        key: &str,
    ) -> Result<()> {
        self.flag(Method::DELETE, &format!("kv/{key}"), |req| req).await?;
        Ok(())
    }

    async fn delete_tree(
        &self,
        prefix: &str,
    ) -> Result<()> {
        self.flag(Method::DELETE, &format!("kv/{prefix}"), |req| req.query(&[("recurse", "true")]))
            .await?;
        Ok(())
    }

    async fn acquire(
        &self,
        key: &str,
        value: Bytes,
        session: &str,
    ) -> Result<bool> {
        self.flag(Method::PUT, &format!("kv/{key}"), |req| {
            req.query(&[("acquire", session)]).body(value.clone())
        })
        .await
    }

    async fn release(
        &self,
        key: &str,
        session: &str,
    ) -> Result<bool> {
        self.flag(Method::PUT, &format!("kv/{key}"), |req| req.query(&[("release", session)]))
            .await
    }

    async fn session_create(
        &self,
        ttl: Duration,
        with_checks: bool,
    ) -> Result<String> {
        let body = SessionRequest {
            ttl: format!("{}s", ttl.as_secs().max(1)),
            behavior: "release",
            checks: if with_checks { None } else { Some(Vec::new()) },
        };
        let resp = self
            .send(Method::PUT, "session/create", self.request_timeout, |req| req.json(&body))
            .await?;
        let created: SessionCreated = checked(resp).await?.json().await?;
        Ok(created.id)
    }

    async fn session_renew(
        &self,
        id: &str,
    ) -> Result<bool> {
        let resp = self
            .send(Method::PUT, &format!("session/renew/{id}"), self.request_timeout, |req| req)
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        checked(resp).await?;
        Ok(true)
    }

    async fn session_destroy(
        &self,
        id: &str,
    ) -> Result<()> {
        self.flag(Method::PUT, &format!("session/destroy/{id}"), |req| req).await?;
        Ok(())
    }
}
