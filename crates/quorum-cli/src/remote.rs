//! HTTP adapters for the external collaborators.
//!
//! [`HttpVaultNode`] speaks a node's `/v1/sys/*` API and [`ConsulBackend`]
//! speaks the Consul HTTP API (`/v1/kv`, `/v1/session`, `/v1/status`).

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use quorum_core::backend::{
    ConsensusBackend, ConsensusStatus, EncryptedShare, InitOutput, InitRequest, LockToken,
    RootCredential, SealStatus, SecretEngine, ShareValue,
};
use quorum_core::cluster::NodeSpec;
use quorum_core::error::{BackendError, EngineError};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Consul drops the lock session if the holder disappears for this long.
const LOCK_SESSION_TTL: &str = "600s";

// ── Node engine ──────────────────────────────────────────────────────

#[derive(Serialize)]
struct InitRecipient<'a> {
    label: &'a str,
    public_key: String,
}

#[derive(Serialize)]
struct InitBody<'a> {
    recipients: Vec<InitRecipient<'a>>,
    threshold: u8,
}

#[derive(Deserialize)]
struct InitShare {
    index: u8,
    recipient: String,
    ciphertext: String,
}

#[derive(Deserialize)]
struct InitResponse {
    shares: Vec<InitShare>,
    root_token: String,
}

/// Seal status body returned by `/v1/sys/seal-status` and `/v1/sys/unseal`.
///
/// Unseal responses omit `initialized` and `shares`. Vault-style `t`/`n`
/// names are accepted as well.
#[derive(Deserialize)]
struct SealStatusBody {
    initialized: Option<bool>,
    sealed: bool,
    #[serde(default, alias = "t")]
    threshold: u8,
    #[serde(default, alias = "n")]
    shares: u8,
    #[serde(default)]
    progress: u8,
}

impl SealStatusBody {
    /// `initialized` falls back to `answered_unseal`: a node that accepted
    /// an unseal call has been initialized.
    fn into_status(self, answered_unseal: bool) -> SealStatus {
        SealStatus {
            initialized: self.initialized.unwrap_or(answered_unseal),
            sealed: self.sealed,
            threshold: self.threshold,
            shares: self.shares,
            progress: self.progress,
        }
    }
}

impl InitResponse {
    fn into_output(self) -> Result<InitOutput, EngineError> {
        let shares = self
            .shares
            .into_iter()
            .map(|s| {
                let ciphertext =
                    hex::decode(&s.ciphertext).map_err(|e| EngineError::Internal {
                        reason: format!("share {} is not hex: {e}", s.index),
                    })?;
                Ok(EncryptedShare {
                    index: s.index,
                    recipient: s.recipient,
                    ciphertext,
                })
            })
            .collect::<Result<Vec<_>, EngineError>>()?;
        Ok(InitOutput {
            shares,
            root_credential: RootCredential::new(self.root_token),
        })
    }
}

/// One node's engine reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpVaultNode {
    spec: NodeSpec,
    http: reqwest::Client,
}

impl HttpVaultNode {
    #[must_use]
    pub fn new(spec: NodeSpec, http: reqwest::Client) -> Self {
        Self { spec, http }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.spec.address.trim_end_matches('/'))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<String, EngineError> {
        let resp = request
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| EngineError::Unavailable {
                reason: format!("{}: {e}", self.spec.name),
            })?;
        let status = resp.status();
        let body = resp.text().await.map_err(|e| EngineError::Unavailable {
            reason: format!("{}: failed to read response body: {e}", self.spec.name),
        })?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(engine_error(status, &body))
        }
    }
}

/// Map an engine's error response onto the engine contract.
fn engine_error(status: StatusCode, body: &str) -> EngineError {
    let lower = body.to_ascii_lowercase();
    match status {
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => EngineError::PermissionDenied,
        StatusCode::SERVICE_UNAVAILABLE if lower.contains("sealed") => EngineError::Sealed,
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY => EngineError::Unavailable {
            reason: format!("server returned {status}"),
        },
        StatusCode::BAD_REQUEST | StatusCode::CONFLICT if lower.contains("already initialized") => {
            EngineError::AlreadyInitialized
        }
        StatusCode::BAD_REQUEST if lower.contains("not initialized") => {
            EngineError::NotInitialized
        }
        StatusCode::BAD_REQUEST if lower.contains("share") || lower.contains("key") => {
            EngineError::InvalidShare {
                reason: body.to_owned(),
            }
        }
        StatusCode::BAD_REQUEST => EngineError::InvalidRequest {
            reason: body.to_owned(),
        },
        _ => EngineError::Internal {
            reason: format!("server returned {status}: {body}"),
        },
    }
}

fn parse_body<T: for<'de> Deserialize<'de>>(body: &str) -> Result<T, EngineError> {
    serde_json::from_str(body).map_err(|e| EngineError::Internal {
        reason: format!("failed to parse response JSON: {e}"),
    })
}

#[async_trait::async_trait]
impl SecretEngine for HttpVaultNode {
    async fn initialize(&self, request: &InitRequest) -> Result<InitOutput, EngineError> {
        let body = InitBody {
            recipients: request
                .recipients
                .iter()
                .map(|r| InitRecipient {
                    label: r.label(),
                    public_key: hex::encode(r.public_key()),
                })
                .collect(),
            threshold: request.threshold,
        };
        let resp = self
            .send(self.http.post(self.url("/v1/sys/init")).json(&body))
            .await?;
        parse_body::<InitResponse>(&resp)?.into_output()
    }

    async fn seal_status(&self) -> Result<SealStatus, EngineError> {
        let resp = self
            .send(self.http.get(self.url("/v1/sys/seal-status")))
            .await?;
        parse_body::<SealStatusBody>(&resp).map(|b| b.into_status(false))
    }

    async fn unseal(&self, share: &ShareValue) -> Result<SealStatus, EngineError> {
        let key = zeroize::Zeroizing::new(BASE64.encode(share.as_bytes()));
        let resp = self
            .send(
                self.http
                    .post(self.url("/v1/sys/unseal"))
                    .json(&json!({ "share": key.as_str() })),
            )
            .await?;
        parse_body::<SealStatusBody>(&resp).map(|b| b.into_status(true))
    }

    async fn write_policy(
        &self,
        credential: &RootCredential,
        name: &str,
        document: &str,
    ) -> Result<(), EngineError> {
        self.send(
            self.http
                .post(self.url(&format!("/v1/sys/policy/{name}")))
                .header("X-Vault-Token", credential.expose())
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(document.to_owned()),
        )
        .await?;
        debug!(node = %self.spec.name, policy = name, "policy written");
        Ok(())
    }
}

// ── Consul ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SessionCreated {
    #[serde(rename = "ID")]
    id: String,
}

/// The consensus store, reached through the Consul HTTP API.
#[derive(Debug, Clone)]
pub struct ConsulBackend {
    addr: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl ConsulBackend {
    #[must_use]
    pub fn new(addr: impl Into<String>, token: Option<String>, http: reqwest::Client) -> Self {
        let addr: String = addr.into();
        Self {
            addr: addr.trim_end_matches('/').to_owned(),
            token,
            http,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}{path}", self.addr))
            .timeout(REQUEST_TIMEOUT);
        match &self.token {
            Some(token) => builder.header("X-Consul-Token", token),
            None => builder,
        }
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<(StatusCode, Vec<u8>), BackendError> {
        let resp = request
            .send()
            .await
            .map_err(|e| BackendError::Unavailable {
                reason: e.to_string(),
            })?;
        let status = resp.status();
        let body = resp.bytes().await.map_err(|e| BackendError::Unavailable {
            reason: format!("failed to read response body: {e}"),
        })?;
        Ok((status, body.to_vec()))
    }

    async fn expect_success(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<Vec<u8>, BackendError> {
        let (status, body) = self.send(request).await?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(BackendError::InvalidResponse {
                reason: format!("consul returned {status}: {}", String::from_utf8_lossy(&body)),
            })
        }
    }

    async fn kv_flag(&self, request: reqwest::RequestBuilder) -> Result<bool, BackendError> {
        let body = self.expect_success(request).await?;
        serde_json::from_slice(&body).map_err(|e| BackendError::InvalidResponse {
            reason: format!("expected true/false: {e}"),
        })
    }
}

#[async_trait::async_trait]
impl ConsensusBackend for ConsulBackend {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        let (status, body) = self
            .send(self.request(reqwest::Method::GET, &format!("/v1/kv/{key}?raw")))
            .await?;
        match status {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(body)),
            s => Err(BackendError::InvalidResponse {
                reason: format!("consul returned {s} reading '{key}'"),
            }),
        }
    }

    async fn write(&self, key: &str, value: &[u8]) -> Result<(), BackendError> {
        let stored = self
            .kv_flag(
                self.request(reqwest::Method::PUT, &format!("/v1/kv/{key}"))
                    .body(value.to_vec()),
            )
            .await?;
        if stored {
            Ok(())
        } else {
            Err(BackendError::InvalidResponse {
                reason: format!("consul refused write to '{key}'"),
            })
        }
    }

    async fn acquire_lock(&self, name: &str) -> Result<Option<LockToken>, BackendError> {
        let lock_err = |reason: String| BackendError::Lock {
            name: name.to_owned(),
            reason,
        };
        let body = self
            .expect_success(self.request(reqwest::Method::PUT, "/v1/session/create").json(
                &json!({ "Name": format!("quorumctl {name}"), "TTL": LOCK_SESSION_TTL, "Behavior": "release" }),
            ))
            .await?;
        let session: SessionCreated =
            serde_json::from_slice(&body).map_err(|e| lock_err(format!("bad session: {e}")))?;

        let acquired = self
            .kv_flag(self.request(
                reqwest::Method::PUT,
                &format!("/v1/kv/{name}?acquire={}", session.id),
            ))
            .await?;
        if acquired {
            debug!(lock = name, "lock acquired");
            return Ok(Some(LockToken(session.id)));
        }

        self.expect_success(self.request(
            reqwest::Method::PUT,
            &format!("/v1/session/destroy/{}", session.id),
        ))
        .await?;
        Ok(None)
    }

    async fn release_lock(&self, name: &str, token: &LockToken) -> Result<(), BackendError> {
        let released = self
            .kv_flag(self.request(
                reqwest::Method::PUT,
                &format!("/v1/kv/{name}?release={}", token.0),
            ))
            .await?;
        self.expect_success(self.request(
            reqwest::Method::PUT,
            &format!("/v1/session/destroy/{}", token.0),
        ))
        .await?;
        if released {
            Ok(())
        } else {
            Err(BackendError::Lock {
                name: name.to_owned(),
                reason: "lock is not held by this session".to_owned(),
            })
        }
    }

    async fn status(&self) -> Result<ConsensusStatus, BackendError> {
        let peers = self
            .expect_success(self.request(reqwest::Method::GET, "/v1/status/peers"))
            .await?;
        let peers: Vec<String> =
            serde_json::from_slice(&peers).map_err(|e| BackendError::InvalidResponse {
                reason: format!("bad peer list: {e}"),
            })?;
        let leader = self
            .expect_success(self.request(reqwest::Method::GET, "/v1/status/leader"))
            .await?;
        let leader: String = serde_json::from_slice(&leader).unwrap_or_default();

        Ok(ConsensusStatus {
            peers: peers.len().saturating_sub(1),
            leader: Some(leader).filter(|l| !l.is_empty()),
        })
    }
}
