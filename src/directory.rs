//! Client for the call directory service: call records plus relay of
//! offers, answers and candidates. Payloads are passed through untouched.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{CallError, Result};
use crate::http_retry::send_with_retry;
use crate::peer::types::{IceCandidate, SessionDescription};
use crate::session::CallId;

const RETRY_ATTEMPTS: u32 = 3;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[async_trait]
pub trait Directory: Send + Sync {
    async fn create_call(&self, target: &str) -> Result<CallId>;

    async fn submit_offer(&self, call_id: &CallId, offer: &SessionDescription) -> Result<()>;

    async fn submit_answer(&self, call_id: &CallId, answer: &SessionDescription) -> Result<()>;

    async fn submit_candidate(
        &self,
        call_id: &CallId,
        target: &str,
        candidate: &IceCandidate,
    ) -> Result<()>;

    async fn reject(&self, call_id: &CallId) -> Result<()>;

    async fn end(&self, call_id: &CallId) -> Result<()>;
}

pub fn create_body(target: &str) -> Value {
    json!({ "recipientId": target })
}

pub fn offer_body(call_id: &CallId, offer: &SessionDescription) -> Value {
    json!({ "callId": call_id, "offer": offer })
}

pub fn answer_body(call_id: &CallId, answer: &SessionDescription) -> Value {
    json!({ "callId": call_id, "answer": answer })
}

pub fn candidate_body(call_id: &CallId, target: &str, candidate: &IceCandidate) -> Value {
    json!({
        "profileId": target,
        "callId": call_id,
        "iceCandidate": {
            "candidate": candidate.candidate,
            "sdpMid": candidate.sdp_mid,
            "sdpMLineIndex": candidate.sdp_mline_index,
        },
    })
}

pub fn call_id_body(call_id: &CallId) -> Value {
    json!({ "callId": call_id })
}

/// Reads the new call's id from `id`, `callId` or `data.id`.
pub fn parse_call_id(body: &Value) -> Option<CallId> {
    let as_id = |v: &Value| match v {
        Value::String(s) if !s.trim().is_empty() => Some(CallId::new(s.trim())),
        Value::Number(n) => Some(CallId::new(n.to_string())),
        _ => None,
    };
    body.get("id")
        .and_then(as_id)
        .or_else(|| body.get("callId").and_then(as_id))
        .or_else(|| body.get("data").and_then(|d| d.get("id")).and_then(as_id))
}

/// Directory over HTTP/JSON.
pub struct HttpDirectory {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
    candidate_path: String,
}

impl HttpDirectory {
    pub fn new(
        base: impl Into<String>,
        token: Option<String>,
        candidate_path: impl Into<String>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CallError::Config(format!("http client: {e}")))?;
        Ok(Self {
            http,
            base: base.into().trim_end_matches('/').to_owned(),
            token: token.filter(|t| !t.trim().is_empty()),
            candidate_path: candidate_path.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn request(&self, method: Method, path: &str, body: &Value) -> RequestBuilder {
        let mut req = self.http.request(method, self.url(path)).json(body);
        if let Some(tok) = &self.token {
            req = req.bearer_auth(tok);
        }
        req
    }

    async fn send(&self, method: Method, path: &str, body: Value, retry: bool) -> Result<Response> {
        debug!(%method, path, "directory request");
        let resp = if retry {
            send_with_retry(|| self.request(method.clone(), path, &body), RETRY_ATTEMPTS).await
        } else {
            self.request(method.clone(), path, &body).send().await
        }
        .map_err(|e| CallError::DirectoryUnavailable(format!("{method} {path}: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(CallError::DirectoryUnavailable(format!(
                "{method} {path}: {status} {text}"
            )));
        }
        Ok(resp)
    }
}

#[async_trait]
impl Directory for HttpDirectory {
    async fn create_call(&self, target: &str) -> Result<CallId> {
        // not idempotent: a retry could create a second call record
        let resp = self.send(Method::POST, "/", create_body(target), false).await?;
        let body: Value = resp
            .json()
            .await
            .map_err(|e| CallError::DirectoryUnavailable(format!("create call response: {e}")))?;
        parse_call_id(&body).ok_or_else(|| {
            CallError::DirectoryUnavailable(format!("create call returned no id: {body}"))
        })
    }

    async fn submit_offer(&self, call_id: &CallId, offer: &SessionDescription) -> Result<()> {
        self.send(Method::PUT, "/", offer_body(call_id, offer), true)
            .await
            .map(drop)
    }

    async fn submit_answer(&self, call_id: &CallId, answer: &SessionDescription) -> Result<()> {
        self.send(Method::PUT, "/accept", answer_body(call_id, answer), true)
            .await
            .map(drop)
    }

    async fn submit_candidate(
        &self,
        call_id: &CallId,
        target: &str,
        candidate: &IceCandidate,
    ) -> Result<()> {
        self.send(
            Method::POST,
            &self.candidate_path,
            candidate_body(call_id, target, candidate),
            true,
        )
        .await
        .map(drop)
    }

    async fn reject(&self, call_id: &CallId) -> Result<()> {
        self.send(Method::PUT, "/reject", call_id_body(call_id), true)
            .await
            .map(drop)
    }

    async fn end(&self, call_id: &CallId) -> Result<()> {
        self.send(Method::PUT, "/end", call_id_body(call_id), true)
            .await
            .map(drop)
    }
}
