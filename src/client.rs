//! Signed request pipeline.
//!
//! Every RTM call is an HTTP GET against the REST endpoint with the
//! parameters in the query string, signed with the shared secret.  The
//! pipeline canonicalises and signs the parameters, takes a rate-limiter
//! token, dispatches the request, and normalises RTM's in-band error
//! reporting into [`Error`] values.

use std::sync::RwLock;

use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;

use crate::config::Perms;
use crate::error::{Error, Result};
use crate::protocol::{RspStatus, RtmResponse, Stat};
use crate::ratelimit::RateLimiter;

static MILK_REST_URL: &str = "https://api.rememberthemilk.com/services/rest/";
static MILK_AUTH_URL: &str = "https://www.rememberthemilk.com/services/auth/";

/// Parameters the pipeline owns; callers supplying one is a programming
/// error surfaced as [`Error::InvalidArguments`].
const RESERVED_PARAMS: [&str; 5] = ["method", "api_key", "format", "auth_token", "api_sig"];

/// Low-level RTM API client.
///
/// Safe for concurrent callers: per-call state is stack-local and the only
/// shared collaborators are the rate limiter and the token slot.
pub struct RtmClient {
    api_key: String,
    api_secret: String,
    token: RwLock<Option<String>>,
    http: reqwest::Client,
    limiter: RateLimiter,
    rest_url: Url,
    auth_url: Url,
}

impl RtmClient {
    /// Create a client for the production RTM endpoints.
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Result<RtmClient> {
        RtmClient::with_endpoints(
            api_key,
            api_secret,
            MILK_REST_URL,
            MILK_AUTH_URL,
            RateLimiter::default(),
        )
    }

    /// Create a client against explicit endpoints with a custom limiter.
    /// Used by tests that stand in for RTM with a local HTTP double.
    pub(crate) fn with_endpoints(
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        rest_url: &str,
        auth_url: &str,
        limiter: RateLimiter,
    ) -> Result<RtmClient> {
        let rest_url = Url::parse(rest_url)
            .map_err(|e| Error::Config(format!("invalid REST endpoint {rest_url:?}: {e}")))?;
        let auth_url = Url::parse(auth_url)
            .map_err(|e| Error::Config(format!("invalid auth endpoint {auth_url:?}: {e}")))?;
        Ok(RtmClient {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            token: RwLock::new(None),
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()?,
            limiter,
            rest_url,
            auth_url,
        })
    }

    /// The rate limiter gating this client's outbound calls.
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Install an auth token for subsequent calls.
    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write().expect("token lock poisoned") = Some(token.into());
    }

    /// Forget the auth token.
    pub fn clear_token(&self) {
        *self.token.write().expect("token lock poisoned") = None;
    }

    /// The current auth token, if one is installed.
    pub fn token(&self) -> Option<String> {
        self.token.read().expect("token lock poisoned").clone()
    }

    /// Whether an auth token is installed (verified or not).
    pub fn has_token(&self) -> bool {
        self.token.read().expect("token lock poisoned").is_some()
    }

    /// Sign a parameter set.
    ///
    /// Keys are sorted bytewise, concatenated with their raw (unencoded)
    /// values after the shared secret, and digested with MD5; RTM dictates
    /// both the scheme and the hash.  The digest is 32 lowercase hex
    /// characters.
    fn sign_params(&self, params: &[(String, String)]) -> String {
        let mut sorted = params.iter().collect::<Vec<&(String, String)>>();
        sorted.sort();
        let mut to_sign = self.api_secret.clone();
        for &(ref k, ref v) in sorted {
            to_sign += k;
            to_sign += v;
        }
        let digest = md5::compute(to_sign.as_bytes());
        format!("{:x}", digest)
    }

    /// The browser authorisation URL for a frob:
    /// `https://www.rememberthemilk.com/services/auth/?api_key=…&perms=…&frob=…&api_sig=…`.
    pub fn auth_url_for_frob(&self, perms: Perms, frob: &str) -> String {
        let params = vec![
            ("api_key".to_string(), self.api_key.clone()),
            ("perms".to_string(), perms.as_str().to_string()),
            ("frob".to_string(), frob.to_string()),
        ];
        let sig = self.sign_params(&params);
        let mut url = self.auth_url.clone();
        {
            let mut query = url.query_pairs_mut();
            for (k, v) in &params {
                query.append_pair(k, v);
            }
            query.append_pair("api_sig", &sig);
        }
        url.into()
    }

    /// Issue a signed call and return the typed `rsp` payload.
    ///
    /// The pipeline augments `params` with `method`, `api_key`,
    /// `format=json` and, when installed, `auth_token`, then signs the
    /// result.  A `stat="fail"` envelope becomes [`Error::Rtm`]; envelope
    /// or payload parse failures become [`Error::InvalidResponse`].
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<(String, String)>,
    ) -> Result<T> {
        if method.is_empty() {
            return Err(Error::InvalidArguments("method name is empty".into()));
        }
        if let Some((key, _)) = params
            .iter()
            .find(|(k, _)| RESERVED_PARAMS.contains(&k.as_str()))
        {
            return Err(Error::InvalidArguments(format!(
                "parameter {key:?} is set by the request pipeline"
            )));
        }

        let mut all = params;
        all.push(("method".into(), method.into()));
        all.push(("api_key".into(), self.api_key.clone()));
        all.push(("format".into(), "json".into()));
        if let Some(token) = self.token() {
            all.push(("auth_token".into(), token));
        }
        let sig = self.sign_params(&all);
        all.push(("api_sig".into(), sig));

        let body = self.dispatch(&all).await?;
        let status: RtmResponse<RspStatus> = serde_json::from_str(&body)
            .map_err(|e| Error::InvalidResponse(format!("malformed {method} envelope: {e}")))?;
        if status.rsp.stat == Stat::Fail {
            let (code, msg) = match status.rsp.err {
                Some(err) => (err.code, err.msg),
                None => (-1, "unknown RTM error".to_string()),
            };
            log::debug!("{method} failed with RTM error {code}: {msg}");
            return Err(Error::Rtm { code, msg });
        }

        let payload: RtmResponse<T> = serde_json::from_str(&body)
            .map_err(|e| Error::InvalidResponse(format!("unexpected {method} payload: {e}")))?;
        Ok(payload.rsp)
    }

    /// Rate-limit, send, and read one GET request.
    async fn dispatch(&self, params: &[(String, String)]) -> Result<String> {
        self.limiter.acquire().await?;
        let response = self
            .http
            .get(self.rest_url.clone())
            .query(params)
            .send()
            .await?;
        if response.status() == StatusCode::SERVICE_UNAVAILABLE {
            return Err(Error::RateLimited(
                "RTM returned 503 Service Unavailable".into(),
            ));
        }
        let response = response.error_for_status()?;
        Ok(response.text().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> RtmClient {
        RtmClient::with_endpoints(
            "key",
            "BANANAS",
            "http://localhost:1/",
            "http://localhost:1/auth/",
            RateLimiter::default(),
        )
        .unwrap()
    }

    #[test]
    fn signature_matches_rtm_documented_example() {
        let client = test_client();
        let params = vec![
            ("yxz".to_string(), "foo".to_string()),
            ("feg".to_string(), "bar".to_string()),
            ("abc".to_string(), "baz".to_string()),
        ];
        // Canonical concatenation is BANANASabcbazfegbaryxzfoo.
        assert_eq!(
            client.sign_params(&params),
            "82044aae4dd676094f23f1ec152159ba"
        );
    }

    #[test]
    fn signature_is_insertion_order_independent() {
        let client = test_client();
        let forward = vec![
            ("abc".to_string(), "baz".to_string()),
            ("feg".to_string(), "bar".to_string()),
            ("yxz".to_string(), "foo".to_string()),
        ];
        let mut shuffled = forward.clone();
        shuffled.swap(0, 2);
        shuffled.swap(1, 2);
        assert_eq!(client.sign_params(&forward), client.sign_params(&shuffled));
    }

    #[test]
    fn auth_url_carries_signed_parameters() {
        let client = test_client();
        let url = client.auth_url_for_frob(Perms::Delete, "F1");
        assert!(url.starts_with("http://localhost:1/auth/?"));
        assert!(url.contains("api_key=key"));
        assert!(url.contains("perms=delete"));
        assert!(url.contains("frob=F1"));
        let sig = url.split("api_sig=").nth(1).unwrap();
        assert_eq!(sig.len(), 32);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn reserved_parameters_are_rejected() {
        let client = test_client();
        let err = client
            .call::<serde_json::Value>(
                "rtm.test.echo",
                vec![("api_sig".to_string(), "0".repeat(32))],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArguments(_)));
    }
}
