//! The Docker Registry v2 HTTP client: endpoint discovery, auth, manifest
//! and blob operations. This is the one transport that talks to the
//! network, so it carries the bulk of the retry, auth-refresh, and
//! reconnect logic; every other transport in this crate is comparatively a
//! thin file-format reader/writer.

use super::auth::{self, BasicCredentials, BearerToken, Scope};
use super::bodyreader::{self, ResumeState};
use super::config::HostConfigTable;
use super::error::{self, RegistryError};
use crate::blobinfo::BlobInfo;
use crate::digest::{verify, Digest};
use crate::manifest::{
    MT_DOCKER_SCHEMA1_SIGNED, MT_DOCKER_SCHEMA2, MT_DOCKER_SCHEMA2_LIST, MT_OCI1_INDEX,
    MT_OCI1_MANIFEST,
};
use crate::transport::{BlobStream, TransportError};
use bytes::Bytes;
use futures_util::StreamExt;
use moka::sync::Cache as MokaCache;
use reqwest::{header, StatusCode};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;

/// Deterministic Accept order for manifest GETs: most to least preferred.
/// Listing OCI index/manifest first matters when talking to a registry
/// that returns the first type it also supports from a repository storing
/// multiple representations of the same digest.
pub const MANIFEST_ACCEPT_ORDER: &[&str] = &[
    MT_OCI1_INDEX,
    MT_OCI1_MANIFEST,
    MT_DOCKER_SCHEMA2_LIST,
    MT_DOCKER_SCHEMA2,
    MT_DOCKER_SCHEMA1_SIGNED,
];

const RETRY_BACKOFFS: &[Duration] = &[
    Duration::from_millis(200),
    Duration::from_millis(800),
    Duration::from_secs(3),
];

pub struct Client {
    http: reqwest::Client,
    scheme_host: String,
    repository: String,
    credentials: Option<BasicCredentials>,
    token_cache: MokaCache<String, BearerToken>,
    user_agent: String,
    /// Every scope this connection has ever been challenged for, so a later
    /// `insufficient_scope` retry can request a token covering all of them
    /// at once rather than thrashing between single-scope tokens.
    scopes: Mutex<BTreeSet<Scope>>,
}

pub struct ClientBuilder {
    domain: String,
    repository: String,
    credentials: Option<BasicCredentials>,
    host_configs: HostConfigTable,
    user_agent: String,
}

impl ClientBuilder {
    pub fn new(domain: impl Into<String>, repository: impl Into<String>) -> Self {
        ClientBuilder {
            domain: domain.into(),
            repository: repository.into(),
            credentials: None,
            host_configs: HostConfigTable::new(),
            user_agent: "oci-transport/0.1".to_string(),
        }
    }

    pub fn credentials(mut self, creds: BasicCredentials) -> Self {
        self.credentials = Some(creds);
        self
    }

    pub fn host_configs(mut self, table: HostConfigTable) -> Self {
        self.host_configs = table;
        self
    }

    /// Probe `https://domain` and, if that fails and the resolved host
    /// config allows it, fall back to `http://domain`. A registry behind a
    /// broken TLS cert with `insecure = true` configured is the only case
    /// this plaintext fallback exists for; it is never attempted silently.
    pub async fn discover(self) -> Result<Client, TransportError> {
        let host_config = self.host_configs.resolve(&self.domain);
        let mut builder = reqwest::Client::builder().user_agent(self.user_agent.clone());
        if let Some(ca) = &host_config.ca_file {
            if let Ok(bytes) = std::fs::read(ca) {
                if let Ok(cert) = reqwest::Certificate::from_pem(&bytes) {
                    builder = builder.add_root_certificate(cert);
                }
            }
        }
        if host_config.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder
            .build()
            .map_err(|e| TransportError::Docker(RegistryError::Http(e.to_string())))?;

        let https_base = format!("https://{}", self.domain);
        let ping = format!("{https_base}/v2/");
        let mut scheme_host = https_base;
        if http.get(&ping).send().await.is_err() {
            if !host_config.insecure {
                return Err(TransportError::Docker(RegistryError::NoReachableEndpoint(vec![
                    ping,
                ])));
            }
            scheme_host = format!("http://{}", self.domain);
        }

        Ok(Client {
            http,
            scheme_host,
            repository: self.repository,
            credentials: self.credentials,
            token_cache: MokaCache::builder()
                .max_capacity(64)
                .time_to_live(Duration::from_secs(3600))
                .build(),
            user_agent: self.user_agent,
            scopes: Mutex::new(BTreeSet::new()),
        })
    }
}

impl Client {
    fn manifest_url(&self, reference: &str) -> String {
        format!("{}/v2/{}/manifests/{}", self.scheme_host, self.repository, reference)
    }

    fn blob_url(&self, digest: &Digest) -> String {
        format!("{}/v2/{}/blobs/{}", self.scheme_host, self.repository, digest)
    }

    fn upload_url(&self) -> String {
        format!("{}/v2/{}/blobs/uploads/", self.scheme_host, self.repository)
    }

    async fn authorization_header(&self, scope: Scope) -> Result<Option<String>, RegistryError> {
        let key = scope.to_string();
        if let Some(cached) = self.token_cache.get(&key) {
            if !cached.is_expired() {
                return Ok(Some(format!("Bearer {}", cached.token)));
            }
        }
        // We don't yet know whether this registry wants basic or bearer
        // auth; that's only discoverable from a 401's WWW-Authenticate, so
        // authorization_header is only consulted reactively, after a 401.
        Ok(self.credentials.as_ref().map(|c| c.header_value()))
    }

    /// Handle a 401 response: parse its `WWW-Authenticate`, fetch a bearer
    /// token from the realm if challenged with Bearer, and cache it under
    /// every scope it was requested for. Basic-challenged registries just
    /// get retried with the configured credentials (already attempted on
    /// the first pass, so a second 401 there is a hard failure).
    ///
    /// A challenge with no `error` parameter is the registry's initial,
    /// unauthenticated prompt, always worth a token fetch. A challenge that
    /// does carry `error` is a retry of an already-authenticated request;
    /// only `insufficient_scope` is recoverable by escalating the token's
    /// scope, so every other error (`invalid_token`, bad credentials, ...)
    /// fails immediately instead of silently retrying forever.
    async fn handle_unauthorized(
        &self,
        www_authenticate: &str,
    ) -> Result<String, RegistryError> {
        if www_authenticate.starts_with("Bearer") {
            let challenge = auth::parse_www_authenticate_bearer(www_authenticate)?;
            if let Some(err) = &challenge.error {
                if err != "insufficient_scope" {
                    return Err(RegistryError::Unauthorized {
                        scope: challenge.scope.as_ref().map(|s| s.to_string()).unwrap_or_default(),
                        reason: err.clone(),
                    });
                }
            }
            let requested = challenge.scope.clone().unwrap_or_else(|| Scope::repository(&self.repository, "pull"));
            let scopes: Vec<Scope> = {
                let mut guard = self.scopes.lock().expect("client scope set lock poisoned");
                guard.insert(requested);
                guard.iter().cloned().collect()
            };
            let token = self.fetch_bearer_token(&challenge, &scopes).await?;
            let header = format!("Bearer {}", token.token);
            for scope in &scopes {
                self.token_cache.insert(scope.to_string(), token.clone());
            }
            Ok(header)
        } else if let Some(creds) = &self.credentials {
            Ok(creds.header_value())
        } else {
            Err(RegistryError::Unauthorized {
                scope: self.repository.clone(),
                reason: "no credentials configured".to_string(),
            })
        }
    }

    /// Request a token covering every scope in `scopes` (the accumulated
    /// union for this connection, not just the one in `challenge`), so a
    /// registry that supports multi-scope tokens hands back one good for
    /// everything seen so far instead of one this connection will have to
    /// immediately escalate again.
    async fn fetch_bearer_token(
        &self,
        challenge: &auth::BearerChallenge,
        scopes: &[Scope],
    ) -> Result<BearerToken, RegistryError> {
        let mut req = self.http.get(&challenge.realm);
        let mut query = Vec::new();
        if let Some(service) = &challenge.service {
            query.push(("service", service.clone()));
        }
        for scope in scopes {
            query.push(("scope", scope.to_string()));
        }
        req = req.query(&query);
        if let Some(creds) = &self.credentials {
            req = req.basic_auth(&creds.username, Some(&creds.password));
        }
        let resp = req
            .send()
            .await
            .map_err(|e| RegistryError::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(RegistryError::Unauthorized {
                scope: challenge.scope.as_ref().map(|s| s.to_string()).unwrap_or_default(),
                reason: format!("token endpoint returned {}", resp.status()),
            });
        }
        let body = resp.bytes().await.map_err(|e| RegistryError::Http(e.to_string()))?;
        auth::parse_token_response(&body)
    }

    /// GET the manifest for `reference` (a tag or a digest string), retrying
    /// once on `insufficient_scope` and applying the shared retry policy to
    /// transient failures.
    pub async fn get_manifest(&self, reference: &str) -> Result<(Vec<u8>, String), TransportError> {
        let url = self.manifest_url(reference);
        let accept = MANIFEST_ACCEPT_ORDER.join(", ");

        for (attempt, backoff) in std::iter::once(Duration::ZERO).chain(RETRY_BACKOFFS.iter().copied()).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(backoff).await;
            }
            let mut req = self.http.get(&url).header(header::ACCEPT, &accept);
            if let Some(auth) = self
                .authorization_header(Scope::repository(&self.repository, "pull"))
                .await
                .map_err(TransportError::Docker)?
            {
                req = req.header(header::AUTHORIZATION, auth);
            }
            let resp = req.send().await.map_err(|e| TransportError::Docker(RegistryError::Http(e.to_string())))?;

            if resp.status() == StatusCode::UNAUTHORIZED {
                let challenge = resp
                    .headers()
                    .get(header::WWW_AUTHENTICATE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let auth_header = self.handle_unauthorized(&challenge).await.map_err(TransportError::Docker)?;
                let retry = self
                    .http
                    .get(&url)
                    .header(header::ACCEPT, &accept)
                    .header(header::AUTHORIZATION, auth_header)
                    .send()
                    .await
                    .map_err(|e| TransportError::Docker(RegistryError::Http(e.to_string())))?;
                return Self::finish_manifest_response(retry).await;
            }

            let status = resp.status();
            if status.is_success() {
                return Self::finish_manifest_response(resp).await;
            }
            let body = resp.bytes().await.unwrap_or_default();
            let err = error::parse_error_body(status.as_u16(), &body);
            if err.is_manifest_unknown() {
                return Err(TransportError::ManifestUnknown);
            }
            if !err.is_retryable() || attempt == RETRY_BACKOFFS.len() {
                return Err(TransportError::Docker(err));
            }
        }
        unreachable!("retry loop always returns")
    }

    async fn finish_manifest_response(resp: reqwest::Response) -> Result<(Vec<u8>, String), TransportError> {
        let status = resp.status();
        let media_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .split(';')
            .next()
            .unwrap_or("")
            .to_string();
        if !status.is_success() {
            let body = resp.bytes().await.unwrap_or_default();
            let err = error::parse_error_body(status.as_u16(), &body);
            if err.is_manifest_unknown() {
                return Err(TransportError::ManifestUnknown);
            }
            return Err(TransportError::Docker(err));
        }
        let body = resp.bytes().await.map_err(|e| TransportError::Docker(RegistryError::Http(e.to_string())))?;
        let media_type = if media_type.is_empty() {
            crate::manifest::sniff_media_type(None, &body)?
        } else {
            media_type
        };
        Ok((body.to_vec(), media_type))
    }

    /// PUT a manifest, trying each of `candidates` (bytes, media type) in
    /// order until one is accepted. A registry that rejects an OCI index
    /// with an `unsupported` error but accepts a Docker schema2 list is the
    /// motivating case; the copy orchestrator supplies both encodings when
    /// it has already converted the manifest, and this loop is the
    /// "downgrade-retry".
    pub async fn put_manifest_with_fallback(
        &self,
        reference: &str,
        candidates: &[(Vec<u8>, String)],
    ) -> Result<(), TransportError> {
        let mut last_err = None;
        for (bytes, media_type) in candidates {
            match self.put_manifest_once(reference, bytes, media_type).await {
                Ok(()) => return Ok(()),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or(TransportError::Docker(RegistryError::Unexpected {
            status: 0,
            body: "no manifest candidates supplied".to_string(),
        })))
    }

    async fn put_manifest_once(
        &self,
        reference: &str,
        body: &[u8],
        media_type: &str,
    ) -> Result<(), TransportError> {
        let url = self.manifest_url(reference);
        let mut req = self
            .http
            .put(&url)
            .header(header::CONTENT_TYPE, media_type)
            .body(body.to_vec());
        if let Some(auth) = self
            .authorization_header(Scope::repository(&self.repository, "pull,push"))
            .await
            .map_err(TransportError::Docker)?
        {
            req = req.header(header::AUTHORIZATION, auth);
        }
        let resp = req.send().await.map_err(|e| TransportError::Docker(RegistryError::Http(e.to_string())))?;
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            let challenge = resp
                .headers()
                .get(header::WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let auth_header = self.handle_unauthorized(&challenge).await.map_err(TransportError::Docker)?;
            let retry = self
                .http
                .put(&url)
                .header(header::CONTENT_TYPE, media_type)
                .header(header::AUTHORIZATION, auth_header)
                .body(body.to_vec())
                .send()
                .await
                .map_err(|e| TransportError::Docker(RegistryError::Http(e.to_string())))?;
            if retry.status().is_success() {
                return Ok(());
            }
            let respbody = retry.bytes().await.unwrap_or_default();
            return Err(TransportError::Docker(error::parse_error_body(retry.status().as_u16(), &respbody)));
        }
        if status.is_success() {
            return Ok(());
        }
        let respbody = resp.bytes().await.unwrap_or_default();
        Err(TransportError::Docker(error::parse_error_body(status.as_u16(), &respbody)))
    }

    /// Ranged, resumable blob GET. Reconnects on a mid-stream error using
    /// [`ResumeState`], validating that the server actually resumes at the
    /// byte we asked for.
    pub async fn get_blob(&self, digest: &Digest, expected_size: i64) -> Result<(BlobStream, i64), TransportError> {
        let url = self.blob_url(digest);
        let first = self.blob_request(&url, None).await?;
        let total = first
            .content_length()
            .map(|l| l as i64)
            .unwrap_or(expected_size);

        let (tx, rx) = tokio::sync::mpsc::channel::<std::io::Result<Bytes>>(8);
        let http = self.http.clone();
        let digest = digest.clone();
        let expected_algorithm = digest.algorithm();
        let url_for_task = url.clone();
        let auth_header = self
            .authorization_header(Scope::repository(&self.repository, "pull"))
            .await
            .map_err(TransportError::Docker)?;

        tokio::spawn(async move {
            let mut stream = first.bytes_stream();
            let mut state = ResumeState::new();
            let mut digester = crate::digest::Digester::new(expected_algorithm);
            loop {
                match stream.next().await {
                    Some(Ok(chunk)) => {
                        digester.update(&chunk);
                        state.record_chunk(chunk.len() as u64);
                        if tx.send(Ok(chunk)).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        if !state.record_disconnect() {
                            let _ = tx
                                .send(Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
                                .await;
                            return;
                        }
                        let mut req = http.get(&url_for_task).header(header::RANGE, state.range_header());
                        if let Some(auth) = &auth_header {
                            req = req.header(header::AUTHORIZATION, auth.clone());
                        }
                        match req.send().await {
                            Ok(resp) if resp.status() == StatusCode::PARTIAL_CONTENT => {
                                let range_ok = resp
                                    .headers()
                                    .get(header::CONTENT_RANGE)
                                    .and_then(|v| v.to_str().ok())
                                    .and_then(|v| bodyreader::parse_content_range(v).ok())
                                    .map(|r| state.validate_resume(&r).is_ok())
                                    .unwrap_or(false);
                                if !range_ok {
                                    let _ = tx
                                        .send(Err(std::io::Error::new(
                                            std::io::ErrorKind::InvalidData,
                                            "server did not resume at the expected byte",
                                        )))
                                        .await;
                                    return;
                                }
                                stream = resp.bytes_stream();
                            }
                            _ => {
                                let _ = tx
                                    .send(Err(std::io::Error::new(std::io::ErrorKind::Other, "reconnect failed")))
                                    .await;
                                return;
                            }
                        }
                    }
                    None => {
                        let computed = digester.finalize();
                        if !verify(&digest, &computed) {
                            let _ = tx
                                .send(Err(std::io::Error::new(
                                    std::io::ErrorKind::InvalidData,
                                    "digest mismatch",
                                )))
                                .await;
                        }
                        return;
                    }
                }
            }
        });

        let stream = ReceiverStream::new(rx);
        Ok((Box::pin(stream), total))
    }

    async fn blob_request(&self, url: &str, range: Option<bodyreader::ContentRange>) -> Result<reqwest::Response, TransportError> {
        let mut req = self.http.get(url);
        if let Some(auth) = self
            .authorization_header(Scope::repository(&self.repository, "pull"))
            .await
            .map_err(TransportError::Docker)?
        {
            req = req.header(header::AUTHORIZATION, auth);
        }
        if let Some(r) = range {
            req = req.header(header::RANGE, format!("bytes={}-{}", r.start, r.end));
        }
        let resp = req.send().await.map_err(|e| TransportError::Docker(RegistryError::Http(e.to_string())))?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            let challenge = resp
                .headers()
                .get(header::WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let auth_header = self.handle_unauthorized(&challenge).await.map_err(TransportError::Docker)?;
            let mut retry = self.http.get(url).header(header::AUTHORIZATION, auth_header);
            if let Some(r) = range {
                retry = retry.header(header::RANGE, format!("bytes={}-{}", r.start, r.end));
            }
            return retry.send().await.map_err(|e| TransportError::Docker(RegistryError::Http(e.to_string())));
        }
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.bytes().await.unwrap_or_default();
            let err = error::parse_error_body(status, &body);
            if err.is_blob_unknown() {
                return Err(TransportError::BlobUnknown(Digest::new(crate::digest::Algorithm::Sha256, "0".repeat(64)).unwrap()));
            }
            return Err(TransportError::Docker(err));
        }
        Ok(resp)
    }

    /// Two-phase blob PUT: obtain an upload URL via POST, stream bytes via
    /// PATCH or a single PUT with `digest` query param, matching the
    /// monolithic-upload shortcut most registries support. Falls back to a
    /// cross-repo mount when `mount_from` names a repository known to the
    /// blob-info cache as already having this digest, saving the upload
    /// entirely.
    pub async fn put_blob(
        &self,
        info: &BlobInfo,
        body: Bytes,
        mount_from: Option<&str>,
    ) -> Result<(), TransportError> {
        let digest = info.digest.clone().ok_or_else(|| {
            TransportError::Docker(RegistryError::Unexpected { status: 0, body: "blob has no digest".to_string() })
        })?;

        if let Some(from) = mount_from {
            let mut url = reqwest::Url::parse(&self.upload_url()).expect("well-formed upload url");
            url.query_pairs_mut().append_pair("mount", &digest.to_string()).append_pair("from", from);
            let mut req = self.http.post(url);
            if let Some(auth) = self
                .authorization_header(Scope::repository(&self.repository, "pull,push"))
                .await
                .map_err(TransportError::Docker)?
            {
                req = req.header(header::AUTHORIZATION, auth);
            }
            let resp = req.send().await.map_err(|e| TransportError::Docker(RegistryError::Http(e.to_string())))?;
            if resp.status() == StatusCode::CREATED {
                return Ok(());
            }
            // mount declined (cross-repo access denied, or digest not
            // present there); registry gives us a normal upload session in
            // the Location header, which we continue below.
        }

        let mut req = self.http.post(self.upload_url());
        if let Some(auth) = self
            .authorization_header(Scope::repository(&self.repository, "pull,push"))
            .await
            .map_err(TransportError::Docker)?
        {
            req = req.header(header::AUTHORIZATION, auth);
        }
        let resp = req.send().await.map_err(|e| TransportError::Docker(RegistryError::Http(e.to_string())))?;
        if resp.status() != StatusCode::ACCEPTED {
            let status = resp.status().as_u16();
            let respbody = resp.bytes().await.unwrap_or_default();
            return Err(TransportError::Docker(error::parse_error_body(status, &respbody)));
        }
        let location = resp
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| TransportError::Docker(RegistryError::Unexpected { status: 202, body: "missing Location".to_string() }))?
            .to_string();

        let mut final_url = if location.starts_with("http") {
            reqwest::Url::parse(&location)
        } else {
            reqwest::Url::parse(&self.scheme_host).and_then(|base| base.join(&location))
        }
        .map_err(|e| TransportError::Docker(RegistryError::Unexpected { status: 202, body: e.to_string() }))?;
        final_url.query_pairs_mut().append_pair("digest", &digest.to_string());

        let mut put = self.http.put(final_url).header(header::CONTENT_TYPE, "application/octet-stream").body(body);
        if let Some(auth) = self
            .authorization_header(Scope::repository(&self.repository, "pull,push"))
            .await
            .map_err(TransportError::Docker)?
        {
            put = put.header(header::AUTHORIZATION, auth);
        }
        let resp = put.send().await.map_err(|e| TransportError::Docker(RegistryError::Http(e.to_string())))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            let status = resp.status().as_u16();
            let respbody = resp.bytes().await.unwrap_or_default();
            Err(TransportError::Docker(error::parse_error_body(status, &respbody)))
        }
    }

    pub async fn blob_exists(&self, digest: &Digest) -> Result<Option<i64>, TransportError> {
        let url = self.blob_url(digest);
        let mut req = self.http.head(&url);
        if let Some(auth) = self
            .authorization_header(Scope::repository(&self.repository, "pull"))
            .await
            .map_err(TransportError::Docker)?
        {
            req = req.header(header::AUTHORIZATION, auth);
        }
        let resp = req.send().await.map_err(|e| TransportError::Docker(RegistryError::Http(e.to_string())))?;
        if resp.status() == StatusCode::OK {
            Ok(resp.content_length().map(|l| l as i64))
        } else {
            Ok(None)
        }
    }
}

pub struct ClientHandle(pub Arc<Client>);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_accept_order_prefers_oci_index_first() {
        assert_eq!(MANIFEST_ACCEPT_ORDER[0], MT_OCI1_INDEX);
        assert_eq!(MANIFEST_ACCEPT_ORDER[1], MT_OCI1_MANIFEST);
    }

    #[test]
    fn upload_url_shape() {
        let host_configs = HostConfigTable::new();
        let builder = ClientBuilder::new("registry.example.com", "library/busybox").host_configs(host_configs);
        assert_eq!(builder.domain, "registry.example.com");
        assert_eq!(builder.repository, "library/busybox");
    }
}
