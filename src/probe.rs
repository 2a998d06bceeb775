//! Pre-flight check of the HTTP-01 challenge path.
//!
//! The CA fetches `http://<domain>/.well-known/acme-challenge/<token>` from the public internet.
//! When DNS, the firewall, or the proxy's routing is wrong, the ACME client fails with an opaque
//! validation error after burning an attempt against the CA's rate limits. Publishing our own
//! marker and fetching it the same way first turns that into a quick local failure.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use base64::prelude::*;
use eyre::WrapErr as _;
use rand::RngCore as _;
use serde::Serialize;
use time::OffsetDateTime;

use crate::{
    config::ACME_CHALLENGE_DIR,
    poll::{poll, PollPolicy},
    req,
};

/// Plain HTTP GET, as seen from outside the host.
#[allow(async_fn_in_trait)]
pub trait HttpFetch {
    /// Body of a successful response, or `None` if the URL could not be fetched.
    async fn fetch(&self, url: &str) -> Option<String>;
}

/// [`HttpFetch`] over a `reqwest` client that does not follow redirects.
#[derive(Debug, Clone)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new() -> eyre::Result<Self> {
        Ok(ReqwestFetcher {
            client: req::client()?,
        })
    }
}

impl HttpFetch for ReqwestFetcher {
    async fn fetch(&self, url: &str) -> Option<String> {
        req::req_get_body(&self.client, url).await
    }
}

/// Outcome of one reachability probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub token: String,
    #[serde(with = "time::serde::rfc3339")]
    pub published_at: OffsetDateTime,
    pub observed: bool,
    pub attempts: u32,
}

/// The body served for `token`; only an exact match counts as observed.
pub fn marker_for(token: &str) -> String {
    format!("ok-{token}")
}

/// URL the CA (and the probe) will request for `token`.
pub fn challenge_url(authority: &str, token: &str) -> String {
    format!("http://{authority}/{ACME_CHALLENGE_DIR}/{token}")
}

/// 32 random bytes, base64url encoded; valid as an HTTP-01 token.
pub fn random_token() -> String {
    let mut bytes = [0; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    BASE64_URL_SAFE_NO_PAD.encode(bytes)
}

/// Publishes marker files under a webroot and checks that they can be fetched publicly.
#[derive(Debug, Clone)]
pub struct ChallengeProber<F> {
    fetcher: F,
}

impl<F: HttpFetch> ChallengeProber<F> {
    pub fn new(fetcher: F) -> Self {
        ChallengeProber { fetcher }
    }

    /// Publishes a fresh random token and polls for it through `authority` (the domain, or
    /// `host:port`).
    ///
    /// The marker file is always gone by the time this returns. An error is only returned when
    /// the marker cannot be written or removed; not observing it is reported through
    /// [`ProbeResult::observed`].
    pub async fn probe_acme_reachability(
        &self,
        authority: &str,
        webroot_path: &Path,
        policy: PollPolicy,
    ) -> eyre::Result<ProbeResult> {
        self.probe_with_token(authority, webroot_path, &random_token(), policy)
            .await
    }

    pub(crate) async fn probe_with_token(
        &self,
        authority: &str,
        webroot_path: &Path,
        token: &str,
        policy: PollPolicy,
    ) -> eyre::Result<ProbeResult> {
        let marker = marker_for(token);
        let url = challenge_url(authority, token);

        let file = MarkerFile::publish(&webroot_path.join(ACME_CHALLENGE_DIR), token, &marker)?;
        let published_at = OffsetDateTime::now_utc();

        log::info!("probing {url} (up to {} attempts)", policy.max_attempts);

        let fetcher = &self.fetcher;
        let (url_ref, marker_ref) = (url.as_str(), marker.as_str());

        let outcome = poll(policy, move |attempt| async move {
            log::trace!("probe attempt {attempt}: GET {url_ref}");
            match fetcher.fetch(url_ref).await {
                Some(body) => body.contains(marker_ref),
                None => false,
            }
        })
        .await;

        file.remove()?;

        if outcome.satisfied {
            log::info!("challenge path reachable after {} attempts", outcome.attempts);
        } else {
            log::warn!("challenge path not reachable after {} attempts", outcome.attempts);
        }

        Ok(ProbeResult {
            token: token.to_owned(),
            published_at,
            observed: outcome.satisfied,
            attempts: outcome.attempts,
        })
    }
}

/// A published marker file, removed on drop if not removed explicitly.
#[derive(Debug)]
struct MarkerFile {
    path: PathBuf,
    removed: bool,
}

impl MarkerFile {
    fn publish(dir: &Path, token: &str, contents: &str) -> eyre::Result<Self> {
        fs::create_dir_all(dir).wrap_err_with(|| format!("create {}", dir.display()))?;

        let path = dir.join(token);
        fs::write(&path, contents).wrap_err_with(|| format!("write {}", path.display()))?;
        log::debug!("published probe marker {}", path.display());

        Ok(MarkerFile {
            path,
            removed: false,
        })
    }

    fn remove(mut self) -> eyre::Result<()> {
        self.removed = true;
        remove_if_exists(&self.path).wrap_err_with(|| format!("remove {}", self.path.display()))
    }
}

impl Drop for MarkerFile {
    fn drop(&mut self) {
        if !self.removed {
            if let Err(err) = remove_if_exists(&self.path) {
                log::error!("failed to remove {}: {err}", self.path.display());
            }
        }
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        res => res,
    }
}
