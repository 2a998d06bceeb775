//! Bootstrap configuration.
//!
//! All settings for a run are gathered into one immutable [`BootstrapConfig`] up front so that
//! nothing in the orchestrator reads ambient process state.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use eyre::WrapErr as _;
use serde::Serialize;

use crate::{poll::PollPolicy, BootstrapError};

/// Directory, relative to the proxy's document root, that ACME HTTP-01 challenges are served from.
pub const ACME_CHALLENGE_DIR: &str = ".well-known/acme-challenge";

/// Webroot as seen from inside the proxy and ACME client containers.
pub const DEFAULT_CONTAINER_WEBROOT: &str = "/var/www/certbot";

/// Upstream that the HTTP-only configuration proxies application traffic to.
pub const DEFAULT_BACKEND: &str = "app:8000";

/// Days of validity left below which an advisory warning is emitted.
pub const DEFAULT_EXPIRY_WARNING_DAYS: i64 = 30;

/// What to bootstrap, and where the collaborators keep their files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootstrapRequest {
    /// Primary domain; becomes the certificate's subject CN.
    pub domain: String,

    /// Additional subject alternative names.
    pub alt_names: Vec<String>,

    /// Contact address registered with the ACME provider.
    pub contact_email: String,

    /// Host-side directory the proxy serves under `/.well-known/acme-challenge/`.
    pub webroot_path: PathBuf,

    /// The reverse proxy's configuration file.
    pub proxy_config_path: PathBuf,

    /// The ACME client's `live/` directory.
    pub certificate_output_dir: PathBuf,
}

impl BootstrapRequest {
    /// Derives the conventional layout under `app_dir`:
    ///
    /// ```text
    /// {app_dir}/certbot/conf/live/{domain}/fullchain.pem
    /// {app_dir}/certbot/www/.well-known/acme-challenge/{token}
    /// {app_dir}/nginx/nginx.conf
    /// ```
    pub fn from_app_dir(
        app_dir: impl AsRef<Path>,
        domain: impl Into<String>,
        contact_email: impl Into<String>,
    ) -> Self {
        let app_dir = app_dir.as_ref();

        BootstrapRequest {
            domain: domain.into(),
            alt_names: Vec::new(),
            contact_email: contact_email.into(),
            webroot_path: app_dir.join("certbot").join("www"),
            proxy_config_path: app_dir.join("nginx").join("nginx.conf"),
            certificate_output_dir: app_dir.join("certbot").join("conf").join("live"),
        }
    }

    pub fn with_alt_names<I, S>(mut self, alt_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.alt_names = alt_names.into_iter().map(Into::into).collect();
        self
    }

    /// Primary domain first, then alt names, without duplicates.
    pub fn domains(&self) -> Vec<&str> {
        let mut domains = vec![self.domain.as_str()];
        for name in &self.alt_names {
            if !domains.contains(&name.as_str()) {
                domains.push(name);
            }
        }
        domains
    }

    /// The existence marker for "certificate present".
    pub fn certificate_path(&self) -> PathBuf {
        self.certificate_output_dir
            .join(&self.domain)
            .join("fullchain.pem")
    }

    /// Directory challenge marker files are written to.
    pub fn challenge_dir(&self) -> PathBuf {
        self.webroot_path.join(ACME_CHALLENGE_DIR)
    }

    /// Where the original proxy configuration is parked while HTTP-only mode is active.
    pub fn proxy_backup_path(&self) -> PathBuf {
        let mut name = self
            .proxy_config_path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".backup");
        self.proxy_config_path.with_file_name(name)
    }

    /// Checks names and prepares the webroot; see [`validate_names`] and [`prepare_paths`].
    ///
    /// [`validate_names`]: BootstrapRequest::validate_names()
    /// [`prepare_paths`]: BootstrapRequest::prepare_paths()
    pub fn validate(&self) -> Result<(), BootstrapError> {
        self.validate_names()?;
        self.prepare_paths()
    }

    /// Syntax checks only; touches nothing on disk.
    pub fn validate_names(&self) -> Result<(), BootstrapError> {
        validate_domain(&self.domain)?;
        for name in &self.alt_names {
            validate_domain(name)?;
        }
        validate_email(&self.contact_email)
    }

    /// Creates the challenge directory if missing and checks it accepts writes. The proxy
    /// config's parent directory must already exist.
    pub fn prepare_paths(&self) -> Result<(), BootstrapError> {
        let challenge_dir = self.challenge_dir();
        check_writable(&challenge_dir).map_err(|err| {
            BootstrapError::Configuration(format!(
                "webroot {} is not writable: {err:#}",
                self.webroot_path.display()
            ))
        })?;

        match self.proxy_config_path.parent() {
            Some(parent) if parent.as_os_str().is_empty() || parent.is_dir() => {}
            _ => {
                return Err(BootstrapError::Configuration(format!(
                    "proxy config directory for {} does not exist",
                    self.proxy_config_path.display()
                )))
            }
        }

        Ok(())
    }
}

/// Everything a bootstrap run needs to know.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub request: BootstrapRequest,

    /// Skip the fast path and re-issue even if a certificate is present.
    pub force_reissue: bool,

    /// Ask the ACME client to use the provider's staging environment.
    pub staging: bool,

    /// Budget for observing the challenge marker through the public URL.
    pub probe_policy: PollPolicy,

    /// Budget for the certificate artifact to appear after issuance.
    pub verify_policy: PollPolicy,

    pub expiry_warning_days: i64,

    /// `host:port` of the application behind the proxy.
    pub backend: String,

    /// Webroot path as the proxy sees it.
    pub proxy_webroot: String,

    /// Webroot path as the ACME client sees it.
    pub acme_webroot: String,

    /// Authority used in the probe URL; defaults to the domain.
    pub probe_authority: Option<String>,
}

impl BootstrapConfig {
    pub fn new(request: BootstrapRequest) -> Self {
        BootstrapConfig {
            request,
            force_reissue: false,
            staging: false,
            probe_policy: PollPolicy::from_timeout(Duration::from_secs(60), Duration::from_secs(5)),
            verify_policy: PollPolicy::new(Duration::from_secs(2), 10),
            expiry_warning_days: DEFAULT_EXPIRY_WARNING_DAYS,
            backend: DEFAULT_BACKEND.to_owned(),
            proxy_webroot: DEFAULT_CONTAINER_WEBROOT.to_owned(),
            acme_webroot: DEFAULT_CONTAINER_WEBROOT.to_owned(),
            probe_authority: None,
        }
    }

    /// `host[:port]` that challenge probes are sent to.
    pub fn probe_authority(&self) -> &str {
        self.probe_authority
            .as_deref()
            .unwrap_or(&self.request.domain)
    }
}

/// Accepts hostnames of at least two labels made of ASCII alphanumerics and inner hyphens.
pub fn validate_domain(domain: &str) -> Result<(), BootstrapError> {
    let invalid = |reason: &str| {
        Err(BootstrapError::Configuration(format!(
            "invalid domain {domain:?}: {reason}"
        )))
    };

    let domain = domain.strip_suffix('.').unwrap_or(domain);

    if domain.is_empty() || domain.len() > 253 {
        return invalid("length must be between 1 and 253");
    }

    let labels = domain.split('.').collect::<Vec<_>>();
    if labels.len() < 2 {
        return invalid("expected a fully qualified name");
    }

    for label in labels {
        if label.is_empty() || label.len() > 63 {
            return invalid("labels must be between 1 and 63 characters");
        }
        if label.starts_with('-') || label.ends_with('-') {
            return invalid("labels cannot start or end with a hyphen");
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return invalid("only letters, digits and hyphens are allowed");
        }
    }

    Ok(())
}

fn validate_email(email: &str) -> Result<(), BootstrapError> {
    match email.split_once('@') {
        Some((local, domain))
            if !local.is_empty() && !domain.is_empty() && !email.contains(char::is_whitespace) =>
        {
            Ok(())
        }
        _ => Err(BootstrapError::Configuration(format!(
            "invalid contact email {email:?}"
        ))),
    }
}

fn check_writable(dir: &Path) -> eyre::Result<()> {
    fs::create_dir_all(dir).wrap_err_with(|| format!("create {}", dir.display()))?;

    let probe = dir.join(".write-test");
    fs::write(&probe, b"").wrap_err_with(|| format!("write {}", probe.display()))?;
    fs::remove_file(&probe).wrap_err_with(|| format!("remove {}", probe.display()))?;

    Ok(())
}
