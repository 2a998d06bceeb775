//! Certificate issuance through an external ACME client.
//!
//! The ACME protocol itself is entirely the client's business; this module only decides what
//! to ask for and keeps everything the client printed, so that a failure can be diagnosed
//! without re-running it.

use crate::{cmd::CommandPrefix, config::BootstrapConfig};

/// RSA key size requested for every certificate.
pub const RSA_KEY_SIZE: u32 = 4096;

/// Why a certificate is being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueMode {
    /// First certificate for this host. A fresh issuance is forced so a stale or partial
    /// lineage left behind by an earlier attempt is never served.
    Initial,

    /// Operator asked to re-issue even though a certificate is present. Also allows the
    /// existing lineage to be expanded with new names.
    ForceRenew,
}

/// Parameters passed to the ACME client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueArgs {
    /// Primary domain first; it also names the certificate lineage.
    pub domains: Vec<String>,
    pub contact_email: String,
    /// Webroot as the ACME client sees it.
    pub webroot: String,
    pub mode: IssueMode,
    pub staging: bool,
}

impl IssueArgs {
    pub fn from_config(config: &BootstrapConfig, mode: IssueMode) -> Self {
        IssueArgs {
            domains: config
                .request
                .domains()
                .into_iter()
                .map(ToOwned::to_owned)
                .collect(),
            contact_email: config.request.contact_email.clone(),
            webroot: config.acme_webroot.clone(),
            mode,
            staging: config.staging,
        }
    }

    /// `certbot certonly` arguments with the fixed issuance policy: RSA 4096, non-interactive,
    /// terms of service accepted, verbose output.
    pub fn certbot_args(&self) -> Vec<String> {
        let mut args = vec![
            "certonly".to_owned(),
            "--webroot".to_owned(),
            "-w".to_owned(),
            self.webroot.clone(),
        ];

        for domain in &self.domains {
            args.push("-d".to_owned());
            args.push(domain.clone());
        }

        if let Some(primary) = self.domains.first() {
            args.push("--cert-name".to_owned());
            args.push(primary.clone());
        }

        let key_size = RSA_KEY_SIZE.to_string();
        args.extend(
            [
                "--email",
                self.contact_email.as_str(),
                "--rsa-key-size",
                key_size.as_str(),
                "--agree-tos",
                "--non-interactive",
                "--verbose",
                "--force-renewal",
            ]
            .map(ToOwned::to_owned),
        );

        if self.mode == IssueMode::ForceRenew {
            args.push("--expand".to_owned());
        }

        if self.staging {
            args.push("--staging".to_owned());
        }

        args
    }
}

/// Result of one ACME client run. Output is kept either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateIssueOutcome {
    Success { output: String },
    Failure { exit_code: i32, output: String },
}

impl CertificateIssueOutcome {
    pub fn from_exit(exit_code: i32, output: String) -> Self {
        if exit_code == 0 {
            CertificateIssueOutcome::Success { output }
        } else {
            CertificateIssueOutcome::Failure { exit_code, output }
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            CertificateIssueOutcome::Success { .. } => 0,
            CertificateIssueOutcome::Failure { exit_code, .. } => *exit_code,
        }
    }

    pub fn output(&self) -> &str {
        match self {
            CertificateIssueOutcome::Success { output }
            | CertificateIssueOutcome::Failure { output, .. } => output,
        }
    }
}

/// One-shot certificate request against an ACME client. Implementations must not retry.
#[allow(async_fn_in_trait)]
pub trait AcmeClient {
    /// Errors are reserved for failing to run the client at all.
    async fn request(&self, args: &IssueArgs) -> eyre::Result<CertificateIssueOutcome>;
}

/// Runs `certbot`, directly or through a container wrapper.
#[derive(Debug, Clone)]
pub struct CertbotCli {
    command: CommandPrefix,
}

impl CertbotCli {
    /// `command` is everything before the `certonly` subcommand, e.g. `certbot` or
    /// `docker-compose run --rm --entrypoint certbot certbot`.
    pub fn new(command: CommandPrefix) -> Self {
        CertbotCli { command }
    }
}

impl AcmeClient for CertbotCli {
    async fn request(&self, args: &IssueArgs) -> eyre::Result<CertificateIssueOutcome> {
        log::info!(
            "requesting certificate for {} ({:?})",
            args.domains.join(", "),
            args.mode
        );

        let out = self.command.run(args.certbot_args()).await?;
        let outcome = CertificateIssueOutcome::from_exit(out.code, out.output);

        match &outcome {
            CertificateIssueOutcome::Success { output } => {
                log::info!("{} succeeded", self.command.program());
                log::debug!("ACME client output:\n{output}");
            }
            CertificateIssueOutcome::Failure { exit_code, .. } => {
                log::error!("{} exited with code {exit_code}", self.command.program());
            }
        }

        Ok(outcome)
    }
}

/// Requests a certificate for the configured domains.
pub async fn request_certificate<A: AcmeClient>(
    client: &A,
    config: &BootstrapConfig,
    mode: IssueMode,
) -> eyre::Result<CertificateIssueOutcome> {
    client.request(&IssueArgs::from_config(config, mode)).await
}
