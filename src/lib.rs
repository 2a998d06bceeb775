//! Bootstrapping a first TLS certificate for a freshly provisioned host.
//!
//! A host that has never had a certificate cannot start its reverse proxy with the final TLS
//! configuration, yet the proxy is exactly what has to answer the CA's HTTP-01 challenge. This
//! crate sequences the external tools involved (the proxy, an ACME client such as `certbot`, and
//! DNS) to move the host from "no certificate" to "certificate installed", or back to where it
//! started if anything goes wrong.
//!
//! # Flow
//!
//! 1. If `live/{domain}/fullchain.pem` already exists, report its expiry and stop. Nothing is
//!    modified.
//! 2. Check that every requested name resolves.
//! 3. Park the proxy configuration and install an HTTP-only one that serves
//!    `/.well-known/acme-challenge/` from the webroot ([`ProxyConfigSwitcher`]).
//! 4. Publish a random marker and fetch it through the public URL ([`ChallengeProber`]).
//! 5. Run the ACME client ([`AcmeClient`]).
//! 6. Wait for the certificate to appear and parse it ([`verify_issued_certificate`]).
//! 7. Restore the original proxy configuration and reload the proxy, whatever the outcome.
//!
//! See [`Orchestrator`] for the state machine.
//!
//! # Collaborators
//!
//! Everything outside this process is reached through a trait so it can be swapped out:
//!
//! - [`ProxyControl`] (default [`ComposeStack`]),
//! - [`AcmeClient`] (default [`CertbotCli`]),
//! - [`Resolver`] (default [`SystemResolver`]),
//! - [`HttpFetch`] (default [`ReqwestFetcher`]).
//!
//! # Rate Limits
//!
//! Let's Encrypt [rate limits] issuance per domain. Nothing here retries a failed issuance;
//! re-running is an operator decision. Use [`BootstrapConfig::staging`] while testing.
//!
//! [rate limits]: https://letsencrypt.org/docs/rate-limits

#![deny(rust_2018_idioms, nonstandard_style, future_incompatible)]

mod cert;
mod cmd;
mod config;
mod dns;
mod error;
mod issue;
mod orchestrator;
mod poll;
mod probe;
mod req;

pub mod proxy;


pub use crate::{
    cert::{days_remaining, read_certificate, verify_issued_certificate, CertificateRecord, Verification},
    cmd::CommandPrefix,
    config::{
        validate_domain, BootstrapConfig, BootstrapRequest, ACME_CHALLENGE_DIR, DEFAULT_BACKEND,
        DEFAULT_CONTAINER_WEBROOT, DEFAULT_EXPIRY_WARNING_DAYS,
    },
    dns::{Resolver, SystemResolver},
    error::{remediation_hints, BootstrapError, ErrorKind, IssuanceFailure},
    issue::{
        request_certificate, AcmeClient, CertbotCli, CertificateIssueOutcome, IssueArgs, IssueMode,
        RSA_KEY_SIZE,
    },
    orchestrator::{BootstrapReport, BootstrapState, Orchestrator},
    poll::{poll, PollOutcome, PollPolicy},
    probe::{challenge_url, marker_for, random_token, ChallengeProber, HttpFetch, ProbeResult, ReqwestFetcher},
    proxy::{ComposeStack, ProxyConfigState, ProxyConfigSwitcher, ProxyControl},
};
