//! The bootstrap state machine.
//!
//! ```text
//!                 certificate present
//! NoCertificate ----------------------------------------------> AlreadyActive
//!       |
//!       v
//! ProbingReachability -> RequestingCertificate -> VerifyingCertificate -> Active
//!       |                        |                        |
//!       +------------------------+------------------------+--> Failed
//! ```
//!
//! Only the issuance path touches the proxy. Whatever happens on it, the original proxy
//! configuration is back in place (and reloaded) before [`Orchestrator::run`] returns.

use std::cell::Cell;

use serde::Serialize;

use crate::{
    cert::{read_certificate, verify_issued_certificate, CertificateRecord, Verification},
    config::BootstrapConfig,
    dns::Resolver,
    error::{BootstrapError, IssuanceFailure},
    issue::{request_certificate, AcmeClient, CertificateIssueOutcome, IssueMode},
    probe::{challenge_url, ChallengeProber, HttpFetch, ProbeResult},
    proxy::{ProxyConfigState, ProxyConfigSwitcher, ProxyControl},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BootstrapState {
    NoCertificate,
    ProbingReachability,
    RequestingCertificate,
    VerifyingCertificate,
    /// Certificate issued by this run and the original proxy configuration back in place.
    Active,
    /// A certificate was already present; nothing was changed.
    AlreadyActive,
    Failed,
}

impl BootstrapState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BootstrapState::Active | BootstrapState::AlreadyActive | BootstrapState::Failed
        )
    }
}

/// Summary of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct BootstrapReport {
    pub state: BootstrapState,
    pub domain: String,
    pub certificate: CertificateRecord,
    /// Present when this run had to probe the challenge path.
    pub probe: Option<ProbeResult>,
    /// Advisory message when the certificate is close to expiry.
    pub expiry_warning: Option<String>,
}

/// Drives one bootstrap attempt against the given collaborators.
#[derive(Debug)]
pub struct Orchestrator<P, A, R, F> {
    config: BootstrapConfig,
    proxy: P,
    acme: A,
    resolver: R,
    prober: ChallengeProber<F>,
    switcher: ProxyConfigSwitcher,
    state: Cell<BootstrapState>,
    proxy_state: Cell<ProxyConfigState>,
}

impl<P, A, R, F> Orchestrator<P, A, R, F>
where
    P: ProxyControl,
    A: AcmeClient,
    R: Resolver,
    F: HttpFetch,
{
    pub fn new(config: BootstrapConfig, proxy: P, acme: A, resolver: R, fetcher: F) -> Self {
        let switcher = ProxyConfigSwitcher::for_config(&config);

        Orchestrator {
            config,
            proxy,
            acme,
            resolver,
            prober: ChallengeProber::new(fetcher),
            switcher,
            state: Cell::new(BootstrapState::NoCertificate),
            proxy_state: Cell::new(ProxyConfigState::Original),
        }
    }

    pub fn config(&self) -> &BootstrapConfig {
        &self.config
    }

    pub fn state(&self) -> BootstrapState {
        self.state.get()
    }

    pub fn proxy_state(&self) -> ProxyConfigState {
        self.proxy_state.get()
    }

    /// Runs the bootstrap to a terminal state.
    ///
    /// Every decision is re-derived from the files on disk, so re-running after a failure or
    /// after the process was killed is safe.
    pub async fn run(&self) -> Result<BootstrapReport, BootstrapError> {
        log::info!("bootstrapping certificate for {}", self.config.request.domain);
        self.state.set(BootstrapState::NoCertificate);

        let res = self.run_inner().await;

        if let Err(err) = &res {
            log::error!("bootstrap failed: {err}");
            self.transition(BootstrapState::Failed);
        }

        res
    }

    async fn run_inner(&self) -> Result<BootstrapReport, BootstrapError> {
        let req = &self.config.request;
        req.validate_names()?;

        let cert_path = req.certificate_path();
        let existing = match read_certificate(&cert_path) {
            Ok(existing) => existing,
            Err(err) => {
                log::warn!("ignoring unreadable certificate: {err:#}");
                None
            }
        };

        if let Some(record) = existing {
            if !self.config.force_reissue {
                self.recover_interrupted_run().await?;
                self.transition(BootstrapState::AlreadyActive);
                return Ok(self.report(BootstrapState::AlreadyActive, record, None));
            }
            log::info!("certificate present, re-issuing as requested");
        }

        let mode = if cert_path.exists() {
            IssueMode::ForceRenew
        } else {
            IssueMode::Initial
        };

        req.prepare_paths()?;

        self.transition(BootstrapState::ProbingReachability);
        self.check_dns().await?;

        let http_only = self.switcher.enter_http_only_mode()?;
        self.proxy_state.set(ProxyConfigState::HttpOnly);

        let issued = self.issue(mode).await;

        // restore unconditionally, then surface the first failure
        let restored = http_only.restore();
        if restored.is_ok() {
            self.proxy_state.set(ProxyConfigState::Restored);
        }
        let reloaded = self.proxy.reload().await;

        let (record, probe) = match issued {
            Ok(issued) => issued,
            Err(err) => {
                if let Err(restore_err) = restored {
                    log::error!("could not restore proxy configuration: {restore_err:#}");
                }
                if let Err(reload_err) = reloaded {
                    log::error!("could not reload proxy: {reload_err:#}");
                }
                return Err(err);
            }
        };

        restored?;
        reloaded?;

        self.transition(BootstrapState::Active);
        Ok(self.report(BootstrapState::Active, record, Some(probe)))
    }

    /// Probe, request and verify, with the proxy in HTTP-only mode.
    async fn issue(
        &self,
        mode: IssueMode,
    ) -> Result<(CertificateRecord, ProbeResult), BootstrapError> {
        let req = &self.config.request;

        self.proxy.start().await?;

        let authority = self.config.probe_authority();
        let probe = self
            .prober
            .probe_acme_reachability(authority, &req.webroot_path, self.config.probe_policy)
            .await?;

        if !probe.observed {
            return Err(BootstrapError::Reachability {
                url: challenge_url(authority, &probe.token),
                attempts: probe.attempts,
            });
        }

        self.transition(BootstrapState::RequestingCertificate);

        match request_certificate(&self.acme, &self.config, mode).await? {
            CertificateIssueOutcome::Success { .. } => {}
            CertificateIssueOutcome::Failure { exit_code, output } => {
                return Err(IssuanceFailure::new(exit_code, output).into());
            }
        }

        self.transition(BootstrapState::VerifyingCertificate);

        let path = req.certificate_path();
        match verify_issued_certificate(&path, &req.domain, self.config.verify_policy).await? {
            Verification::Found(record) => Ok((record, probe)),
            Verification::NotFound { attempts } => {
                Err(BootstrapError::Verification { path, attempts })
            }
        }
    }

    /// Every requested name must resolve before the proxy is touched.
    async fn check_dns(&self) -> Result<(), BootstrapError> {
        for domain in self.config.request.domains() {
            let addrs = self.resolver.resolve(domain).await.map_err(|err| {
                BootstrapError::Configuration(format!("DNS lookup for {domain} failed: {err:#}"))
            })?;

            if addrs.is_empty() {
                return Err(BootstrapError::Configuration(format!(
                    "DNS: {domain} does not resolve to any address; \
                     point an A/AAAA record at this host first"
                )));
            }

            log::debug!("{domain} resolves to {addrs:?}");
        }

        Ok(())
    }

    /// Puts the original configuration back if an earlier run was killed in HTTP-only mode.
    async fn recover_interrupted_run(&self) -> Result<(), BootstrapError> {
        if !self.switcher.is_http_only()? {
            return Ok(());
        }

        log::warn!(
            "{} was left in HTTP-only mode by an interrupted run, restoring it",
            self.switcher.config_path().display()
        );

        self.proxy_state
            .set(self.switcher.restore_original_mode()?);
        self.proxy.reload().await?;

        Ok(())
    }

    fn transition(&self, to: BootstrapState) {
        let from = self.state.replace(to);
        log::info!("{from:?} -> {to:?}");
    }

    fn report(
        &self,
        state: BootstrapState,
        certificate: CertificateRecord,
        probe: Option<ProbeResult>,
    ) -> BootstrapReport {
        let threshold = self.config.expiry_warning_days;

        let domain = &self.config.request.domain;

        let expiry_warning = if certificate.days_remaining < 0 {
            // still reported as present; only a forced run replaces it
            let msg = format!(
                "certificate for {domain} expired on {}; it must be re-issued",
                certificate.not_after
            );
            log::error!("{msg}");
            Some(msg)
        } else if certificate.expires_within(threshold) {
            let msg = format!(
                "certificate for {domain} expires in {} days (on {}); check that renewal is scheduled",
                certificate.days_remaining, certificate.not_after
            );
            log::warn!("{msg}");
            Some(msg)
        } else {
            None
        };

        log::info!(
            "certificate for {} valid for {} more days",
            certificate.subject_cn,
            certificate.days_remaining
        );

        BootstrapReport {
            state,
            domain: self.config.request.domain.clone(),
            certificate,
            probe,
            expiry_warning,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        net::{IpAddr, Ipv4Addr},
        path::{Path, PathBuf},
        time::Duration,
    };

    use parking_lot::Mutex;
    use time::{Duration as TimeDuration, OffsetDateTime};

    use super::*;
    use crate::{
        config::{BootstrapRequest, ACME_CHALLENGE_DIR},
        error::{ErrorKind, HINT_RATE_LIMIT},
        issue::IssueArgs,
        poll::PollPolicy,
        test::self_signed_pem,
    };

    const ORIGINAL: &str = "server {\n    listen 443 ssl;\n    server_name example.test;\n}\n";

    #[derive(Default)]
    struct FakeProxy {
        calls: Mutex<Vec<&'static str>>,
        fail_start: bool,
    }

    impl ProxyControl for FakeProxy {
        async fn start(&self) -> eyre::Result<()> {
            self.calls.lock().push("start");
            if self.fail_start {
                eyre::bail!("service nginx failed to start");
            }
            Ok(())
        }

        async fn reload(&self) -> eyre::Result<()> {
            self.calls.lock().push("reload");
            Ok(())
        }
    }

    enum AcmeBehavior {
        Issue { cert_path: PathBuf, days: i64 },
        Fail { exit_code: i32, output: &'static str },
        ClaimSuccess,
        NotInstalled,
    }

    struct FakeAcme {
        behavior: AcmeBehavior,
        calls: Mutex<Vec<IssueArgs>>,
    }

    impl FakeAcme {
        fn new(behavior: AcmeBehavior) -> Self {
            FakeAcme {
                behavior,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl AcmeClient for FakeAcme {
        async fn request(&self, args: &IssueArgs) -> eyre::Result<CertificateIssueOutcome> {
            self.calls.lock().push(args.clone());

            Ok(match &self.behavior {
                AcmeBehavior::Issue { cert_path, days } => {
                    let not_after = OffsetDateTime::now_utc() + TimeDuration::days(*days);
                    write_cert(cert_path, not_after);
                    CertificateIssueOutcome::from_exit(0, "Successfully received certificate.".to_owned())
                }
                AcmeBehavior::Fail { exit_code, output } => {
                    CertificateIssueOutcome::from_exit(*exit_code, (*output).to_owned())
                }
                AcmeBehavior::ClaimSuccess => CertificateIssueOutcome::from_exit(0, String::new()),
                AcmeBehavior::NotInstalled => eyre::bail!("failed to run certbot: No such file or directory"),
            })
        }
    }

    struct FakeResolver(Vec<IpAddr>);

    impl Resolver for FakeResolver {
        async fn resolve(&self, _domain: &str) -> eyre::Result<Vec<IpAddr>> {
            Ok(self.0.clone())
        }
    }

    struct BrokenResolver;

    impl Resolver for BrokenResolver {
        async fn resolve(&self, domain: &str) -> eyre::Result<Vec<IpAddr>> {
            eyre::bail!("failed to lookup address information for {domain}")
        }
    }

    fn resolves() -> FakeResolver {
        FakeResolver(vec![IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7))])
    }

    /// A proxy that serves the webroot, optionally only from the n-th request on.
    struct WebrootFetcher {
        webroot: PathBuf,
        serve_from: u32,
        requests: Mutex<u32>,
    }

    impl WebrootFetcher {
        fn new(webroot: &Path, serve_from: u32) -> Self {
            WebrootFetcher {
                webroot: webroot.to_owned(),
                serve_from,
                requests: Mutex::new(0),
            }
        }
    }

    impl HttpFetch for WebrootFetcher {
        async fn fetch(&self, url: &str) -> Option<String> {
            let n = {
                let mut requests = self.requests.lock();
                *requests += 1;
                *requests
            };

            if n < self.serve_from {
                return None;
            }

            let (_, token) = url.rsplit_once('/')?;
            fs::read_to_string(self.webroot.join(ACME_CHALLENGE_DIR).join(token)).ok()
        }
    }

    fn write_cert(path: &Path, not_after: OffsetDateTime) {
        let pem = self_signed_pem("example.test", &["example.test"], not_after);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, pem).unwrap();
    }

    struct Host {
        _tmp: tempfile::TempDir,
        config: BootstrapConfig,
    }

    impl Host {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let req = BootstrapRequest::from_app_dir(tmp.path(), "example.test", "ops@example.test");

            fs::create_dir_all(req.proxy_config_path.parent().unwrap()).unwrap();
            fs::write(&req.proxy_config_path, ORIGINAL).unwrap();

            let mut config = BootstrapConfig::new(req);
            config.probe_policy = PollPolicy::new(Duration::from_millis(1), 3);
            config.verify_policy = PollPolicy::new(Duration::from_millis(1), 3);

            Host { _tmp: tmp, config }
        }

        fn cert_path(&self) -> PathBuf {
            self.config.request.certificate_path()
        }

        fn proxy_config(&self) -> String {
            fs::read_to_string(&self.config.request.proxy_config_path).unwrap()
        }

        fn assert_proxy_untouched(&self) {
            assert_eq!(self.proxy_config(), ORIGINAL);
            assert!(!self.config.request.proxy_backup_path().exists());
        }

        fn challenge_files(&self) -> usize {
            match fs::read_dir(self.config.request.challenge_dir()) {
                Ok(dir) => dir.count(),
                Err(_) => 0,
            }
        }

        fn orchestrator(
            &self,
            acme: AcmeBehavior,
            resolver: FakeResolver,
            serve_from: u32,
        ) -> Orchestrator<FakeProxy, FakeAcme, FakeResolver, WebrootFetcher> {
            Orchestrator::new(
                self.config.clone(),
                FakeProxy::default(),
                FakeAcme::new(acme),
                resolver,
                WebrootFetcher::new(&self.config.request.webroot_path, serve_from),
            )
        }

        fn issuing(&self) -> AcmeBehavior {
            AcmeBehavior::Issue {
                cert_path: self.cert_path(),
                days: 90,
            }
        }
    }

    #[tokio::test]
    async fn existing_certificate_takes_read_only_fast_path() {
        let host = Host::new();
        write_cert(&host.cert_path(), OffsetDateTime::now_utc() + TimeDuration::days(45) + TimeDuration::hours(1));

        let orch = host.orchestrator(host.issuing(), resolves(), 1);
        let report = orch.run().await.unwrap();

        assert_eq!(report.state, BootstrapState::AlreadyActive);
        assert_eq!(orch.state(), BootstrapState::AlreadyActive);
        assert_eq!(report.certificate.days_remaining, 45);
        assert!(report.expiry_warning.is_none());
        assert!(report.probe.is_none());

        assert!(orch.proxy.calls.lock().is_empty());
        assert!(orch.acme.calls.lock().is_empty());
        assert_eq!(orch.proxy_state(), ProxyConfigState::Original);
        host.assert_proxy_untouched();
    }

    #[tokio::test]
    async fn near_expiry_emits_advisory_warning() {
        let host = Host::new();
        write_cert(&host.cert_path(), OffsetDateTime::now_utc() + TimeDuration::days(10) + TimeDuration::hours(1));

        let orch = host.orchestrator(host.issuing(), resolves(), 1);
        let report = orch.run().await.unwrap();

        assert_eq!(report.state, BootstrapState::AlreadyActive);
        assert_eq!(report.certificate.days_remaining, 10);
        assert!(report.expiry_warning.unwrap().contains("10 days"));
    }

    #[tokio::test]
    async fn issuance_path_reaches_active_and_restores_proxy() {
        let host = Host::new();

        let orch = host.orchestrator(host.issuing(), resolves(), 2);
        let report = orch.run().await.unwrap();

        assert_eq!(report.state, BootstrapState::Active);
        assert_eq!(report.certificate.subject_cn, "example.test");
        assert!(report.certificate.days_remaining >= 89);

        let probe = report.probe.unwrap();
        assert!(probe.observed);
        assert_eq!(probe.attempts, 2);

        assert_eq!(*orch.proxy.calls.lock(), vec!["start", "reload"]);

        let calls = orch.acme.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].mode, IssueMode::Initial);
        assert_eq!(calls[0].domains, vec!["example.test"]);

        assert_eq!(orch.proxy_state(), ProxyConfigState::Restored);
        host.assert_proxy_untouched();
        assert_eq!(host.challenge_files(), 0);
    }

    #[tokio::test]
    async fn second_run_after_success_changes_nothing() {
        let host = Host::new();

        let first = host.orchestrator(host.issuing(), resolves(), 1);
        assert_eq!(first.run().await.unwrap().state, BootstrapState::Active);

        let second = host.orchestrator(host.issuing(), resolves(), 1);
        assert_eq!(second.run().await.unwrap().state, BootstrapState::AlreadyActive);
        assert!(second.proxy.calls.lock().is_empty());
        assert!(second.acme.calls.lock().is_empty());
        host.assert_proxy_untouched();
    }

    #[tokio::test]
    async fn missing_dns_record_fails_before_touching_proxy() {
        let host = Host::new();

        let orch = host.orchestrator(host.issuing(), FakeResolver(vec![]), 1);
        let err = orch.run().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("DNS"));
        assert!(err.to_string().contains("example.test"));
        assert_eq!(orch.state(), BootstrapState::Failed);

        assert!(orch.proxy.calls.lock().is_empty());
        assert!(orch.acme.calls.lock().is_empty());
        host.assert_proxy_untouched();
    }

    #[tokio::test]
    async fn unreachable_challenge_path_fails_and_restores() {
        let host = Host::new();

        let orch = host.orchestrator(host.issuing(), resolves(), u32::MAX);
        let err = orch.run().await.unwrap_err();

        match &err {
            BootstrapError::Reachability { attempts, url } => {
                assert_eq!(*attempts, 3);
                assert!(url.starts_with("http://example.test/.well-known/acme-challenge/"));
            }
            other => panic!("unexpected {other:?}"),
        }

        assert_eq!(*orch.proxy.calls.lock(), vec!["start", "reload"]);
        assert!(orch.acme.calls.lock().is_empty());
        host.assert_proxy_untouched();
        assert_eq!(host.challenge_files(), 0);
    }

    #[tokio::test]
    async fn rate_limited_issuance_fails_with_hint_and_restores() {
        let host = Host::new();

        let orch = host.orchestrator(
            AcmeBehavior::Fail {
                exit_code: 1,
                output: "An unexpected error occurred:\n\
                         Error creating new order :: too many certificates (5) already issued",
            },
            resolves(),
            1,
        );
        let err = orch.run().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Issuance);
        let diagnostic = err.to_string();
        assert!(diagnostic.contains("too many certificates (5) already issued"));
        assert!(diagnostic.contains(HINT_RATE_LIMIT));
        assert_eq!(orch.state(), BootstrapState::Failed);

        assert_eq!(*orch.proxy.calls.lock(), vec!["start", "reload"]);
        host.assert_proxy_untouched();
        assert!(!host.cert_path().exists());
    }

    #[tokio::test]
    async fn missing_artifact_after_success_is_a_verification_error() {
        let host = Host::new();

        let orch = host.orchestrator(AcmeBehavior::ClaimSuccess, resolves(), 1);
        let err = orch.run().await.unwrap_err();

        match &err {
            BootstrapError::Verification { path, attempts } => {
                assert_eq!(path, &host.cert_path());
                assert_eq!(*attempts, 3);
            }
            other => panic!("unexpected {other:?}"),
        }

        host.assert_proxy_untouched();
    }

    #[tokio::test]
    async fn failure_without_original_config_leaves_none_behind() {
        let host = Host::new();
        fs::remove_file(&host.config.request.proxy_config_path).unwrap();

        let orch = host.orchestrator(AcmeBehavior::ClaimSuccess, resolves(), 1);
        orch.run().await.unwrap_err();

        assert!(!host.config.request.proxy_config_path.exists());
        assert!(!host.config.request.proxy_backup_path().exists());
    }

    #[tokio::test]
    async fn force_reissues_existing_certificate() {
        let mut host = Host::new();
        write_cert(&host.cert_path(), OffsetDateTime::now_utc() + TimeDuration::days(20));
        host.config.force_reissue = true;

        let orch = host.orchestrator(host.issuing(), resolves(), 1);
        let report = orch.run().await.unwrap();

        assert_eq!(report.state, BootstrapState::Active);
        assert!(report.certificate.days_remaining >= 89);
        assert_eq!(orch.acme.calls.lock()[0].mode, IssueMode::ForceRenew);
        host.assert_proxy_untouched();
    }

    #[tokio::test]
    async fn interrupted_run_is_recovered_on_fast_path() {
        let host = Host::new();

        // a previous run was killed after issuance, before restoring the proxy
        let switcher = ProxyConfigSwitcher::for_config(&host.config);
        std::mem::forget(switcher.enter_http_only_mode().unwrap());
        write_cert(&host.cert_path(), OffsetDateTime::now_utc() + TimeDuration::days(90));

        let orch = host.orchestrator(host.issuing(), resolves(), 1);
        assert_eq!(orch.run().await.unwrap().state, BootstrapState::AlreadyActive);

        assert_eq!(*orch.proxy.calls.lock(), vec!["reload"]);
        assert!(orch.acme.calls.lock().is_empty());
        host.assert_proxy_untouched();
    }

    #[tokio::test]
    async fn interrupted_run_without_certificate_converges() {
        let host = Host::new();

        let switcher = ProxyConfigSwitcher::for_config(&host.config);
        std::mem::forget(switcher.enter_http_only_mode().unwrap());

        let orch = host.orchestrator(host.issuing(), resolves(), 1);
        assert_eq!(orch.run().await.unwrap().state, BootstrapState::Active);
        host.assert_proxy_untouched();
    }

    #[tokio::test]
    async fn expired_certificate_is_reported_as_expired() {
        let host = Host::new();
        write_cert(&host.cert_path(), OffsetDateTime::now_utc() - TimeDuration::days(2));

        let orch = host.orchestrator(host.issuing(), resolves(), 1);
        let report = orch.run().await.unwrap();

        assert_eq!(report.state, BootstrapState::AlreadyActive);
        assert!(report.certificate.days_remaining < 0);
        assert!(report.expiry_warning.unwrap().contains("expired"));
        assert!(orch.acme.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn fast_path_does_not_write_to_webroot() {
        let host = Host::new();
        write_cert(&host.cert_path(), OffsetDateTime::now_utc() + TimeDuration::days(60));

        let orch = host.orchestrator(host.issuing(), resolves(), 1);
        orch.run().await.unwrap();

        assert!(!host.config.request.webroot_path.exists());
    }

    #[tokio::test]
    async fn failed_lookup_is_a_dns_configuration_error() {
        let host = Host::new();

        let orch = Orchestrator::new(
            host.config.clone(),
            FakeProxy::default(),
            FakeAcme::new(host.issuing()),
            BrokenResolver,
            WebrootFetcher::new(&host.config.request.webroot_path, 1),
        );
        let err = orch.run().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("DNS"));
        assert!(orch.proxy.calls.lock().is_empty());
        host.assert_proxy_untouched();
    }

    #[tokio::test]
    async fn proxy_start_failure_restores_and_reloads() {
        let host = Host::new();

        let proxy = FakeProxy {
            fail_start: true,
            ..FakeProxy::default()
        };
        let orch = Orchestrator::new(
            host.config.clone(),
            proxy,
            FakeAcme::new(host.issuing()),
            resolves(),
            WebrootFetcher::new(&host.config.request.webroot_path, 1),
        );
        let err = orch.run().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Collaborator);
        assert!(err.to_string().contains("failed to start"));
        assert_eq!(orch.state(), BootstrapState::Failed);
        assert_eq!(*orch.proxy.calls.lock(), vec!["start", "reload"]);
        assert!(orch.acme.calls.lock().is_empty());
        host.assert_proxy_untouched();
    }

    #[tokio::test]
    async fn acme_client_spawn_failure_restores_proxy() {
        let host = Host::new();

        let orch = host.orchestrator(AcmeBehavior::NotInstalled, resolves(), 1);
        let err = orch.run().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Collaborator);
        assert_eq!(orch.proxy_state(), ProxyConfigState::Restored);
        assert_eq!(*orch.proxy.calls.lock(), vec!["start", "reload"]);
        host.assert_proxy_untouched();
        assert_eq!(host.challenge_files(), 0);
    }

    #[tokio::test]
    async fn invalid_domain_is_a_configuration_error() {
        let mut host = Host::new();
        host.config.request.domain = "not a domain".to_owned();

        let orch = host.orchestrator(host.issuing(), resolves(), 1);
        let err = orch.run().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(orch.proxy.calls.lock().is_empty());
        host.assert_proxy_untouched();
    }
}
