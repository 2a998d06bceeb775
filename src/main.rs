use std::{
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
    time::Duration,
};

use bootstrap::{
    BootstrapConfig, BootstrapError, BootstrapReport, BootstrapRequest, BootstrapState,
    CertbotCli, CommandPrefix, ComposeStack, ErrorKind, Orchestrator, PollPolicy, ReqwestFetcher,
    SystemResolver, DEFAULT_BACKEND,
};
use clap::Parser;
use eyre::WrapErr as _;
use serde::Serialize;

/// Obtain a first TLS certificate for this host, or report on the one it already has.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Re-issue even if a certificate is already present
    #[arg(long)]
    force: bool,

    /// Primary domain of the certificate
    #[arg(long, env = "ACME_BOOTSTRAP_DOMAIN")]
    domain: String,

    /// Contact address registered with the CA
    #[arg(long, env = "ACME_BOOTSTRAP_EMAIL")]
    email: String,

    /// Additional names to include (comma-separated)
    #[arg(long = "san", env = "ACME_BOOTSTRAP_SANS", value_delimiter = ',')]
    alt_names: Vec<String>,

    /// Deployment directory containing `certbot/` and `nginx/`
    #[arg(long, env = "ACME_BOOTSTRAP_APP_DIR", default_value = ".")]
    app_dir: PathBuf,

    /// Use the CA's staging environment
    #[arg(long, env = "ACME_BOOTSTRAP_STAGING")]
    staging: bool,

    /// Compose command
    #[arg(long, env = "ACME_BOOTSTRAP_COMPOSE", default_value = "docker-compose")]
    compose: String,

    /// Compose file [default: <app-dir>/docker-compose.yml]
    #[arg(long, env = "ACME_BOOTSTRAP_COMPOSE_FILE")]
    compose_file: Option<PathBuf>,

    /// Proxy service name in the compose file
    #[arg(long, env = "ACME_BOOTSTRAP_PROXY_SERVICE", default_value = "nginx")]
    proxy_service: String,

    /// Application service name in the compose file
    #[arg(long, env = "ACME_BOOTSTRAP_APP_SERVICE", default_value = "app")]
    app_service: String,

    /// Command that runs certbot [default: <compose> -f <compose-file> run --rm --entrypoint certbot certbot]
    #[arg(long, env = "ACME_BOOTSTRAP_CERTBOT")]
    certbot: Option<String>,

    /// Upstream the HTTP-only configuration proxies to
    #[arg(long, env = "ACME_BOOTSTRAP_BACKEND", default_value = DEFAULT_BACKEND)]
    backend: String,

    /// Seconds to keep probing the challenge path
    #[arg(long, env = "ACME_BOOTSTRAP_PROBE_TIMEOUT", default_value_t = 60)]
    probe_timeout: u64,

    /// Seconds between probes
    #[arg(long, env = "ACME_BOOTSTRAP_PROBE_INTERVAL", default_value_t = 5)]
    probe_interval: u64,

    /// Write the final report as JSON to this file
    #[arg(long)]
    report: Option<PathBuf>,
}

impl Cli {
    fn compose_file(&self) -> PathBuf {
        self.compose_file
            .clone()
            .unwrap_or_else(|| self.app_dir.join("docker-compose.yml"))
    }

    fn config(&self) -> BootstrapConfig {
        let req = BootstrapRequest::from_app_dir(&self.app_dir, &self.domain, &self.email)
            .with_alt_names(self.alt_names.iter().filter(|name| !name.is_empty()));

        let mut config = BootstrapConfig::new(req);
        config.force_reissue = self.force;
        config.staging = self.staging;
        config.backend = self.backend.clone();
        config.probe_policy = PollPolicy::from_timeout(
            Duration::from_secs(self.probe_timeout),
            Duration::from_secs(self.probe_interval),
        );
        config
    }

    fn proxy(&self) -> eyre::Result<ComposeStack> {
        let compose = CommandPrefix::parse(&self.compose).wrap_err("--compose")?;
        Ok(ComposeStack::new(compose, self.compose_file())
            .with_services(&self.proxy_service, &self.app_service))
    }

    fn certbot(&self) -> eyre::Result<CertbotCli> {
        let line = match &self.certbot {
            Some(line) => line.clone(),
            None => format!(
                "{} -f {} run --rm --entrypoint certbot certbot",
                self.compose,
                self.compose_file().display()
            ),
        };

        Ok(CertbotCli::new(
            CommandPrefix::parse(&line).wrap_err("--certbot")?,
        ))
    }
}

fn print_report(report: &BootstrapReport) {
    let how = match report.state {
        BootstrapState::AlreadyActive => "already present",
        _ => "issued",
    };

    println!("Certificate for {} is active ({how}).", report.domain);
    println!("  subject:        {}", report.certificate.subject_cn);
    if !report.certificate.dns_names.is_empty() {
        println!("  names:          {}", report.certificate.dns_names.join(", "));
    }
    println!("  expires:        {}", report.certificate.not_after);
    println!("  days remaining: {}", report.certificate.days_remaining);

    if let Some(warning) = &report.expiry_warning {
        eprintln!("warning: {warning}");
    }
}

/// What `--report` records for a failed run.
#[derive(Debug, Serialize)]
struct FailureReport<'a> {
    state: BootstrapState,
    domain: &'a str,
    kind: Option<ErrorKind>,
    error: String,
}

impl<'a> FailureReport<'a> {
    fn new(domain: &'a str, err: &eyre::Report) -> Self {
        FailureReport {
            state: BootstrapState::Failed,
            domain,
            kind: err.downcast_ref::<BootstrapError>().map(BootstrapError::kind),
            error: format!("{err:#}"),
        }
    }
}

/// The report is a by-product; failing to write it does not change the outcome of the run.
fn write_report(path: &Path, report: &impl Serialize) {
    let res = serde_json::to_string_pretty(report)
        .map_err(eyre::Report::from)
        .and_then(|json| {
            fs::write(path, json).wrap_err_with(|| format!("write report to {}", path.display()))
        });

    if let Err(err) = res {
        log::error!("{err:#}");
    }
}

async fn run(cli: &Cli) -> eyre::Result<BootstrapReport> {
    let orchestrator = Orchestrator::new(
        cli.config(),
        cli.proxy()?,
        cli.certbot()?,
        SystemResolver,
        ReqwestFetcher::new()?,
    );

    Ok(orchestrator.run().await?)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    if let Err(err) = color_eyre::install() {
        eprintln!("{err}");
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let res = run(&cli).await;

    if let Some(path) = &cli.report {
        match &res {
            Ok(report) => write_report(path, report),
            Err(err) => write_report(path, &FailureReport::new(&cli.domain, err)),
        }
    }

    match res {
        Ok(report) => {
            print_report(&report);
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        }
    }
}
