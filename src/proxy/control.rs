use std::{ffi::OsStr, path::PathBuf};

use eyre::WrapErr as _;

use crate::cmd::CommandPrefix;

/// Lifecycle control over the reverse proxy and the application behind it.
///
/// The switcher only edits files; an implementation of this trait makes the proxy pick them up.
#[allow(async_fn_in_trait)]
pub trait ProxyControl {
    /// Brings up the backend and the proxy, then reloads the proxy so it serves the current
    /// configuration file.
    async fn start(&self) -> eyre::Result<()>;

    /// Makes a running proxy re-read its configuration.
    async fn reload(&self) -> eyre::Result<()>;
}

/// Proxy and backend running as services of a compose project.
#[derive(Debug, Clone)]
pub struct ComposeStack {
    compose: CommandPrefix,
    compose_file: PathBuf,
    proxy_service: String,
    app_service: String,
}

impl ComposeStack {
    pub fn new(compose: CommandPrefix, compose_file: impl Into<PathBuf>) -> Self {
        ComposeStack {
            compose,
            compose_file: compose_file.into(),
            proxy_service: "nginx".to_owned(),
            app_service: "app".to_owned(),
        }
    }

    pub fn with_services(mut self, proxy: impl Into<String>, app: impl Into<String>) -> Self {
        self.proxy_service = proxy.into();
        self.app_service = app.into();
        self
    }

    fn args<'a>(&'a self, rest: &'a [&'a str]) -> Vec<&'a OsStr> {
        let mut args = vec![OsStr::new("-f"), self.compose_file.as_os_str()];
        args.extend(rest.iter().map(OsStr::new));
        args
    }
}

impl ProxyControl for ComposeStack {
    async fn start(&self) -> eyre::Result<()> {
        log::info!(
            "starting services {} and {}",
            self.app_service,
            self.proxy_service
        );

        self.compose
            .run_checked(self.args(&["up", "-d", self.app_service.as_str(), self.proxy_service.as_str()]))
            .await
            .wrap_err("start compose services")?;

        // `up -d` leaves an already running proxy on its old configuration
        self.reload().await
    }

    async fn reload(&self) -> eyre::Result<()> {
        let out = self
            .compose
            .run(self.args(&["exec", "-T", self.proxy_service.as_str(), "nginx", "-s", "reload"]))
            .await?;

        if out.success() {
            log::info!("reloaded {}", self.proxy_service);
            return Ok(());
        }

        log::warn!(
            "reloading {} failed ({}), restarting it instead",
            self.proxy_service,
            out.output.trim_end()
        );

        self.compose
            .run_checked(self.args(&["restart", self.proxy_service.as_str()]))
            .await
            .wrap_err_with(|| format!("restart {}", self.proxy_service))?;

        Ok(())
    }
}
