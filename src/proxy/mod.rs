//! Reverse proxy configuration and control.
//!
//! While a certificate is being obtained the proxy cannot use its final configuration (which
//! references certificate files that do not exist yet). [`ProxyConfigSwitcher`] parks the
//! original configuration next to the live one and installs a plain-HTTP configuration that
//! serves ACME challenges and forwards everything else to the application.
//!
//! ```text
//! Original --enter_http_only_mode--> HttpOnly --restore_original_mode--> Restored
//! ```
//!
//! Both transitions re-derive what to do from the files on disk, so a run that was killed
//! half way leaves nothing that the next run cannot recover from.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use eyre::WrapErr as _;
use serde::Serialize;

use crate::config::BootstrapConfig;

mod control;
mod template;

pub use self::{
    control::{ComposeStack, ProxyControl},
    template::{http_only_config, is_http_only, MANAGED_MARKER},
};

/// Which configuration the proxy is meant to be running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProxyConfigState {
    Original,
    HttpOnly,
    /// Back on the original configuration after a bootstrap attempt.
    Restored,
}

/// Swaps the proxy configuration file between its original contents and HTTP-only mode.
#[derive(Debug, Clone)]
pub struct ProxyConfigSwitcher {
    config_path: PathBuf,
    backup_path: PathBuf,
    http_only: String,
}

impl ProxyConfigSwitcher {
    /// `http_only` is the full configuration installed by [`enter_http_only_mode`].
    ///
    /// [`enter_http_only_mode`]: ProxyConfigSwitcher::enter_http_only_mode()
    pub fn new(
        config_path: impl Into<PathBuf>,
        backup_path: impl Into<PathBuf>,
        http_only: String,
    ) -> Self {
        ProxyConfigSwitcher {
            config_path: config_path.into(),
            backup_path: backup_path.into(),
            http_only,
        }
    }

    pub fn for_config(config: &BootstrapConfig) -> Self {
        let req = &config.request;
        let rendered = http_only_config(&req.domains(), &config.proxy_webroot, &config.backend);
        ProxyConfigSwitcher::new(&req.proxy_config_path, req.proxy_backup_path(), rendered)
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    /// Whether the file on disk is currently an HTTP-only configuration.
    pub fn is_http_only(&self) -> eyre::Result<bool> {
        Ok(read_optional(&self.config_path)?.is_some_and(|conf| is_http_only(&conf)))
    }

    /// Backs up the current configuration (if any) and installs the HTTP-only one.
    ///
    /// If the live file is already an HTTP-only configuration, an earlier run was interrupted
    /// and the backup on disk still holds the original, so it is kept as is.
    ///
    /// The returned guard restores the original when dropped unless
    /// [`HttpOnlyMode::restore`] was called first.
    pub fn enter_http_only_mode(&self) -> eyre::Result<HttpOnlyMode<'_>> {
        self.enter_with(|path, contents| fs::write(path, contents))
    }

    fn enter_with<W>(&self, write: W) -> eyre::Result<HttpOnlyMode<'_>>
    where
        W: FnOnce(&Path, &str) -> io::Result<()>,
    {
        match read_optional(&self.config_path)? {
            Some(current) if is_http_only(&current) => {
                log::warn!(
                    "{} is already in HTTP-only mode, a previous run did not finish",
                    self.config_path.display()
                );
            }

            Some(_) => {
                fs::copy(&self.config_path, &self.backup_path).wrap_err_with(|| {
                    format!(
                        "back up {} to {}",
                        self.config_path.display(),
                        self.backup_path.display()
                    )
                })?;
                log::debug!("backed up proxy config to {}", self.backup_path.display());
            }

            None if self.backup_path.exists() => {
                log::warn!(
                    "no proxy config at {} but a backup exists; it will be restored afterwards",
                    self.config_path.display()
                );
            }

            None => log::debug!("no proxy config to back up"),
        }

        // written in place so a single-file bind mount sees the new contents
        if let Err(err) = write(&self.config_path, &self.http_only) {
            self.undo_partial_write();
            return Err(err).wrap_err_with(|| format!("write {}", self.config_path.display()));
        }

        log::info!("proxy switched to HTTP-only mode");

        Ok(HttpOnlyMode {
            switcher: self,
            restored: false,
        })
    }

    /// A failed write may leave a truncated file that is neither the original nor HTTP-only.
    fn undo_partial_write(&self) {
        let res = if self.backup_path.exists() {
            self.restore_original_mode().map(drop)
        } else {
            match fs::remove_file(&self.config_path) {
                Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err)
                    .wrap_err_with(|| format!("remove {}", self.config_path.display())),
                _ => Ok(()),
            }
        };

        if let Err(err) = res {
            log::error!("failed to roll back partial proxy config write: {err:#}");
        }
    }

    /// Puts the original configuration back.
    ///
    /// Safe to call in any state and any number of times: with a backup present it is copied
    /// over the live file and removed; without one, a leftover HTTP-only file is removed since
    /// there was no original; otherwise there is nothing to do.
    pub fn restore_original_mode(&self) -> eyre::Result<ProxyConfigState> {
        if self.backup_path.exists() {
            fs::copy(&self.backup_path, &self.config_path).wrap_err_with(|| {
                format!(
                    "restore {} from {}",
                    self.config_path.display(),
                    self.backup_path.display()
                )
            })?;
            fs::remove_file(&self.backup_path)
                .wrap_err_with(|| format!("remove {}", self.backup_path.display()))?;

            log::info!("proxy config restored from backup");
        } else if self.is_http_only()? {
            fs::remove_file(&self.config_path)
                .wrap_err_with(|| format!("remove {}", self.config_path.display()))?;

            log::info!("removed HTTP-only proxy config, there was no original");
        }

        Ok(ProxyConfigState::Restored)
    }
}

/// HTTP-only mode held for the duration of an issuance attempt.
#[must_use = "dropping the guard restores the original configuration immediately"]
#[derive(Debug)]
pub struct HttpOnlyMode<'a> {
    switcher: &'a ProxyConfigSwitcher,
    restored: bool,
}

impl HttpOnlyMode<'_> {
    pub fn state(&self) -> ProxyConfigState {
        if self.restored {
            ProxyConfigState::Restored
        } else {
            ProxyConfigState::HttpOnly
        }
    }

    /// Restores the original configuration, reporting failure to the caller.
    pub fn restore(mut self) -> eyre::Result<ProxyConfigState> {
        self.restored = true;
        self.switcher.restore_original_mode()
    }
}

impl Drop for HttpOnlyMode<'_> {
    fn drop(&mut self) {
        if self.restored {
            return;
        }

        if let Err(err) = self.switcher.restore_original_mode() {
            log::error!("failed to restore proxy configuration: {err:#}");
        }
    }
}

fn read_optional(path: &Path) -> eyre::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).wrap_err_with(|| format!("read {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORIGINAL: &str = "server { listen 443 ssl; ssl_certificate /etc/letsencrypt/live/example.test/fullchain.pem; }\n";

    fn switcher(dir: &Path) -> ProxyConfigSwitcher {
        ProxyConfigSwitcher::new(
            dir.join("nginx.conf"),
            dir.join("nginx.conf.backup"),
            http_only_config(&["example.test"], "/var/www/certbot", "app:8000"),
        )
    }

    #[test]
    fn enter_and_restore_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let sw = switcher(tmp.path());
        fs::write(sw.config_path(), ORIGINAL).unwrap();

        let mode = sw.enter_http_only_mode().unwrap();
        assert_eq!(mode.state(), ProxyConfigState::HttpOnly);
        assert!(sw.is_http_only().unwrap());
        assert_eq!(fs::read_to_string(sw.backup_path()).unwrap(), ORIGINAL);

        assert_eq!(mode.restore().unwrap(), ProxyConfigState::Restored);
        assert_eq!(fs::read_to_string(sw.config_path()).unwrap(), ORIGINAL);
        assert!(!sw.backup_path().exists());
    }

    #[test]
    fn dropping_the_guard_restores() {
        let tmp = tempfile::tempdir().unwrap();
        let sw = switcher(tmp.path());
        fs::write(sw.config_path(), ORIGINAL).unwrap();

        {
            let _mode = sw.enter_http_only_mode().unwrap();
            assert!(sw.is_http_only().unwrap());
        }

        assert_eq!(fs::read_to_string(sw.config_path()).unwrap(), ORIGINAL);
        assert!(!sw.backup_path().exists());
    }

    #[test]
    fn missing_original_is_not_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let sw = switcher(tmp.path());

        let mode = sw.enter_http_only_mode().unwrap();
        assert!(sw.is_http_only().unwrap());
        assert!(!sw.backup_path().exists());

        mode.restore().unwrap();
        assert!(!sw.config_path().exists());
    }

    #[test]
    fn restore_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let sw = switcher(tmp.path());
        fs::write(sw.config_path(), ORIGINAL).unwrap();

        let mode = sw.enter_http_only_mode().unwrap();
        std::mem::forget(mode);

        sw.restore_original_mode().unwrap();
        sw.restore_original_mode().unwrap();
        assert_eq!(fs::read_to_string(sw.config_path()).unwrap(), ORIGINAL);

        // untouched original with no backup
        sw.restore_original_mode().unwrap();
        assert_eq!(fs::read_to_string(sw.config_path()).unwrap(), ORIGINAL);
    }

    #[test]
    fn interrupted_run_keeps_the_original_backup() {
        let tmp = tempfile::tempdir().unwrap();
        let sw = switcher(tmp.path());
        fs::write(sw.config_path(), ORIGINAL).unwrap();

        // first run killed while in HTTP-only mode
        std::mem::forget(sw.enter_http_only_mode().unwrap());

        // second run must not back up the HTTP-only file over the original
        let mode = sw.enter_http_only_mode().unwrap();
        assert_eq!(fs::read_to_string(sw.backup_path()).unwrap(), ORIGINAL);

        mode.restore().unwrap();
        assert_eq!(fs::read_to_string(sw.config_path()).unwrap(), ORIGINAL);
    }

    fn disk_full(path: &Path, contents: &str) -> io::Result<()> {
        fs::write(path, &contents[..contents.len() / 2])?;
        Err(io::Error::new(io::ErrorKind::Other, "no space left on device"))
    }

    #[test]
    fn failed_write_puts_the_original_back() {
        let tmp = tempfile::tempdir().unwrap();
        let sw = switcher(tmp.path());
        fs::write(sw.config_path(), ORIGINAL).unwrap();

        let err = sw.enter_with(disk_full).unwrap_err();
        assert!(format!("{err:#}").contains("no space left"));

        assert_eq!(fs::read_to_string(sw.config_path()).unwrap(), ORIGINAL);
        assert!(!sw.backup_path().exists());

        // the next attempt backs up the real original, not a truncated file
        let mode = sw.enter_http_only_mode().unwrap();
        assert_eq!(fs::read_to_string(sw.backup_path()).unwrap(), ORIGINAL);
        mode.restore().unwrap();
        assert_eq!(fs::read_to_string(sw.config_path()).unwrap(), ORIGINAL);
    }

    #[test]
    fn failed_write_without_original_leaves_no_config() {
        let tmp = tempfile::tempdir().unwrap();
        let sw = switcher(tmp.path());

        sw.enter_with(disk_full).unwrap_err();
        assert!(!sw.config_path().exists());
        assert!(!sw.backup_path().exists());
    }
}
