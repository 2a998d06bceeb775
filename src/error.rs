use std::{fmt, path::PathBuf};

use serde::Serialize;

/// Coarse classification of a failed bootstrap run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    Configuration,
    Reachability,
    Issuance,
    Verification,
    Collaborator,
}

/// Terminal failure of a bootstrap run.
///
/// By the time one of these reaches the caller, the proxy configuration has already been put
/// back the way it was found.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    /// Bad domain, contact or paths, or a domain that does not resolve.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The challenge marker was never observed through the public URL.
    #[error("challenge path {url} was not reachable after {attempts} attempts")]
    Reachability { url: String, attempts: u32 },

    /// The ACME client exited unsuccessfully.
    #[error(transparent)]
    Issuance(#[from] IssuanceFailure),

    /// The ACME client reported success but no artifact showed up.
    #[error("certificate not found at {} after {attempts} checks", path.display())]
    Verification { path: PathBuf, attempts: u32 },

    /// A collaborator (proxy, process runner, filesystem) failed outright.
    #[error("{0:#}")]
    Collaborator(eyre::Report),
}

impl From<eyre::Report> for BootstrapError {
    fn from(err: eyre::Report) -> BootstrapError {
        BootstrapError::Collaborator(err)
    }
}

impl BootstrapError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BootstrapError::Configuration(_) => ErrorKind::Configuration,
            BootstrapError::Reachability { .. } => ErrorKind::Reachability,
            BootstrapError::Issuance(_) => ErrorKind::Issuance,
            BootstrapError::Verification { .. } => ErrorKind::Verification,
            BootstrapError::Collaborator(_) => ErrorKind::Collaborator,
        }
    }
}

/// A non-zero exit from the ACME client along with everything it printed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuanceFailure {
    pub exit_code: i32,
    pub output: String,
    pub hints: Vec<&'static str>,
}

impl IssuanceFailure {
    pub fn new(exit_code: i32, output: String) -> Self {
        let hints = remediation_hints(&output);
        IssuanceFailure {
            exit_code,
            output,
            hints,
        }
    }
}

impl std::error::Error for IssuanceFailure {}

impl fmt::Display for IssuanceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ACME client exited with code {}", self.exit_code)?;

        if !self.output.is_empty() {
            writeln!(f, "--- ACME client output ---")?;
            writeln!(f, "{}", self.output.trim_end())?;
            writeln!(f, "--- end of output ---")?;
        }

        writeln!(f, "Possible causes:")?;
        for hint in &self.hints {
            writeln!(f, "  - {hint}")?;
        }

        Ok(())
    }
}

pub(crate) const HINT_RATE_LIMIT: &str =
    "Rate limited by the CA: too many certificates were issued for this domain recently. \
     Wait before retrying, or use the staging environment while testing.";
pub(crate) const HINT_DNS: &str =
    "DNS: the domain must resolve to this host's public address (check A/AAAA records).";
pub(crate) const HINT_PORT_80: &str =
    "Port 80 must be reachable from the internet (check the firewall and cloud security groups).";
pub(crate) const HINT_CAA: &str =
    "CAA records on the domain must allow the CA to issue (e.g. `0 issue \"letsencrypt.org\"`).";

/// Output signatures that point at a particular remediation.
const SIGNATURES: &[(&str, &str)] = &[
    ("too many certificates", HINT_RATE_LIMIT),
    ("ratelimited", HINT_RATE_LIMIT),
    ("nxdomain", HINT_DNS),
    ("dns problem", HINT_DNS),
    ("connection refused", HINT_PORT_80),
    ("timeout during connect", HINT_PORT_80),
    ("caa record", HINT_CAA),
];

/// Ranks the fixed hint list so that whatever the captured output points at comes first.
pub fn remediation_hints(output: &str) -> Vec<&'static str> {
    let haystack = output.to_ascii_lowercase();
    let mut hints = Vec::with_capacity(4);

    for (needle, hint) in SIGNATURES {
        if haystack.contains(needle) && !hints.contains(hint) {
            hints.push(*hint);
        }
    }

    for hint in [HINT_RATE_LIMIT, HINT_DNS, HINT_PORT_80, HINT_CAA] {
        if !hints.contains(&hint) {
            hints.push(hint);
        }
    }

    hints
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_hint_comes_first() {
        let output = "An unexpected error occurred:\n\
                      Error creating new order :: too many certificates already issued";
        let hints = remediation_hints(output);
        assert_eq!(hints[0], HINT_RATE_LIMIT);
        assert_eq!(hints.len(), 4);
    }

    #[test]
    fn unknown_output_keeps_default_order() {
        let hints = remediation_hints("something else went wrong");
        assert_eq!(hints, vec![HINT_RATE_LIMIT, HINT_DNS, HINT_PORT_80, HINT_CAA]);
    }

    #[test]
    fn dns_and_caa_signatures_are_ranked() {
        let hints = remediation_hints("DNS problem: NXDOMAIN looking up A; CAA record prevents issuance");
        assert_eq!(&hints[..2], &[HINT_DNS, HINT_CAA]);
    }

    #[test]
    fn issuance_failure_display_contains_output_and_hints() {
        let failure = IssuanceFailure::new(1, "too many certificates".to_owned());
        let text = failure.to_string();
        assert!(text.contains("exited with code 1"));
        assert!(text.contains("too many certificates"));
        assert!(text.contains("Rate limited"));

        let err = BootstrapError::from(failure);
        assert_eq!(err.kind(), ErrorKind::Issuance);
    }
}
