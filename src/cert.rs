use std::{
    fs,
    io::{BufReader, Cursor},
    path::Path,
};

use der::{
    asn1::{Ia5StringRef, ObjectIdentifier, PrintableStringRef, Utf8StringRef},
    oid::AssociatedOid as _,
    Any, Decode as _, Tag, Tagged as _,
};
use eyre::{eyre, WrapErr as _};
use serde::Serialize;
use time::OffsetDateTime;
use x509_cert::{
    ext::pkix::{name::GeneralName, SubjectAltName},
    name::Name,
};

use crate::poll::{poll, PollPolicy};

const COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");

const SECONDS_PER_DAY: i64 = 86_400;

/// What the issued end-entity certificate says about itself.
///
/// Always derived from the ACME client's files; never cached between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateRecord {
    pub subject_cn: String,
    pub dns_names: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub not_after: OffsetDateTime,
    pub days_remaining: i64,
}

impl CertificateRecord {
    /// Parses the first (end-entity) certificate of a PEM chain.
    pub fn from_pem(pem: &str, now: OffsetDateTime) -> eyre::Result<Self> {
        let mut rdr = BufReader::new(Cursor::new(pem));

        let cert_ee = rustls_pemfile::certs(&mut rdr)
            .next() // EE cert is first
            .ok_or_else(|| eyre!("no certificates in chain"))??;

        let cert = x509_cert::Certificate::from_der(&cert_ee).wrap_err("decode certificate")?;
        let tbs = &cert.tbs_certificate;

        let subject_cn = common_name(&tbs.subject).unwrap_or_default();

        let mut dns_names = Vec::new();
        for ext in tbs.extensions.iter().flatten() {
            if ext.extn_id != SubjectAltName::OID {
                continue;
            }

            let san = SubjectAltName::from_der(ext.extn_value.as_bytes())
                .wrap_err("decode subject alt names")?;

            dns_names.extend(san.0.into_iter().filter_map(|name| match name {
                GeneralName::DnsName(dns) => Some(dns.to_string()),
                _ => None,
            }));
        }

        let not_after = tbs.validity.not_after.to_unix_duration();
        let not_after = i64::try_from(not_after.as_secs())
            .ok()
            .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
            .ok_or_else(|| eyre!("certificate expiry out of range"))?;

        Ok(CertificateRecord {
            subject_cn,
            dns_names,
            not_after,
            days_remaining: days_remaining(not_after, now),
        })
    }

    /// Whether `domain` is the subject CN or one of the DNS alt names.
    pub fn covers(&self, domain: &str) -> bool {
        self.subject_cn.eq_ignore_ascii_case(domain)
            || self
                .dns_names
                .iter()
                .any(|name| name.eq_ignore_ascii_case(domain))
    }

    /// Advisory only: certificates are renewed out of band.
    pub fn expires_within(&self, days: i64) -> bool {
        self.days_remaining < days
    }
}

/// Whole days from `now` until `not_after`, rounded down.
///
/// Negative for expired certificates.
pub fn days_remaining(not_after: OffsetDateTime, now: OffsetDateTime) -> i64 {
    (not_after - now).whole_seconds().div_euclid(SECONDS_PER_DAY)
}

/// Outcome of [`verify_issued_certificate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Found(CertificateRecord),
    NotFound { attempts: u32 },
}

/// Reads and parses the certificate at `cert_path`.
///
/// Returns `Ok(None)` when there is no file.
pub fn read_certificate(cert_path: &Path) -> eyre::Result<Option<CertificateRecord>> {
    if !cert_path.is_file() {
        return Ok(None);
    }

    let pem = fs::read_to_string(cert_path)
        .wrap_err_with(|| format!("read {}", cert_path.display()))?;

    CertificateRecord::from_pem(&pem, OffsetDateTime::now_utc())
        .wrap_err_with(|| format!("parse {}", cert_path.display()))
        .map(Some)
}

/// Waits for the ACME client's artifact to show up, then parses it.
///
/// The client may return before its writes are visible, so existence is polled according to
/// `policy` before giving up with [`Verification::NotFound`].
pub async fn verify_issued_certificate(
    cert_path: &Path,
    expected_domain: &str,
    policy: PollPolicy,
) -> eyre::Result<Verification> {
    let outcome = poll(policy, move |attempt| async move {
        log::trace!("check {attempt} for {}", cert_path.display());
        cert_path.is_file()
    })
    .await;

    if !outcome.satisfied {
        return Ok(Verification::NotFound {
            attempts: outcome.attempts,
        });
    }

    let record = read_certificate(cert_path)?
        .ok_or_else(|| eyre!("{} disappeared while reading", cert_path.display()))?;

    if !record.covers(expected_domain) {
        log::warn!(
            "certificate at {} is for {:?}, not {expected_domain}",
            cert_path.display(),
            record.subject_cn
        );
    }

    Ok(Verification::Found(record))
}

fn common_name(name: &Name) -> Option<String> {
    name.0
        .iter()
        .flat_map(|rdn| rdn.0.iter())
        .find(|atv| atv.oid == COMMON_NAME)
        .and_then(|atv| directory_string(&atv.value))
}

fn directory_string(value: &Any) -> Option<String> {
    match value.tag() {
        Tag::Utf8String => Utf8StringRef::try_from(value).ok().map(|s| s.to_string()),
        Tag::PrintableString => PrintableStringRef::try_from(value)
            .ok()
            .map(|s| s.to_string()),
        Tag::Ia5String => Ia5StringRef::try_from(value).ok().map(|s| s.to_string()),
        _ => None,
    }
}
