use std::time::Duration;

use eyre::WrapErr as _;

pub(crate) fn client() -> eyre::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(10))
        // the probe has to see exactly what the CA will see on port 80
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .wrap_err("build http client")
}

/// GETs `url`, returning the body of a 2xx response.
///
/// Transport errors and other statuses are reported as `None`; during a probe they just mean
/// "not reachable yet".
pub(crate) async fn req_get_body(client: &reqwest::Client, url: &str) -> Option<String> {
    log::trace!("GET {url}");

    let res = match client.get(url).send().await {
        Ok(res) => res,
        Err(err) => {
            log::debug!("GET {url} failed: {err}");
            return None;
        }
    };

    let status = res.status();
    if !status.is_success() {
        log::debug!("GET {url} returned {status}");
        return None;
    }

    Some(req_safe_read_body(res).await)
}

pub(crate) async fn req_safe_read_body(res: reqwest::Response) -> String {
    // a proxy may close the connection abruptly even though we did get the body
    res.text().await.unwrap_or_default()
}
