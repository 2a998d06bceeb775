/// First line of every configuration rendered by [`http_only_config`].
///
/// Its presence is how an interrupted run is recognised.
pub const MANAGED_MARKER: &str = "# managed by acme-bootstrap: http-only mode";

/// Renders a minimal nginx configuration that serves ACME challenges from `webroot` and proxies
/// everything else to `backend` over plain HTTP.
pub fn http_only_config(server_names: &[&str], webroot: &str, backend: &str) -> String {
    let server_names = server_names.join(" ");

    format!(
        r#"{MANAGED_MARKER}
# The original configuration is parked next to this file and restored once the
# certificate has been issued.

events {{
    worker_connections 1024;
}}

http {{
    server {{
        listen 80;
        listen [::]:80;
        server_name {server_names};

        location /.well-known/acme-challenge/ {{
            root {webroot};
            default_type text/plain;
            try_files $uri =404;
        }}

        location / {{
            proxy_pass http://{backend};
            proxy_set_header Host $host;
            proxy_set_header X-Real-IP $remote_addr;
            proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
            proxy_set_header X-Forwarded-Proto $scheme;
        }}
    }}
}}
"#
    )
}

/// Whether `contents` was rendered by [`http_only_config`].
pub fn is_http_only(contents: &str) -> bool {
    contents
        .lines()
        .next()
        .is_some_and(|line| line.trim_end() == MANAGED_MARKER)
}
