use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use kestrel_core::error::AppError;
use kestrel_core::filter::{ResourceFilter, ResourceKind};
use kestrel_core::traits::{Fetcher, SessionFactory};
use reqwest::{Client, StatusCode, header};
use url::Url;

/// Desktop user agents handed out round-robin to new sessions.
pub const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

/// A pooled HTTP client with its own user agent and connection pool.
pub struct HttpSession {
    client: Client,
    user_agent: &'static str,
    filter: Option<ResourceFilter>,
}

impl HttpSession {
    pub fn user_agent(&self) -> &str {
        self.user_agent
    }
}

/// Builds [`HttpSession`]s for the resource pool.
///
/// Each session gets the next user agent from [`USER_AGENTS`].
pub struct HttpSessionFactory {
    next_agent: AtomicUsize,
    connect_timeout: Duration,
}

impl Default for HttpSessionFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpSessionFactory {
    pub fn new() -> Self {
        Self {
            next_agent: AtomicUsize::new(0),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl SessionFactory for HttpSessionFactory {
    type Session = HttpSession;

    async fn create(&self) -> Result<HttpSession, AppError> {
        let index = self.next_agent.fetch_add(1, Ordering::Relaxed) % USER_AGENTS.len();
        let user_agent = USER_AGENTS[index];

        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
        );
        headers.insert(
            header::ACCEPT_LANGUAGE,
            header::HeaderValue::from_static("en-US,en;q=0.5"),
        );

        let client = Client::builder()
            .user_agent(user_agent)
            .default_headers(headers)
            .connect_timeout(self.connect_timeout)
            .build()
            .map_err(|e| AppError::FetchError(format!("Failed to build HTTP client: {e}")))?;

        Ok(HttpSession {
            client,
            user_agent,
            filter: None,
        })
    }

    async fn install_filter(
        &self,
        session: &mut HttpSession,
        filter: &ResourceFilter,
    ) -> Result<(), AppError> {
        session.filter = Some(filter.clone());
        Ok(())
    }

    async fn reset(&self, _session: &mut HttpSession) -> Result<(), AppError> {
        Ok(())
    }

    async fn close(&self, session: HttpSession) {
        drop(session);
    }
}

/// HTTP fetcher using reqwest.
///
/// Downloads raw HTML without rendering JavaScript. By default, SSRF
/// protection is **enabled**: requests to private/reserved IP ranges are
/// blocked. Use [`allow_private_urls`](Self::allow_private_urls) to disable
/// this (e.g., for CLI usage where the user controls the machine).
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    ssrf_protection: bool,
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            ssrf_protection: true,
        }
    }

    /// Disable SSRF protection, allowing requests to private/reserved IPs.
    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }
}

impl Fetcher<HttpSession> for HttpFetcher {
    async fn fetch(
        &self,
        session: &mut HttpSession,
        url: &str,
        timeout: Duration,
    ) -> Result<String, AppError> {
        if self.ssrf_protection {
            validate_url(url).await?;
        }
        if let Some(filter) = &session.filter
            && !filter.allows(url, ResourceKind::Document)
        {
            return Err(AppError::FetchError(format!("Blocked by resource filter: {url}")));
        }

        let response = session
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::FetchTimeout(timeout.as_millis() as u64)
                } else if e.is_connect() {
                    AppError::FetchError(format!("Connection failed: {e}"))
                } else {
                    AppError::FetchError(e.to_string())
                }
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AppError::UpstreamRateLimited(format!("HTTP 429 for {url}")));
        }
        if !status.is_success() {
            return Err(AppError::FetchError(format!(
                "HTTP {} for {}",
                status.as_u16(),
                url
            )));
        }

        response
            .text()
            .await
            .map_err(|e| AppError::FetchError(format!("Failed to read response body: {e}")))
    }
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Validate a URL to prevent server-side request forgery (SSRF).
///
/// 1. Only allow `http` and `https` schemes.
/// 2. Resolve the hostname via DNS.
/// 3. Reject if any resolved IP is private/reserved.
pub async fn validate_url(url: &str) -> Result<(), AppError> {
    let parsed =
        Url::parse(url).map_err(|e| AppError::ValidationError(format!("Invalid URL: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::ValidationError(format!(
                "URL scheme '{scheme}' is not allowed (only http/https)"
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::ValidationError("URL has no host".to_string()))?;

    // Bracketed IPv6 literals come back with their brackets.
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Err(AppError::ValidationError(format!(
                "SSRF blocked: {host} resolves to private/reserved IP"
            )));
        }
        return Ok(());
    }

    let port = parsed.port_or_known_default().unwrap_or(80);
    let addrs: Vec<_> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| AppError::FetchError(format!("DNS resolution failed for {host}: {e}")))?
        .collect();

    if addrs.is_empty() {
        return Err(AppError::FetchError(format!(
            "DNS resolution returned no addresses for {host}"
        )));
    }

    for socket_addr in &addrs {
        if is_private_ip(socket_addr.ip()) {
            return Err(AppError::ValidationError(format!(
                "SSRF blocked: {host} resolves to private/reserved IP {}",
                socket_addr.ip()
            )));
        }
    }

    Ok(())
}

/// Check if an IP address is in a private/reserved/link-local range.
fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local() // 169.254.0.0/16, cloud metadata
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64 // 100.64.0.0/10
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xFFC0) == 0xFE80 // fe80::/10
                || (v6.segments()[0] & 0xFE00) == 0xFC00 // fc00::/7
                || match v6.to_ipv4_mapped() {
                    Some(v4) => is_private_ip(IpAddr::V4(v4)),
                    None => false,
                }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_ipv4() {
        assert!(is_private_ip("127.0.0.1".parse().unwrap()));
        assert!(is_private_ip("10.0.0.1".parse().unwrap()));
        assert!(is_private_ip("192.168.1.1".parse().unwrap()));
        assert!(is_private_ip("169.254.169.254".parse().unwrap()));
        assert!(is_private_ip("100.64.0.1".parse().unwrap()));
        assert!(!is_private_ip("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_private_ipv6() {
        assert!(is_private_ip("::1".parse().unwrap()));
        assert!(is_private_ip("fe80::1".parse().unwrap()));
        assert!(is_private_ip("::ffff:169.254.169.254".parse().unwrap()));
        assert!(!is_private_ip("2001:4860:4860::8888".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_validate_url_rejects_private_literals() {
        for url in ["http://127.0.0.1/admin", "http://[::1]:8080/", "http://169.254.169.254/"] {
            let err = validate_url(url).await.unwrap_err();
            assert!(err.to_string().contains("SSRF blocked"), "{url}: {err}");
        }
    }

    #[tokio::test]
    async fn test_validate_url_rejects_bad_scheme() {
        let err = validate_url("file:///etc/passwd").await.unwrap_err();
        assert!(err.to_string().contains("not allowed"));
    }

    #[tokio::test]
    async fn test_sub_second_timeout_reports_milliseconds() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept and never answer.
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let factory = HttpSessionFactory::new();
        let mut session = factory.create().await.unwrap();
        let err = HttpFetcher::new()
            .allow_private_urls()
            .fetch(&mut session, &format!("http://{addr}/"), Duration::from_millis(150))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::FetchTimeout(150)), "{err}");
        server.abort();
    }

    #[tokio::test]
    async fn test_sessions_rotate_user_agents() {
        let factory = HttpSessionFactory::new();
        let mut agents = Vec::new();
        for _ in 0..USER_AGENTS.len() + 1 {
            agents.push(factory.create().await.unwrap().user_agent().to_string());
        }
        assert_eq!(agents[0], USER_AGENTS[0]);
        assert_eq!(agents[1], USER_AGENTS[1]);
        assert_eq!(agents[USER_AGENTS.len()], USER_AGENTS[0]);
    }

    #[tokio::test]
    async fn test_filter_blocks_tracker_documents() {
        let factory = HttpSessionFactory::new();
        let mut session = factory.create().await.unwrap();
        factory
            .install_filter(&mut session, &ResourceFilter::new(false))
            .await
            .unwrap();

        let err = HttpFetcher::new()
            .allow_private_urls()
            .fetch(
                &mut session,
                "https://www.google-analytics.com/collect",
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("resource filter"));
    }
}
