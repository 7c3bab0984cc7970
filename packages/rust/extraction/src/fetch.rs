//! Tier 1: plain HTTP fetch of server-rendered HTML.

use std::net::IpAddr;
use std::time::Duration;

use reqwest::Client;
use tracing::debug;
use url::Url;

use councilgen_shared::{CouncilgenError, ExtractionError, Result};

/// Maximum redirect hops followed by the static fetch.
const MAX_REDIRECTS: usize = 10;

/// A page returned by the static or rendered tier.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// Final URL after redirects.
    pub url: String,
    /// HTTP status of the final response.
    pub status: u16,
    pub html: String,
}

/// Direct GET with a browser User-Agent and a bounded timeout.
#[derive(Clone)]
pub struct StaticFetcher {
    client: Client,
    timeout: Duration,
    allow_private_hosts: bool,
}

impl StaticFetcher {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .redirect(redirect_policy())
            .timeout(timeout)
            .build()
            .map_err(|e| CouncilgenError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            timeout,
            allow_private_hosts: false,
        })
    }

    /// Allow localhost/private IPs (for mock servers in tests).
    pub fn allow_private_hosts(mut self) -> Self {
        self.allow_private_hosts = true;
        self
    }

    pub fn allows_private_hosts(&self) -> bool {
        self.allow_private_hosts
    }

    /// Fetch `url`. Non-2xx, timeouts and transport failures are errors the
    /// caller escalates on.
    pub async fn fetch(&self, url: &Url) -> std::result::Result<FetchedPage, ExtractionError> {
        validate_target(url, self.allow_private_hosts)?;
        debug!(%url, "static fetch");

        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| self.map_error(url, e))?;

        let status = response.status();
        let final_url = response.url().to_string();

        if !status.is_success() {
            return Err(ExtractionError::FetchHttp {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let html = response.text().await.map_err(|e| self.map_error(url, e))?;

        Ok(FetchedPage {
            url: final_url,
            status: status.as_u16(),
            html,
        })
    }

    fn map_error(&self, url: &Url, e: reqwest::Error) -> ExtractionError {
        if e.is_timeout() {
            ExtractionError::FetchTimeout {
                url: url.to_string(),
                timeout: self.timeout,
            }
        } else {
            ExtractionError::Transport {
                url: url.to_string(),
                message: e.to_string(),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Target validation
// ---------------------------------------------------------------------------

/// Follows up to [`MAX_REDIRECTS`] hops, re-validating every hop's target.
fn redirect_policy() -> reqwest::redirect::Policy {
    reqwest::redirect::Policy::custom(|attempt| {
        if attempt.previous().len() > MAX_REDIRECTS {
            return attempt.error("too many redirects");
        }
        let verdict = match attempt.previous().first() {
            Some(origin) => redirect_allowed(origin, attempt.url()),
            None => validate_target(attempt.url(), false),
        };
        match verdict {
            Ok(()) => attempt.follow(),
            Err(e) => attempt.error(e),
        }
    })
}

/// A hop may reach a private host only when the chain started on one, which
/// happens only when private hosts were allowed for the initial request.
fn redirect_allowed(origin: &Url, next: &Url) -> std::result::Result<(), ExtractionError> {
    let origin_is_private = validate_target(origin, false).is_err();
    validate_target(next, origin_is_private)
}

/// Reject non-HTTP schemes and hosts on loopback/private ranges.
pub fn validate_target(
    url: &Url,
    allow_private_hosts: bool,
) -> std::result::Result<(), ExtractionError> {
    let invalid = |reason: &str| ExtractionError::InvalidTarget {
        url: url.to_string(),
        reason: reason.to_string(),
    };

    match url.scheme() {
        "http" | "https" => {}
        _ => return Err(invalid("only http and https targets are supported")),
    }

    let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
    if allow_private_hosts {
        return Ok(());
    }

    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        if is_private_ip(&ip) {
            return Err(invalid("private or loopback address"));
        }
    } else if host == "localhost" || host.ends_with(".local") || host.ends_with(".internal") {
        return Err(invalid("local hostname"));
    }

    Ok(())
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header_regex, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher(timeout: Duration) -> StaticFetcher {
        StaticFetcher::new("Mozilla/5.0 (test) Chrome/124.0", timeout)
            .unwrap()
            .allow_private_hosts()
    }

    #[test]
    fn blocks_private_targets() {
        for target in [
            "http://127.0.0.1:8080/",
            "http://192.168.1.1/admin",
            "http://10.0.0.1/",
            "http://localhost:3000/api",
            "http://[::1]/",
        ] {
            let url = Url::parse(target).unwrap();
            assert!(
                matches!(
                    validate_target(&url, false),
                    Err(ExtractionError::InvalidTarget { .. })
                ),
                "{target} should be blocked"
            );
        }
    }

    #[test]
    fn redirects_from_public_to_private_hosts_are_refused() {
        let public = Url::parse("https://www.adur-worthing.gov.uk/planning").unwrap();
        let metadata = Url::parse("http://169.254.169.254/latest/meta-data").unwrap();
        let other_public = Url::parse("https://planning.adur-worthing.gov.uk/").unwrap();
        let local = Url::parse("http://127.0.0.1:8080/moved").unwrap();

        assert!(redirect_allowed(&public, &metadata).is_err());
        assert!(redirect_allowed(&public, &local).is_err());
        assert!(redirect_allowed(&public, &other_public).is_ok());
        assert!(redirect_allowed(&local, &local).is_ok());
        assert!(redirect_allowed(&local, &Url::parse("ftp://127.0.0.1/").unwrap()).is_err());
    }

    #[test]
    fn blocks_non_http_schemes() {
        let url = Url::parse("file:///etc/passwd").unwrap();
        assert!(validate_target(&url, true).is_err());
    }

    #[test]
    fn allows_public_targets() {
        let url = Url::parse("https://www.brighton-hove.gov.uk/planning").unwrap();
        assert!(validate_target(&url, false).is_ok());
    }

    #[tokio::test]
    async fn fetch_sends_browser_user_agent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/planning"))
            .and(header_regex("user-agent", "Mozilla/5.0"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<h1>Planning</h1>"))
            .expect(1)
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/planning", server.uri())).unwrap();
        let page = fetcher(Duration::from_secs(5)).fetch(&url).await.unwrap();
        assert_eq!(page.status, 200);
        assert!(page.html.contains("Planning"));
    }

    #[tokio::test]
    async fn fetch_follows_redirects() {
        let server = MockServer::start().await;
        Mock::given(path("/old"))
            .respond_with(
                ResponseTemplate::new(301).insert_header("location", "/new"),
            )
            .mount(&server)
            .await;
        Mock::given(path("/new"))
            .respond_with(ResponseTemplate::new(200).set_body_string("moved here"))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/old", server.uri())).unwrap();
        let page = fetcher(Duration::from_secs(5)).fetch(&url).await.unwrap();
        assert!(page.url.ends_with("/new"));
        assert_eq!(page.html, "moved here");
    }

    #[tokio::test]
    async fn non_success_status_is_http_error() {
        let server = MockServer::start().await;
        Mock::given(path("/"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let url = Url::parse(&server.uri()).unwrap();
        let err = fetcher(Duration::from_secs(5)).fetch(&url).await.unwrap_err();
        assert!(matches!(err, ExtractionError::FetchHttp { status: 503, .. }));
    }

    #[tokio::test]
    async fn slow_response_is_timeout() {
        let server = MockServer::start().await;
        Mock::given(path("/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("late")
                    .set_delay(Duration::from_millis(800)),
            )
            .mount(&server)
            .await;

        let url = Url::parse(&server.uri()).unwrap();
        let err = fetcher(Duration::from_millis(100))
            .fetch(&url)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::FetchTimeout { .. }));
    }
}
