//! `WebFetch`: GET a page from an allowed domain and return its text.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::{parse_input, truncate_output, ToolContext, ToolError, ToolHandler, ToolOutput};

const MAX_REDIRECTS: usize = 5;
const USER_AGENT: &str = concat!("anthropic-gateway/", env!("CARGO_PKG_VERSION"));

static SCRIPT_OR_STYLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<(script|style|noscript)\b.*?</(script|style|noscript)\s*>").expect("static regex"));
static COMMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").expect("static regex"));
static BLOCK_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>|</(p|div|li|h[1-6]|tr|section|article)\s*>").expect("static regex"));
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("static regex"));
static BLANK_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n\s*\n+").expect("static regex"));

#[derive(Debug, Deserialize)]
struct WebFetchInput {
    url: String,
}

/// Exact host match or any subdomain of an allowed entry.
pub fn domain_allowed(host: &str, allowed: &[String]) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    allowed.iter().any(|entry| {
        let entry = entry.trim().trim_end_matches('.').to_ascii_lowercase();
        !entry.is_empty() && (host == entry || host.ends_with(&format!(".{entry}")))
    })
}

fn check_url(raw: &str, allowed: &[String]) -> Result<Url, ToolError> {
    let url = Url::parse(raw.trim()).map_err(|e| ToolError::invalid(format!("Invalid URL: {e}")))?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(ToolError::invalid(format!(
                "URL scheme must be http or https, got '{other}'"
            )))
        }
    }
    let host = url
        .host_str()
        .ok_or_else(|| ToolError::invalid("URL has no host"))?;
    if !domain_allowed(host, allowed) {
        return Err(ToolError::DomainRejected {
            domain: host.to_string(),
        });
    }
    Ok(url)
}

/// Reduce an HTML document to readable text.
pub fn html_to_text(html: &str) -> String {
    let text = SCRIPT_OR_STYLE.replace_all(html, "");
    let text = COMMENT.replace_all(&text, "");
    let text = BLOCK_END.replace_all(&text, "\n");
    let text = TAG.replace_all(&text, "");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    let text = text
        .lines()
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n");
    BLANK_RUNS.replace_all(&text, "\n\n").trim().to_string()
}

#[derive(Debug, Clone)]
pub struct WebFetchTool {
    client: reqwest::Client,
    allowed_domains: Arc<Vec<String>>,
    max_output_bytes: usize,
}

impl WebFetchTool {
    pub fn new(
        allowed_domains: Vec<String>,
        timeout: Duration,
        max_output_bytes: usize,
    ) -> Result<Self, reqwest::Error> {
        let allowed_domains = Arc::new(allowed_domains);
        let redirect_domains = Arc::clone(&allowed_domains);

        // Every hop must stay on the allowed list
        let policy = reqwest::redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                return attempt.error(format!("more than {MAX_REDIRECTS} redirects"));
            }
            match check_url(attempt.url().as_str(), &redirect_domains) {
                Ok(_) => attempt.follow(),
                Err(e) => attempt.error(format!("redirect rejected: {e}")),
            }
        });

        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .redirect(policy)
            .build()?;

        Ok(Self {
            client,
            allowed_domains,
            max_output_bytes,
        })
    }
}

#[async_trait]
impl ToolHandler for WebFetchTool {
    fn name(&self) -> &'static str {
        "WebFetch"
    }

    fn validate(&self, input: &Value) -> Result<(), ToolError> {
        let input: WebFetchInput = parse_input(input)?;
        check_url(&input.url, &self.allowed_domains).map(|_| ())
    }

    async fn execute(&self, input: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let input: WebFetchInput = parse_input(&input)?;
        let url = check_url(&input.url, &self.allowed_domains)?;

        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| ToolError::failed(format!("Request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ToolError::failed(format!("{url} returned HTTP {status}")));
        }
        let is_html = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("html"))
            .unwrap_or(false);

        // Stop reading once there is more than we could return
        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| ToolError::failed(format!("Reading {url} failed: {e}")))?
        {
            body.extend_from_slice(&chunk);
            if body.len() > self.max_output_bytes.saturating_mul(4) {
                break;
            }
        }
        debug!(url = %url, bytes = body.len(), is_html, "Fetched");

        let raw = String::from_utf8_lossy(&body);
        let text = if is_html { html_to_text(&raw) } else { raw.into_owned() };
        Ok(ToolOutput::Text(truncate_output(text, self.max_output_bytes)))
    }
}
