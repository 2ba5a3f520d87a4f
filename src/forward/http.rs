use anyhow::{anyhow, Context, Result};
use std::time::Duration;
use url::Url;

use super::{ResultPayload, ResultTransport};

/// Collector endpoint used when the configured URL has no path.
const DEFAULT_UPLOAD_PATH: &str = "/upload_result";

/// JSON POST to the collector's upload endpoint.
pub struct HttpTransport {
    url: String,
    agent: ureq::Agent,
}

impl HttpTransport {
    pub fn new(mut url: Url, timeout: Duration) -> Self {
        if url.path().is_empty() || url.path() == "/" {
            url.set_path(DEFAULT_UPLOAD_PATH);
        }
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            url: url.to_string(),
            agent,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl ResultTransport for HttpTransport {
    fn describe(&self) -> String {
        self.url.clone()
    }

    fn send(&mut self, payload: &ResultPayload) -> Result<()> {
        let response = self
            .agent
            .post(&self.url)
            .send_json(payload)
            .map_err(|err| match err {
                ureq::Error::Status(code, response) => anyhow!(
                    "collector rejected result with HTTP {}: {}",
                    code,
                    response.into_string().unwrap_or_default()
                ),
                other => anyhow::Error::new(other).context("post result"),
            })?;
        let status = response.status();
        let body = response.into_string().context("read collector reply")?;
        if !(200..300).contains(&status) {
            return Err(anyhow!("collector replied HTTP {}: {}", status, body));
        }
        if !is_plain_ack(&body) {
            log::debug!("collector accepted result with reply {}", body.trim());
        }
        Ok(())
    }
}

/// `{"status":"ok"}` or `{"status":"saved"}`; any other 2xx body still counts
/// as delivered.
fn is_plain_ack(body: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| value.get("status")?.as_str().map(str::to_owned))
        .map(|status| status == "ok" || status == "saved")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_host_gets_upload_path() {
        let timeout = Duration::from_secs(1);
        let transport = HttpTransport::new(Url::parse("http://10.0.0.2:5000").unwrap(), timeout);
        assert_eq!(transport.url(), "http://10.0.0.2:5000/upload_result");

        let transport =
            HttpTransport::new(Url::parse("http://10.0.0.2:5000/api/results").unwrap(), timeout);
        assert_eq!(transport.url(), "http://10.0.0.2:5000/api/results");
    }

    #[test]
    fn recognises_plain_acknowledgements() {
        assert!(is_plain_ack(r#"{"status":"ok"}"#));
        assert!(is_plain_ack(r#"{"status":"saved"}"#));
        assert!(!is_plain_ack("File received"));
        assert!(!is_plain_ack(r#"{"status":"queued"}"#));
    }
}
