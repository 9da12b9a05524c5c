pub mod error;

pub use error::{BrowserlessError, Result};

use std::time::Duration;

use serde::Serialize;

/// Puppeteer script run by the /function endpoint. Loads the page, scrolls to
/// the bottom `cycles` times with a fixed settle delay in between so lazily
/// loaded results materialize, then returns the rendered document.
const SCROLL_SCRIPT: &str = r#"export default async function ({ page, context }) {
  await page.goto(context.url, { waitUntil: "networkidle2" });
  for (let i = 0; i < context.cycles; i++) {
    await page.evaluate(() => window.scrollTo(0, document.body.scrollHeight));
    await new Promise((resolve) => setTimeout(resolve, context.settleMs));
  }
  return { data: await page.content(), type: "text/html" };
}"#;

/// How many scroll-and-wait cycles to run before reading the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollOptions {
    pub cycles: u32,
    pub settle: Duration,
}

impl Default for ScrollOptions {
    fn default() -> Self {
        Self {
            cycles: 10,
            settle: Duration::from_millis(500),
        }
    }
}

#[derive(Serialize)]
struct FunctionRequest<'a> {
    code: &'static str,
    context: FunctionContext<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FunctionContext<'a> {
    url: &'a str,
    cycles: u32,
    settle_ms: u64,
}

pub struct BrowserlessClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl BrowserlessClient {
    pub fn new(base_url: &str, token: Option<&str>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| BrowserlessError::Setup(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        let mut endpoint = format!("{}/{path}", self.base_url);
        if let Some(ref token) = self.token {
            endpoint.push_str(&format!("?token={token}"));
        }
        endpoint
    }

    /// Render a URL, scrolling to the bottom `options.cycles` times with
    /// `options.settle` between scrolls, and return the resulting HTML.
    pub async fn content_after_scroll(&self, url: &str, options: ScrollOptions) -> Result<String> {
        let request = FunctionRequest {
            code: SCROLL_SCRIPT,
            context: FunctionContext {
                url,
                cycles: options.cycles,
                settle_ms: options.settle.as_millis() as u64,
            },
        };

        tracing::debug!(url, cycles = options.cycles, "browserless: rendering with scroll");
        self.post_for_text("function", &request).await
    }

    async fn post_for_text<B: Serialize>(&self, path: &str, body: &B) -> Result<String> {
        let resp = self
            .client
            .post(self.endpoint(path))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(BrowserlessError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(resp.text().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn scroll_render_posts_script_context() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/function"))
            .and(query_param("token", "secret"))
            .and(body_partial_json(json!({
                "context": { "url": "https://example.com/search?q=x", "cycles": 3, "settleMs": 250 }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
            .expect(1)
            .mount(&server)
            .await;

        let client = BrowserlessClient::new(&server.uri(), Some("secret")).unwrap();
        let html = client
            .content_after_scroll(
                "https://example.com/search?q=x",
                ScrollOptions {
                    cycles: 3,
                    settle: Duration::from_millis(250),
                },
            )
            .await
            .unwrap();

        assert_eq!(html, "<html>ok</html>");
    }

    #[tokio::test]
    async fn non_success_status_is_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/function"))
            .respond_with(ResponseTemplate::new(429).set_body_string("too many sessions"))
            .mount(&server)
            .await;

        let client = BrowserlessClient::new(&format!("{}/", server.uri()), None).unwrap();
        let err = client
            .content_after_scroll("https://example.com", ScrollOptions::default())
            .await
            .unwrap_err();

        match err {
            BrowserlessError::Api { status, message } => {
                assert_eq!(status, 429);
                assert_eq!(message, "too many sessions");
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[test]
    fn default_scroll_matches_ten_half_second_cycles() {
        let options = ScrollOptions::default();
        assert_eq!(options.cycles, 10);
        assert_eq!(options.settle, Duration::from_millis(500));
    }
}
