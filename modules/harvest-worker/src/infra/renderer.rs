use anyhow::Result;
use async_trait::async_trait;

use browserless_client::{BrowserlessClient, ScrollOptions};

use crate::traits::PageRenderer;

/// Renders through a headless browser, scrolling a fixed number of times so
/// lazily loaded results are in the page before it is read.
pub struct ScrollingRenderer {
    client: BrowserlessClient,
    options: ScrollOptions,
}

impl ScrollingRenderer {
    pub fn new(client: BrowserlessClient, options: ScrollOptions) -> Self {
        Self { client, options }
    }
}

#[async_trait]
impl PageRenderer for ScrollingRenderer {
    async fn render(&self, url: &str) -> Result<String> {
        Ok(self.client.content_after_scroll(url, self.options).await?)
    }
}
