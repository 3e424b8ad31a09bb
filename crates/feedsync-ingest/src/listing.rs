//! Listing enumeration
//!
//! Fetches the listing page, extracts archive links and turns the ones newer
//! than the watermark into work items in ascending key order.

use async_trait::async_trait;
use feedsync_common::types::{Watermark, WorkItem};
use regex::Regex;
use reqwest::Client;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ListingConfig;
use crate::error::EnumerationError;

/// Archive links as they appear in the listing markup
const ARCHIVE_LINK_PATTERN: &str = r#"href="([^"]+\.zip)""#;

/// Source of the work items for one run
#[async_trait]
pub trait WorkSource: Send + Sync {
    /// Items newer than `watermark`, sorted ascending by key, without duplicates
    async fn enumerate(&self, watermark: &Watermark) -> Result<Vec<WorkItem>, EnumerationError>;
}

/// Pulls archive links out of listing markup
#[derive(Debug, Clone)]
pub struct LinkExtractor {
    pattern: Regex,
}

impl LinkExtractor {
    pub fn new() -> Result<Self, EnumerationError> {
        Ok(Self {
            pattern: Regex::new(ARCHIVE_LINK_PATTERN)?,
        })
    }

    /// Every archive href in document order, duplicates included
    pub fn links<'a>(&'a self, markup: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.pattern
            .captures_iter(markup)
            .filter_map(|captures| captures.get(1))
            .map(|m| m.as_str())
    }
}

/// Directory that relative archive links resolve against.
///
/// The listing may be reached through redirects, so this is derived from the
/// final address of the page and always ends in a slash.
pub fn listing_base(final_url: &Url) -> Url {
    let mut base = final_url.clone();
    let path = format!("{}/", final_url.path().trim_end_matches('/'));
    base.set_path(&path);
    base.set_query(None);
    base.set_fragment(None);
    base
}

/// Address of an archive: the link text appended to the listing directory.
///
/// Links are never resolved as references, so absolute and root-relative
/// hrefs still point below `base`.
fn archive_locator(base: &Url, href: &str) -> Result<Url, url::ParseError> {
    Url::parse(&format!("{}{}", base, href.trim_start_matches('/')))
}

/// Builds the work items for one listing page.
pub fn parse_listing(
    extractor: &LinkExtractor,
    markup: &str,
    base: &Url,
    watermark: &Watermark,
) -> Vec<WorkItem> {
    let mut items: Vec<WorkItem> = extractor
        .links(markup)
        .filter(|href| watermark.is_newer(href))
        .filter_map(|href| match archive_locator(base, href) {
            Ok(locator) => Some(WorkItem::new(href, locator.to_string())),
            Err(e) => {
                warn!(href = %href, error = %e, "Skipping unresolvable archive link");
                None
            }
        })
        .collect();

    items.sort_by(|a, b| a.key.cmp(&b.key));
    items.dedup_by(|a, b| a.key == b.key);
    items
}

/// HTTP listing enumerator
pub struct ListingClient {
    client: Client,
    url: Url,
    extractor: LinkExtractor,
}

impl ListingClient {
    pub fn new(config: &ListingConfig) -> Result<Self, EnumerationError> {
        let url = Url::parse(config.url.trim()).map_err(|source| EnumerationError::InvalidUrl {
            url: config.url.clone(),
            source,
        })?;

        let client = Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.as_str())
            .build()?;

        Ok(Self {
            client,
            url,
            extractor: LinkExtractor::new()?,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl WorkSource for ListingClient {
    async fn enumerate(&self, watermark: &Watermark) -> Result<Vec<WorkItem>, EnumerationError> {
        debug!(url = %self.url, "Fetching listing");

        let response = self.client.get(self.url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(EnumerationError::Status(response.status().as_u16()));
        }

        let base = listing_base(response.url());
        let markup = response.text().await?;

        let items = parse_listing(&self.extractor, &markup, &base, watermark);
        info!(
            base = %base,
            count = items.len(),
            "Discovered {} new archive(s)",
            items.len()
        );

        Ok(items)
    }
}
