//! Index-page table scraping
//!
//! Several regions publish a page with one table row per week and the data
//! file linked from a column headed "Data File", "Download", "DSM Data" or
//! similar. The header cell is found by synonym, and every hyperlink in
//! that column becomes a candidate.

use async_trait::async_trait;
use chrono::NaiveDate;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use super::{confirmed_artifact, file_name, horizon_cutoff, Discovery, WindowParser};
use crate::config::{DiscoveryStrategy, SourceDescriptor};
use crate::error::{IngestError, Result};
use crate::models::{collapse_whitespace, Artifact};
use crate::normalize::header_token;
use crate::remote::RemoteSource;

/// Hyperlink taken from the matched column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapedLink {
    pub url: Url,
    pub name: String,
    /// Whole row text, used when the file name carries no window
    pub row_text: String,
}

pub struct TableScrape {
    remote: Arc<dyn RemoteSource>,
    index_path: String,
    synonyms: Vec<String>,
    link_pattern: Option<Regex>,
    windows: WindowParser,
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| IngestError::Discovery(format!("selector '{}': {}", css, e)))
}

fn element_text(element: &ElementRef<'_>) -> String {
    collapse_whitespace(&element.text().collect::<Vec<_>>().join(" "))
}

impl TableScrape {
    pub fn new(descriptor: &SourceDescriptor, remote: Arc<dyn RemoteSource>) -> Result<Self> {
        let DiscoveryStrategy::TableScrape {
            index_path,
            column_synonyms,
            link_pattern,
        } = &descriptor.strategy
        else {
            return Err(IngestError::Config(format!(
                "{}: strategy is not table_scrape",
                descriptor.region
            )));
        };

        Ok(Self {
            remote,
            index_path: index_path.clone(),
            synonyms: column_synonyms
                .iter()
                .map(|s| header_token(s))
                .filter(|s| !s.is_empty())
                .collect(),
            link_pattern: link_pattern.as_deref().map(Regex::new).transpose()?,
            windows: WindowParser::new(&descriptor.window_patterns)?,
        })
    }

    pub fn index_url(&self, base: &Url) -> Result<Url> {
        if self.index_path.trim().is_empty() {
            return Ok(base.clone());
        }
        base.join(self.index_path.trim())
            .map_err(|e| IngestError::Config(format!("index path '{}': {}", self.index_path, e)))
    }

    fn header_matches(&self, text: &str) -> bool {
        let token = header_token(text);
        !token.is_empty() && self.synonyms.iter().any(|s| token.contains(s.as_str()))
    }

    /// Links from the matched column of every table on the page
    ///
    /// Rows without a usable link are skipped.
    pub fn extract_links(&self, html: &str, page_url: &Url) -> Result<Vec<ScrapedLink>> {
        let document = Html::parse_document(html);
        let base_selector = selector("base[href]")?;
        let table_selector = selector("table")?;
        let row_selector = selector("tr")?;
        let cell_selector = selector("th, td")?;
        let link_selector = selector("a[href]")?;

        let base = document
            .select(&base_selector)
            .next()
            .and_then(|b| b.value().attr("href"))
            .and_then(|href| page_url.join(href).ok())
            .unwrap_or_else(|| page_url.clone());

        let mut seen = HashSet::new();
        let mut links = Vec::new();

        for table in document.select(&table_selector) {
            let mut column: Option<usize> = None;

            for (row_index, row) in table.select(&row_selector).enumerate() {
                let cells: Vec<ElementRef<'_>> = row.select(&cell_selector).collect();

                let Some(col) = column else {
                    column = cells.iter().position(|c| self.header_matches(&element_text(c)));
                    if let Some(col) = column {
                        debug!(row = row_index, column = col, "Matched link column header");
                    }
                    continue;
                };

                let Some(cell) = cells.get(col) else {
                    debug!(row = row_index, "Row has no cell in the link column; skipping");
                    continue;
                };

                let row_text = element_text(&row);
                let mut found = false;
                for anchor in cell.select(&link_selector) {
                    let Some(href) = anchor.value().attr("href").map(str::trim) else {
                        continue;
                    };
                    let url = match base.join(href) {
                        Ok(url) => url,
                        Err(e) => {
                            warn!(href, error = %e, "Skipping malformed link");
                            continue;
                        },
                    };
                    if let Some(pattern) = &self.link_pattern {
                        if !pattern.is_match(url.as_str()) {
                            continue;
                        }
                    }
                    let Some(name) = file_name(&url) else {
                        warn!(url = %url, "Skipping link without a file name");
                        continue;
                    };
                    found = true;
                    if seen.insert(url.clone()) {
                        links.push(ScrapedLink {
                            url,
                            name,
                            row_text: row_text.clone(),
                        });
                    }
                }
                if !found {
                    debug!(row = row_index, "No matching link in row; skipping");
                }
            }
        }

        Ok(links)
    }
}

#[async_trait]
impl Discovery for TableScrape {
    fn name(&self) -> &'static str {
        "table_scrape"
    }

    async fn discover(&self, descriptor: &SourceDescriptor, today: NaiveDate) -> Result<Vec<Artifact>> {
        let page_url = self.index_url(&descriptor.base_url)?;
        info!(region = %descriptor.region, url = %page_url, "Fetching index page");
        let html = self.remote.fetch_text(&page_url).await.map_err(|e| {
            IngestError::Discovery(format!("index page {}: {}", page_url, e))
        })?;

        // parsed document is not Send; extract owned links before awaiting probes
        let links = self.extract_links(&html, &page_url)?;
        let cutoff = horizon_cutoff(today, descriptor.horizon_days);
        let mut artifacts = Vec::new();

        for link in links {
            let Some(window) = self
                .windows
                .parse(&link.name)
                .or_else(|| self.windows.parse(&link.row_text))
            else {
                warn!(url = %link.url, row = %link.row_text, "No reporting window found; skipping");
                continue;
            };
            if window.end < cutoff {
                debug!(url = %link.url, window = %window, "Outside horizon");
                continue;
            }

            match self.remote.probe(&link.url).await {
                Ok(Some(meta)) => {
                    artifacts.push(confirmed_artifact(descriptor, link.url, link.name, window, &meta));
                },
                Ok(None) => warn!(url = %link.url, "Broken link; skipping"),
                Err(e) => warn!(url = %link.url, error = %e, "Existence probe failed; skipping"),
            }
        }

        Ok(artifacts)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::HttpSettings;
    use crate::remote::HttpRemote;
    use crate::retry::RetryPolicy;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const INDEX: &str = r#"
        <html><body>
          <h2>Weekly DSM accounts</h2>
          <table>
            <tr><th>S.No</th><th>Duration</th><th>Data File</th><th>Report</th></tr>
            <tr><td>1</td><td>25.08.2025 to 31.08.2025</td>
                <td><a href="files/dsm_week35.zip">Download</a></td>
                <td><a href="files/report35.pdf">PDF</a></td></tr>
            <tr><td>2</td><td>18.08.2025 to 24.08.2025</td>
                <td><a href="/files/WINDOW-2025-08-18_to_2025-08-24.zip">Download</a></td>
                <td></td></tr>
            <tr><td>3</td><td>11.08.2025 to 17.08.2025</td><td>Not yet published</td><td></td></tr>
            <tr><td colspan="4">Archive</td></tr>
          </table>
        </body></html>
    "#;

    fn descriptor(base: &str) -> SourceDescriptor {
        SourceDescriptor::new(
            "nerpc".parse().unwrap(),
            Url::parse(base).unwrap(),
            DiscoveryStrategy::TableScrape {
                index_path: "dsm/index.html".into(),
                column_synonyms: vec!["Data File".into(), "DSM Data".into()],
                link_pattern: None,
            },
        )
    }

    fn remote() -> Arc<dyn RemoteSource> {
        let retry = RetryPolicy {
            max_attempts: 1,
            base_delay_ms: 1,
            max_delay_ms: 1,
            timeout_secs: 10,
        };
        Arc::new(HttpRemote::new(&HttpSettings::default(), retry).unwrap())
    }

    #[test]
    fn test_extracts_links_from_matched_column_only() {
        let descriptor = descriptor("https://nerpc.example/");
        let scrape = TableScrape::new(&descriptor, remote()).unwrap();
        let page = scrape.index_url(&descriptor.base_url).unwrap();
        let links = scrape.extract_links(INDEX, &page).unwrap();

        let urls: Vec<_> = links.iter().map(|l| l.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://nerpc.example/dsm/files/dsm_week35.zip",
                "https://nerpc.example/files/WINDOW-2025-08-18_to_2025-08-24.zip",
            ]
        );
        assert!(links[0].row_text.contains("25.08.2025 to 31.08.2025"));
    }

    #[test]
    fn test_base_href_and_link_pattern() {
        let mut descriptor = descriptor("https://nerpc.example/");
        descriptor.strategy = DiscoveryStrategy::TableScrape {
            index_path: String::new(),
            column_synonyms: vec!["download".into()],
            link_pattern: Some(r"(?i)\.zip$".into()),
        };
        let html = r#"<html><head><base href="https://cdn.example/dsm/"></head><body><table>
            <tr><td>Week</td><td>DOWNLOAD (zip)</td></tr>
            <tr><td>35</td><td><a href="a.zip">zip</a> <a href="a.xlsx">xlsx</a></td></tr>
        </table></body></html>"#;

        let scrape = TableScrape::new(&descriptor, remote()).unwrap();
        let links = scrape.extract_links(html, &descriptor.base_url).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].url.as_str(), "https://cdn.example/dsm/a.zip");
    }

    #[tokio::test]
    async fn test_discover_skips_broken_links_and_old_windows() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/dsm/index.html"))
            .respond_with(ResponseTemplate::new(200).set_body_string(INDEX))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/dsm/files/dsm_week35.zip"))
            .respond_with(ResponseTemplate::new(200).insert_header("Last-Modified", "Mon, 01 Sep 2025 06:00:00 GMT"))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let descriptor = descriptor(&format!("{}/", server.uri()));
        let scrape = TableScrape::new(&descriptor, remote()).unwrap();

        // horizon reaches back to 2025-08-20: both rows qualify, one link is broken
        let today = NaiveDate::from_ymd_opt(2025, 8, 27).unwrap();
        let artifacts = scrape.discover(&descriptor, today).await.unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].name, "dsm_week35.zip");
        assert_eq!(artifacts[0].window.start, NaiveDate::from_ymd_opt(2025, 8, 25).unwrap());
        assert!(artifacts[0].signature.is_strong());
    }

    #[tokio::test]
    async fn test_unreachable_index_is_a_discovery_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let descriptor = descriptor(&format!("{}/", server.uri()));
        let scrape = TableScrape::new(&descriptor, remote()).unwrap();
        let today = NaiveDate::from_ymd_opt(2025, 8, 27).unwrap();
        let err = scrape.discover(&descriptor, today).await.unwrap_err();
        assert!(matches!(err, IngestError::Discovery(_)));
    }
}
