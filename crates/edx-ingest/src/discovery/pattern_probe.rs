//! Pattern-generated discovery
//!
//! Some regions publish nothing but predictable URLs, e.g.
//! `/website/2025/commercial/250825-310825.zip`. Candidates are rendered
//! from templates for each window inside the horizon (newest first) and
//! confirmed with an existence probe before they count as artifacts.
//!
//! Template placeholders are `{start:FMT}` and `{end:FMT}` where `FMT` is a
//! chrono strftime format; a bare `{start}` uses `%Y-%m-%d`.

use async_trait::async_trait;
use chrono::format::{Item, StrftimeItems};
use chrono::{Datelike, Duration, NaiveDate, Weekday};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{confirmed_artifact, file_name, horizon_cutoff, plain_family, Discovery};
use crate::config::{DiscoveryStrategy, SourceDescriptor};
use crate::error::{IngestError, Result};
use crate::models::{Artifact, Window};
use crate::remote::RemoteSource;

const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d";

/// Existence probes in flight at once; results keep candidate order
const PROBE_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DateField {
    Start,
    End,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Date { field: DateField, format: String },
}

/// Parsed URL template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl UrlTemplate {
    pub fn parse(template: &str) -> Result<Self> {
        let invalid = |message: &str| IngestError::Config(format!("template '{}': {}", template, message));

        let mut segments = Vec::new();
        let mut placeholders = 0usize;
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            let (literal, tail) = rest.split_at(open);
            if literal.contains('}') {
                return Err(invalid("unbalanced '}'"));
            }
            if !literal.is_empty() {
                segments.push(Segment::Literal(literal.to_string()));
            }

            let close = tail.find('}').ok_or_else(|| invalid("unclosed placeholder"))?;
            let inner = &tail[1..close];
            let (name, format) = inner.split_once(':').unwrap_or((inner, DEFAULT_DATE_FORMAT));
            let field = match name.trim() {
                "start" => DateField::Start,
                "end" => DateField::End,
                other => return Err(invalid(&format!("unknown placeholder '{}'", other))),
            };
            check_format(format).map_err(|message| invalid(&message))?;

            segments.push(Segment::Date {
                field,
                format: format.to_string(),
            });
            placeholders += 1;
            rest = &tail[close + 1..];
        }

        if rest.contains('}') {
            return Err(invalid("unbalanced '}'"));
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }
        if placeholders == 0 {
            return Err(invalid("no {start} or {end} placeholder"));
        }

        Ok(Self {
            raw: template.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn render(&self, window: &Window) -> Result<String> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Date { field, format } => {
                    let date = match field {
                        DateField::Start => window.start,
                        DateField::End => window.end,
                    };
                    write!(out, "{}", date.format(format)).map_err(|_| {
                        IngestError::Config(format!("template '{}': cannot format {}", self.raw, date))
                    })?;
                },
            }
        }
        Ok(out)
    }
}

fn check_format(format: &str) -> std::result::Result<(), String> {
    if format.is_empty() {
        return Err("empty date format".to_string());
    }
    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return Err(format!("invalid date format '{}'", format));
    }
    // time specifiers parse fine but cannot format a date
    let sample = NaiveDate::from_ymd_opt(2025, 1, 1).ok_or("sample date")?;
    let mut out = String::new();
    write!(out, "{}", sample.format(format)).map_err(|_| format!("'{}' needs more than a date", format))?;
    Ok(())
}

/// Validate a template without keeping the parsed form
pub fn check_template(template: &str) -> Result<()> {
    UrlTemplate::parse(template).map(|_| ())
}

pub struct PatternProbe {
    remote: Arc<dyn RemoteSource>,
    templates: Vec<UrlTemplate>,
    revision_templates: Vec<UrlTemplate>,
    window_days: u32,
    anchor: Weekday,
}

impl PatternProbe {
    pub fn new(descriptor: &SourceDescriptor, remote: Arc<dyn RemoteSource>) -> Result<Self> {
        let DiscoveryStrategy::PatternProbe {
            templates,
            revision_templates,
            window_days,
            anchor,
        } = &descriptor.strategy
        else {
            return Err(IngestError::Config(format!(
                "{}: strategy is not pattern_probe",
                descriptor.region
            )));
        };

        let parse_all = |raw: &[String]| raw.iter().map(|t| UrlTemplate::parse(t)).collect::<Result<Vec<_>>>();
        Ok(Self {
            remote,
            templates: parse_all(templates)?,
            revision_templates: parse_all(revision_templates)?,
            window_days: (*window_days).max(1),
            anchor: *anchor,
        })
    }

    /// Windows inside the horizon, newest first
    ///
    /// Week-multiple windows start on the anchor weekday; other lengths
    /// end on `today`.
    pub fn windows(&self, today: NaiveDate, horizon_days: u32) -> Vec<Window> {
        let cutoff = horizon_cutoff(today, horizon_days);
        let span = Duration::days(i64::from(self.window_days));

        let mut start = if self.window_days % 7 == 0 {
            let back = (today.weekday().num_days_from_monday() + 7 - self.anchor.num_days_from_monday()) % 7;
            today - Duration::days(i64::from(back))
        } else {
            today - span + Duration::days(1)
        };

        let mut windows = Vec::new();
        loop {
            let end = start + span - Duration::days(1);
            if end < cutoff {
                break;
            }
            windows.push(Window::new(start, end));
            start -= span;
        }
        windows
    }

    async fn probe_candidate(
        &self,
        descriptor: &SourceDescriptor,
        template: &UrlTemplate,
        window: Window,
    ) -> Option<Artifact> {
        let rendered = match template.render(&window) {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!(template = template.as_str(), error = %e, "Skipping candidate");
                return None;
            },
        };
        let url = match descriptor.base_url.join(&rendered) {
            Ok(url) => url,
            Err(e) => {
                warn!(candidate = %rendered, error = %e, "Skipping unresolvable candidate");
                return None;
            },
        };
        let name = file_name(&url)?;

        match self.remote.probe(&url).await {
            Ok(Some(meta)) => Some(confirmed_artifact(descriptor, url, name, window, &meta)),
            Ok(None) => {
                debug!(url = %url, "Not published");
                None
            },
            Err(e) => {
                warn!(url = %url, error = %e, "Existence probe failed; skipping candidate");
                None
            },
        }
    }

    /// Probe one candidate; revised candidates take the given family
    async fn probe_as(
        &self,
        descriptor: &SourceDescriptor,
        template: &UrlTemplate,
        window: Window,
        revised_family: Option<String>,
    ) -> Option<Artifact> {
        let mut artifact = self.probe_candidate(descriptor, template, window).await?;
        if let Some(family) = revised_family {
            artifact.revision = Some(1);
            if !family.is_empty() {
                artifact.family = family;
            }
        }
        Some(artifact)
    }
}

#[async_trait]
impl Discovery for PatternProbe {
    fn name(&self) -> &'static str {
        "pattern_probe"
    }

    async fn discover(&self, descriptor: &SourceDescriptor, today: NaiveDate) -> Result<Vec<Artifact>> {
        // (window, template, family override for revised candidates)
        let mut candidates: Vec<(Window, &UrlTemplate, Option<String>)> = Vec::new();
        for window in self.windows(today, descriptor.horizon_days) {
            // revised candidates join the family of the regular file name
            let regular_family = match self.templates.first().map(|t| t.render(&window)) {
                Some(Ok(rendered)) => plain_family(rendered.rsplit('/').next().unwrap_or(&rendered)),
                _ => String::new(),
            };
            candidates.extend(self.templates.iter().map(|t| (window, t, None)));
            candidates.extend(
                self.revision_templates
                    .iter()
                    .map(|t| (window, t, Some(regular_family.clone()))),
            );
        }

        let probes: Vec<BoxFuture<'_, Option<Artifact>>> = candidates
            .into_iter()
            .map(|(window, template, family)| self.probe_as(descriptor, template, window, family).boxed())
            .collect();
        let artifacts: Vec<Artifact> = stream::iter(probes)
            .buffered(PROBE_CONCURRENCY)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .flatten()
            .collect();

        debug!(region = %descriptor.region, confirmed = artifacts.len(), "Pattern probe finished");
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
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_template_rendering() {
        let template = UrlTemplate::parse("website/{end:%Y}/commercial/{start:%d%m%y}-{end:%d%m%y}.zip").unwrap();
        let window = Window::new(date(2025, 8, 25), date(2025, 8, 31));
        assert_eq!(template.render(&window).unwrap(), "website/2025/commercial/250825-310825.zip");

        let bare = UrlTemplate::parse("dsm_{start}.csv").unwrap();
        assert_eq!(bare.render(&window).unwrap(), "dsm_2025-08-25.csv");
    }

    #[test]
    fn test_template_validation() {
        assert!(check_template("{start:%d%m%y}.zip").is_ok());
        assert!(check_template("static.zip").is_err());
        assert!(check_template("{week}.zip").is_err());
        assert!(check_template("{start:%d.zip").is_err());
        assert!(check_template("start}.zip").is_err());
        assert!(check_template("{start:%H%M}.zip").is_err());
    }

    fn descriptor(base: &str, revision_templates: Vec<String>) -> SourceDescriptor {
        SourceDescriptor::new(
            "srpc".parse().unwrap(),
            Url::parse(base).unwrap(),
            DiscoveryStrategy::PatternProbe {
                templates: vec!["commercial/{start:%d%m%y}-{end:%d%m%y}.zip".into()],
                revision_templates,
                window_days: 7,
                anchor: Weekday::Mon,
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
    fn test_weekly_windows_newest_first_within_horizon() {
        let probe = PatternProbe::new(&descriptor("http://example.test/", vec![]), remote()).unwrap();
        // Wednesday
        let windows = probe.windows(date(2025, 9, 3), 7);
        assert_eq!(
            windows,
            vec![
                Window::new(date(2025, 9, 1), date(2025, 9, 7)),
                Window::new(date(2025, 8, 25), date(2025, 8, 31)),
            ]
        );

        let longer = probe.windows(date(2025, 9, 3), 21);
        assert_eq!(longer.len(), 4);
        assert_eq!(longer.last().unwrap().start, date(2025, 8, 11));
    }

    #[tokio::test]
    async fn test_probe_confirms_published_windows_only() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/commercial/250825-310825.zip"))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"w35\""))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/commercial/250825-310825_R1.zip"))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"w35r1\""))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let descriptor = descriptor(
            &format!("{}/", server.uri()),
            vec!["commercial/{start:%d%m%y}-{end:%d%m%y}_R1.zip".into()],
        );
        let probe = PatternProbe::new(&descriptor, remote()).unwrap();
        let artifacts = probe.discover(&descriptor, date(2025, 9, 3)).await.unwrap();

        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[0].name, "250825-310825.zip");
        assert_eq!(artifacts[0].revision, None);
        assert!(artifacts[0].signature.is_strong());
        assert_eq!(artifacts[1].name, "250825-310825_R1.zip");
        assert_eq!(artifacts[1].revision, Some(1));
        assert_eq!(artifacts[1].family, artifacts[0].family);
    }
}
