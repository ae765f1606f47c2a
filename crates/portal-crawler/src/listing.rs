use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use lazy_static::lazy_static;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use sxd_document::parser;
use sxd_xpath::{Context, Factory, Value};

use crate::config::{ExtraResource, ListingConfig, ListingFormat};
use crate::error::{FetchError, ListingError, ParseError};
use crate::event::{Event, EventSink, LogSink, Outcome, Stage};
use crate::fetcher::Fetcher;
use crate::resource::{FetchOutcome, ResourceDescriptor};

lazy_static! {
    static ref XP_FACTORY: Factory = Factory::new();
}

/// What one listing page points at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingPage {
    pub descriptors: Vec<ResourceDescriptor>,
    /// Further listing pages (pagination, nested indexes, sitemap indexes)
    pub children: Vec<String>,
}

#[derive(Debug)]
pub enum ListingItem {
    Descriptor(ResourceDescriptor),
    /// A non-root page could not be fetched or parsed; it contributed nothing.
    PageError { url: String, error: ListingError },
}

/// Parses a listing page body. Pure: no I/O.
pub fn parse_listing(
    body: &[u8],
    base: &Url,
    config: &ListingConfig,
) -> Result<ListingPage, ParseError> {
    let text = std::str::from_utf8(body).map_err(|e| {
        ParseError::new(
            "listing page is not valid UTF-8",
            format!("byte {}", e.valid_up_to()),
        )
    })?;

    let format = match config.format {
        ListingFormat::Auto if looks_like_sitemap(text) => ListingFormat::Sitemap,
        ListingFormat::Auto => ListingFormat::Html,
        format => format,
    };
    match format {
        ListingFormat::Sitemap => parse_sitemap(text),
        _ => parse_html(text, base, config),
    }
}

fn looks_like_sitemap(text: &str) -> bool {
    let head = text.trim_start();
    (head.starts_with("<?xml") || head.starts_with('<'))
        && (text.contains("<urlset") || text.contains("<sitemapindex"))
}

fn selector(raw: &str) -> Result<Selector, ParseError> {
    Selector::parse(raw).map_err(|e| ParseError::new(format!("invalid selector: {e:?}"), raw))
}

fn resolve(base: &Url, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    match base.join(href) {
        Ok(url) => Some(url.to_string()),
        Err(e) => {
            log::debug!("Skipping href {href:?} relative to {base}: {e}");
            None
        }
    }
}

fn text_of(el: &ElementRef) -> String {
    el.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

fn parse_html(text: &str, base: &Url, config: &ListingConfig) -> Result<ListingPage, ParseError> {
    let document = Html::parse_document(text);
    let items = selector(&config.item_selector)?;

    let mut page = ListingPage::default();
    for el in document.select(&items) {
        let Some(url) = el.value().attr("href").and_then(|href| resolve(base, href)) else {
            continue;
        };
        let title = Some(text_of(&el))
            .filter(|t| !t.is_empty())
            .or_else(|| el.value().attr("title").map(str::to_string));
        let hint = config
            .hint_attr
            .as_deref()
            .and_then(|attr| el.value().attr(attr))
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty());
        let external_id = config
            .id_attr
            .as_deref()
            .and_then(|attr| el.value().attr(attr))
            .map(str::to_string)
            .unwrap_or_else(|| url.clone());

        page.descriptors.push(ResourceDescriptor {
            url,
            external_id,
            last_modified_hint: hint,
            title,
        });
    }

    for raw in [&config.child_listing_selector, &config.next_page_selector]
        .into_iter()
        .flatten()
    {
        let sel = selector(raw)?;
        page.children.extend(
            document
                .select(&sel)
                .filter_map(|el| el.value().attr("href"))
                .filter_map(|href| resolve(base, href)),
        );
    }

    Ok(page)
}

fn xpath_nodes<'d>(
    expr: &str,
    node: impl Into<sxd_xpath::nodeset::Node<'d>>,
) -> Result<Vec<sxd_xpath::nodeset::Node<'d>>, ParseError> {
    let xpath = XP_FACTORY
        .build(expr)
        .map_err(|e| ParseError::new(format!("invalid xpath: {e}"), expr))?
        .ok_or_else(|| ParseError::new("missing xpath", expr))?;
    match xpath.evaluate(&Context::new(), node) {
        Ok(Value::Nodeset(nodes)) => Ok(nodes.document_order()),
        Ok(_) => Ok(Vec::new()),
        Err(e) => Err(ParseError::new(format!("couldn't evaluate xpath: {e}"), expr)),
    }
}

fn first_text<'d>(
    expr: &str,
    node: sxd_xpath::nodeset::Node<'d>,
) -> Result<Option<String>, ParseError> {
    Ok(xpath_nodes(expr, node)?
        .first()
        .map(|n| n.string_value().trim().to_string())
        .filter(|s| !s.is_empty()))
}

fn parse_sitemap(text: &str) -> Result<ListingPage, ParseError> {
    let package = parser::parse(text).map_err(|e| {
        ParseError::new(format!("malformed sitemap xml: {e:?}"), "document")
    })?;
    let document = package.as_document();
    let root = document.root();

    let kind = root
        .children()
        .into_iter()
        .find_map(|child| child.element())
        .map(|el| el.name().local_part().to_string())
        .ok_or_else(|| ParseError::new("sitemap has no root element", "document"))?;

    let mut page = ListingPage::default();
    match kind.as_str() {
        "urlset" => {
            for node in xpath_nodes("//*[local-name()='url']", root)? {
                let Some(loc) = first_text("*[local-name()='loc']", node)? else {
                    log::debug!("Skipping sitemap url entry without loc");
                    continue;
                };
                page.descriptors.push(ResourceDescriptor {
                    external_id: loc.clone(),
                    url: loc,
                    last_modified_hint: first_text("*[local-name()='lastmod']", node)?,
                    title: None,
                });
            }
        }
        "sitemapindex" => {
            for node in xpath_nodes("//*[local-name()='sitemap']", root)? {
                if let Some(loc) = first_text("*[local-name()='loc']", node)? {
                    page.children.push(loc);
                }
            }
        }
        other => {
            return Err(ParseError::new(
                format!("unknown sitemap root element {other}"),
                "document",
            ))
        }
    }
    Ok(page)
}

struct Traversal {
    pending: VecDeque<ResourceDescriptor>,
    queue: VecDeque<String>,
    visited: HashSet<String>,
    seen_ids: HashSet<String>,
    extras_queued: bool,
}

/// Walks a portal's listing pages and yields resource descriptors.
pub struct Discoverer {
    fetcher: Arc<Fetcher>,
    config: ListingConfig,
    exclude_titles: Vec<String>,
    extra_resources: Vec<ExtraResource>,
    sink: Arc<dyn EventSink>,
}

impl Discoverer {
    pub fn new(fetcher: Arc<Fetcher>, config: ListingConfig) -> Self {
        Self {
            fetcher,
            config,
            exclude_titles: Vec::new(),
            extra_resources: Vec::new(),
            sink: Arc::new(LogSink),
        }
    }

    pub fn exclude_titles(mut self, titles: Vec<String>) -> Self {
        self.exclude_titles = titles;
        self
    }

    pub fn extra_resources(mut self, extras: Vec<ExtraResource>) -> Self {
        self.extra_resources = extras;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Starts a fresh traversal from `portal_root`.
    ///
    /// The root page is loaded before returning, failing to load it is an
    /// error. Every other page is loaded as the stream is polled, breadth
    /// first, and failures are yielded as `ListingItem::PageError`.
    pub async fn discover(
        &self,
        portal_root: &str,
    ) -> Result<BoxStream<'_, ListingItem>, ListingError> {
        let root = self.load(portal_root).await?;

        // Children are resolved urls, so the root is matched in that form too.
        let mut visited = HashSet::from([portal_root.to_string()]);
        if let Ok(url) = Url::parse(portal_root) {
            visited.insert(url.to_string());
        }

        let state = Traversal {
            pending: root.descriptors.into(),
            queue: root.children.into(),
            visited,
            seen_ids: HashSet::new(),
            extras_queued: false,
        };

        let stream = stream::unfold(state, move |mut st| async move {
            loop {
                if let Some(descriptor) = st.pending.pop_front() {
                    if !self.accept(&descriptor)
                        || !st.seen_ids.insert(descriptor.external_id.clone())
                    {
                        continue;
                    }
                    return Some((ListingItem::Descriptor(descriptor), st));
                }

                let Some(url) = st.queue.pop_front() else {
                    if st.extras_queued {
                        return None;
                    }
                    st.extras_queued = true;
                    st.pending.extend(self.extra_resources.iter().map(|extra| {
                        ResourceDescriptor {
                            url: extra.url.clone(),
                            external_id: extra.url.clone(),
                            last_modified_hint: None,
                            title: extra.title.clone(),
                        }
                    }));
                    continue;
                };
                if !st.visited.insert(url.clone()) {
                    continue;
                }

                match self.load(&url).await {
                    Ok(page) => {
                        st.pending.extend(page.descriptors);
                        st.queue.extend(page.children);
                    }
                    Err(error) => return Some((ListingItem::PageError { url, error }, st)),
                }
            }
        });

        Ok(stream.boxed())
    }

    fn accept(&self, descriptor: &ResourceDescriptor) -> bool {
        match &descriptor.title {
            Some(title) if self.exclude_titles.iter().any(|t| t == title) => {
                log::info!("Skipping excluded resource {title} ({})", descriptor.url);
                false
            }
            _ => true,
        }
    }

    async fn load(&self, url: &str) -> Result<ListingPage, ListingError> {
        let result = match self.fetcher.fetch_url(url, url).await {
            FetchOutcome::Success(payload) => Url::parse(&payload.source_url)
                .map_err(|e| {
                    ListingError::Fetch(FetchError::Url {
                        url: url.to_string(),
                        reason: e.to_string(),
                    })
                })
                .and_then(|base| {
                    parse_listing(&payload.bytes, &base, &self.config).map_err(|source| {
                        ListingError::Parse {
                            url: url.to_string(),
                            source,
                        }
                    })
                }),
            FetchOutcome::Failed { error, .. } => Err(ListingError::Fetch(error)),
            FetchOutcome::Skipped(_) => Err(ListingError::Cancelled),
        };

        match &result {
            Ok(page) => self.sink.emit(
                &Event::new(Stage::Discover, url, Outcome::Success).detail(format!(
                    "{} resources, {} pages",
                    page.descriptors.len(),
                    page.children.len()
                )),
            ),
            Err(e) => self
                .sink
                .emit(&Event::new(Stage::Discover, url, Outcome::Failed).error(e.kind(), e)),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://nlftp.mlit.go.jp/ksj/").unwrap()
    }

    #[test]
    fn html_items_resolve_against_base() {
        let body = r#"
            <ul>
              <li class="collection-item"><a href="gml/datalist/KsjTmplt-N03-v3_0.html">
                  行政区域データ </a></li>
              <li class="collection-item"><a href="/ksj/gml/datalist/KsjTmplt-A16-v2_3.html"
                  data-updated="2024-03-01">水系データ</a></li>
              <li class="collection-item"><a href="javascript:void(0)">dead</a></li>
              <li><a href="ignored.html">not an item</a></li>
            </ul>"#;
        let config = ListingConfig {
            hint_attr: Some("data-updated".into()),
            ..Default::default()
        };
        let page = parse_listing(body.as_bytes(), &base(), &config).unwrap();

        assert_eq!(page.descriptors.len(), 2);
        let first = &page.descriptors[0];
        assert_eq!(
            first.url,
            "https://nlftp.mlit.go.jp/ksj/gml/datalist/KsjTmplt-N03-v3_0.html"
        );
        assert_eq!(first.external_id, first.url);
        assert_eq!(first.title.as_deref(), Some("行政区域データ"));
        assert_eq!(first.last_modified_hint, None);
        assert_eq!(page.descriptors[1].last_modified_hint.as_deref(), Some("2024-03-01"));
    }

    #[test]
    fn html_pagination_becomes_children() {
        let body = r#"<li class="collection-item"><a href="a.html">A</a></li>
                      <a rel="next" href="?page=2">next</a>"#;
        let config = ListingConfig {
            next_page_selector: Some("a[rel=next]".into()),
            ..Default::default()
        };
        let page = parse_listing(body.as_bytes(), &base(), &config).unwrap();
        assert_eq!(page.children, ["https://nlftp.mlit.go.jp/ksj/?page=2"]);
    }

    #[test]
    fn sitemap_urlset_carries_lastmod() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
            <urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
              <url><loc>https://example.org/a</loc><lastmod>2024-01-01</lastmod></url>
              <url><loc>https://example.org/b</loc></url>
            </urlset>"#;
        let page = parse_listing(body.as_bytes(), &base(), &ListingConfig::default()).unwrap();

        let urls: Vec<_> = page.descriptors.iter().map(|d| d.url.as_str()).collect();
        assert_eq!(urls, ["https://example.org/a", "https://example.org/b"]);
        assert_eq!(page.descriptors[0].last_modified_hint.as_deref(), Some("2024-01-01"));
        assert_eq!(page.descriptors[1].last_modified_hint, None);
    }

    #[test]
    fn sitemap_index_yields_children() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
            <sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
              <sitemap><loc>https://example.org/sm1.xml</loc></sitemap>
              <sitemap><loc>https://example.org/sm2.xml</loc></sitemap>
            </sitemapindex>"#;
        let page = parse_listing(body.as_bytes(), &base(), &ListingConfig::default()).unwrap();
        assert!(page.descriptors.is_empty());
        assert_eq!(
            page.children,
            ["https://example.org/sm1.xml", "https://example.org/sm2.xml"]
        );
    }

    #[test]
    fn malformed_sitemap_is_a_parse_error() {
        let body = "<?xml version=\"1.0\"?><urlset><url><loc>broken";
        let config = ListingConfig {
            format: ListingFormat::Sitemap,
            ..Default::default()
        };
        assert!(parse_listing(body.as_bytes(), &base(), &config).is_err());
    }

    #[test]
    fn invalid_utf8_reports_offset() {
        let err = parse_listing(b"ok\xff\xfe", &base(), &ListingConfig::default()).unwrap_err();
        assert_eq!(err.locator, "byte 2");
    }
}
