use kestrel_core::error::AppError;
use kestrel_core::models::ScrapeMode;
use kestrel_core::traits::Extractor;
use scraper::{ElementRef, Html, Selector};
use serde_json::{Map, Value, json};
use url::Url;

const MAX_META_TAGS: usize = 50;
const MAX_IMAGES: usize = 10;
const MAX_VIDEOS: usize = 5;
const MAX_JSON_LD: usize = 5;
const MAX_ARTICLE_CHARS: usize = 2000;
const MIN_ARTICLE_CHARS: usize = 20;
const ARTICLE_SELECTORS: &[&str] = &["article", "[role=\"article\"]", "main"];

/// Extracts page metadata from HTML with `scraper`.
///
/// - `simple`: title, description, image and canonical URL, preferring
///   OpenGraph values.
/// - `full`: title plus every meta tag (grouped into OpenGraph and Twitter
///   card maps), images and videos.
/// - `super`: `full` plus a main-text snippet and parsed JSON-LD blocks.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataExtractor;

impl MetadataExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl Extractor for MetadataExtractor {
    fn extract(&self, raw: &str, url: &str, mode: ScrapeMode) -> Result<Value, AppError> {
        if raw.trim().is_empty() {
            return Err(AppError::ExtractionError(format!("Empty document for {url}")));
        }
        let document = Html::parse_document(raw);
        let page = Page {
            document: &document,
            base: Url::parse(url).ok(),
        };

        match mode {
            ScrapeMode::Simple => page.simple(url),
            ScrapeMode::Full => page.full(),
            ScrapeMode::Super => page.deep(),
        }
    }
}

fn selector(css: &str) -> Result<Selector, AppError> {
    Selector::parse(css).map_err(|e| AppError::ExtractionError(format!("Bad selector {css}: {e}")))
}

fn text_of(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

struct Page<'a> {
    document: &'a Html,
    base: Option<Url>,
}

impl Page<'_> {
    fn meta(&self, attr: &str, key: &str) -> Result<Option<String>, AppError> {
        let sel = selector(&format!("meta[{attr}=\"{key}\"]"))?;
        Ok(self
            .document
            .select(&sel)
            .filter_map(|el| el.value().attr("content"))
            .map(str::trim)
            .find(|v| !v.is_empty())
            .map(str::to_string))
    }

    fn title(&self) -> Result<Option<String>, AppError> {
        let sel = selector("title")?;
        Ok(self
            .document
            .select(&sel)
            .next()
            .map(text_of)
            .filter(|t| !t.is_empty()))
    }

    fn resolve(&self, src: &str) -> Option<String> {
        if src.starts_with("http://") || src.starts_with("https://") {
            return Some(src.to_string());
        }
        let joined = self.base.as_ref()?.join(src).ok()?;
        matches!(joined.scheme(), "http" | "https").then(|| joined.to_string())
    }

    fn simple(&self, url: &str) -> Result<Value, AppError> {
        let title = match self.meta("property", "og:title")? {
            Some(t) => Some(t),
            None => self.title()?,
        };
        let description = match self.meta("property", "og:description")? {
            Some(d) => Some(d),
            None => self.meta("name", "description")?,
        };
        let canonical = match self.meta("property", "og:url")? {
            Some(u) => u,
            None => url.to_string(),
        };

        Ok(json!({
            "title": title,
            "description": description,
            "image": self.meta("property", "og:image")?,
            "url": canonical,
        }))
    }

    fn full(&self) -> Result<Value, AppError> {
        let mut meta_tags = Map::new();
        let mut og_data = Map::new();
        let mut twitter_data = Map::new();

        let sel = selector("meta")?;
        for el in self.document.select(&sel).take(MAX_META_TAGS) {
            let attrs = el.value();
            let Some(name) = attrs.attr("property").or_else(|| attrs.attr("name")) else {
                continue;
            };
            let Some(content) = attrs.attr("content") else {
                continue;
            };
            if let Some(key) = name.strip_prefix("og:") {
                og_data.insert(key.to_string(), Value::from(content));
            } else if let Some(key) = name.strip_prefix("twitter:") {
                twitter_data.insert(key.to_string(), Value::from(content));
            }
            meta_tags.insert(name.to_string(), Value::from(content));
        }

        let img_sel = selector("img[src]")?;
        let images: Vec<Value> = self
            .document
            .select(&img_sel)
            .filter_map(|el| {
                let src = self.resolve(el.value().attr("src")?)?;
                Some(json!({ "src": src, "alt": el.value().attr("alt").unwrap_or("") }))
            })
            .take(MAX_IMAGES)
            .collect();

        let video_sel = selector("video[src], video source[src]")?;
        let videos: Vec<Value> = self
            .document
            .select(&video_sel)
            .filter_map(|el| self.resolve(el.value().attr("src")?))
            .take(MAX_VIDEOS)
            .map(Value::from)
            .collect();

        Ok(json!({
            "title": self.title()?,
            "og_data": og_data,
            "twitter_data": twitter_data,
            "meta_tags": meta_tags,
            "images": images,
            "videos": videos,
        }))
    }

    fn deep(&self) -> Result<Value, AppError> {
        let mut payload = self.full()?;

        let json_ld_sel = selector(r#"script[type="application/ld+json"]"#)?;
        let json_ld: Vec<Value> = self
            .document
            .select(&json_ld_sel)
            .take(MAX_JSON_LD)
            .filter_map(|el| serde_json::from_str(&el.text().collect::<String>()).ok())
            .collect();

        if let Value::Object(map) = &mut payload {
            map.insert("article_text".into(), Value::from(self.article_text()?));
            map.insert("json_ld".into(), Value::from(json_ld));
            map.insert("language".into(), Value::from(self.language()?));
        }
        Ok(payload)
    }

    fn article_text(&self) -> Result<Option<String>, AppError> {
        for css in ARTICLE_SELECTORS.iter().copied().chain(["p"]) {
            let sel = selector(css)?;
            if let Some(text) = self
                .document
                .select(&sel)
                .map(text_of)
                .find(|t| t.chars().count() > MIN_ARTICLE_CHARS)
            {
                return Ok(Some(text.chars().take(MAX_ARTICLE_CHARS).collect()));
            }
        }
        Ok(None)
    }

    fn language(&self) -> Result<Option<String>, AppError> {
        let sel = selector("html[lang]")?;
        Ok(self
            .document
            .select(&sel)
            .next()
            .and_then(|el| el.value().attr("lang"))
            .map(str::to_string))
    }
}
