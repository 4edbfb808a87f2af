#[cfg(feature = "browser")]
pub mod browser;
pub mod extractor;
pub mod http;

#[cfg(feature = "browser")]
pub use browser::{BrowserFetcher, BrowserSession, BrowserSessionFactory};
pub use extractor::MetadataExtractor;
pub use http::{HttpFetcher, HttpSession, HttpSessionFactory, USER_AGENTS, validate_url};
