pub mod client;
pub mod http;
pub mod rewrite;
pub mod scrape;
pub mod speech;

pub use client::{ServiceClient, ServiceRequest, ServiceResponse};
pub use http::HttpServiceConfig;
pub use rewrite::RewriteClient;
pub use scrape::ScrapeClient;
pub use speech::SpeechClient;
