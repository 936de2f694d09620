pub mod extract;
pub mod fetcher;
pub mod page;
pub mod platform;
pub mod throttle;

#[cfg(feature = "browser")]
pub mod browser_fetcher;

pub use extract::{METADATA_FIELDS, MediaMetadata, MetadataExtractor};
pub use fetcher::ReqwestFetcher;
pub use platform::Platform;
pub use throttle::HostThrottle;

#[cfg(feature = "browser")]
pub use browser_fetcher::BrowserFetcher;
