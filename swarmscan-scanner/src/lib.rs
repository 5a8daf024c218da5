pub mod error;
pub mod extract;
pub mod fetcher;
pub mod result;

pub use error::ScanError;
pub use extract::{ExtractedElement, ExtractedKind, Extraction};
pub use fetcher::PageFetcher;
pub use result::FetchResult;
