use thiserror::Error;

/// Errors surfaced across the crate boundary.
///
/// Everything else (resolve failures, scope rejections, transient HTTP
/// errors) stays internal: logged, counted, and never fatal to a batch.
#[derive(Debug, Error)]
pub enum CrawlerError {
    /// Configuration failed validation at build time. Fatal.
    #[error("invalid crawler configuration: {0}")]
    Validation(String),

    /// The batch context was cancelled while the operation was in flight.
    #[error("crawl cancelled")]
    Cancelled,
}
