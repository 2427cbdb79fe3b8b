//! Integration tests for IIIF Streamer.
//!
//! These tests verify end-to-end functionality including:
//! - Image and info.json requests through the HTTP router
//! - Variant cache hits, staleness and single generation under concurrency
//! - Cache fallbacks and processing limits
//! - Signed URL authorization (valid, expired, invalid signatures)
//! - Admin cache routes

mod integration {
    pub mod test_utils;

    pub mod api_tests;
    pub mod auth_tests;
    pub mod cache_tests;
}
