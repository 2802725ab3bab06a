//! Concurrent page-blob upload of the RHCOS disk image
//!
//! The image is split into fixed-size pages. Pages are uploaded in batches;
//! every page in a batch runs concurrently and the whole batch is awaited
//! before the next one starts. A page gets a few attempts before it counts
//! as failed. After a batch with a failed page has drained, the first
//! error is returned and no further batch is started.

use std::time::Duration;

use tracing::{debug, info};

use strata_common::retry::{retry_with_backoff_if, RetryConfig};
use strata_common::{Error, Result, ResultExt};

use super::AzureApi;

/// Bytes per uploaded page
pub const PAGE_SIZE: u64 = 4 * 1024 * 1024;

/// Upper bound of concurrent page uploads
pub const MAX_CONCURRENT_UPLOADS: usize = 64;

/// Attempts per page before the upload fails
pub const PAGE_ATTEMPTS: u32 = 3;

/// Tuning for [`upload_page_blob`]
#[derive(Clone, Debug)]
pub struct UploadOptions {
    /// Bytes per page
    pub page_size: u64,
    /// Pages uploaded concurrently per batch
    pub batch_size: usize,
    /// Attempts per page
    pub page_attempts: u32,
    /// Delay between attempts of one page
    pub retry_delay: Duration,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            page_size: PAGE_SIZE,
            batch_size: MAX_CONCURRENT_UPLOADS,
            page_attempts: PAGE_ATTEMPTS,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// One page of the blob
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageRange {
    /// Byte offset into the blob
    pub offset: u64,
    /// Page length; the last page carries the remainder
    pub length: u64,
}

/// Split `size` bytes into `ceil(size / page_size)` pages
pub fn page_ranges(size: u64, page_size: u64) -> Vec<PageRange> {
    if page_size == 0 {
        return Vec::new();
    }
    let count = size.div_ceil(page_size);
    (0..count)
        .map(|i| {
            let offset = i * page_size;
            PageRange {
                offset,
                length: page_size.min(size - offset),
            }
        })
        .collect()
}

async fn upload_page(
    api: &dyn AzureApi,
    source_url: &str,
    blob_url: &str,
    page: PageRange,
    retry: &RetryConfig,
) -> Result<()> {
    let name = format!("upload page at offset {}", page.offset);
    retry_with_backoff_if(retry, &name, Error::is_retryable, move || async move {
        let data = api
            .read_image_range(source_url, page.offset, page.length)
            .await?;
        api.upload_page(blob_url, page.offset, &data).await
    })
    .await
    .with_context(|| format!("failed to upload page at offset {} of {}", page.offset, blob_url))
}

/// Copy `size` bytes of the image at `source_url` into the page blob at
/// `blob_url`
pub async fn upload_page_blob(
    api: &dyn AzureApi,
    source_url: &str,
    blob_url: &str,
    size: u64,
    options: &UploadOptions,
) -> Result<()> {
    if options.batch_size == 0 {
        return Err(Error::internal("upload batch size must be at least 1"));
    }
    let pages = page_ranges(size, options.page_size);
    let retry = RetryConfig::fixed(options.page_attempts, options.retry_delay);
    info!(
        blob = %blob_url,
        size,
        pages = pages.len(),
        "Uploading image to page blob"
    );

    for (index, batch) in pages.chunks(options.batch_size).enumerate() {
        let results = futures::future::join_all(
            batch
                .iter()
                .map(|page| upload_page(api, source_url, blob_url, *page, &retry)),
        )
        .await;

        if let Some(err) = results.into_iter().find_map(|r| r.err()) {
            return Err(err);
        }
        debug!(batch = index, pages = batch.len(), "Uploaded batch");
    }

    info!(blob = %blob_url, "Image upload complete");
    Ok(())
}
