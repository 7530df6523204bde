//! XMLTV fetcher for downloading and decompressing EPG data

use flate2::read::GzDecoder;
use std::io::Read;
use std::time::Duration;

use super::parser::detect_gzip;
use super::types::XmltvError;
use crate::net::validate_url_for_ssrf;

/// Maximum download timeout in seconds
const DOWNLOAD_TIMEOUT_SECS: u64 = 30;

/// Fetch XMLTV data from a URL
///
/// Handles both plain XML and gzipped (.xml.gz) formats.
/// Auto-detects gzip format from magic bytes or content-type header.
///
/// # Arguments
/// * `url` - The URL to fetch XMLTV data from
/// * `format` - The format hint: "xml", "xml_gz", or "auto"
///
/// # Returns
/// The decompressed XMLTV data as bytes
pub async fn fetch_xmltv(url: &str, format: &str) -> Result<Vec<u8>, XmltvError> {
    validate_url_for_ssrf(url).map_err(|e| XmltvError::UrlNotAllowed(e.0))?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
        .build()
        .map_err(|e| XmltvError::DownloadError(format!("Failed to create HTTP client: {}", e)))?;

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| XmltvError::DownloadError(format!("Failed to fetch URL: {}", e)))?;

    if !response.status().is_success() {
        return Err(XmltvError::DownloadError(format!(
            "HTTP error: {}",
            response.status()
        )));
    }

    // Check content-type header for gzip hint
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let is_gzip_content_type =
        content_type.contains("gzip") || content_type.contains("application/x-gzip");

    // Download the response body
    let data = response
        .bytes()
        .await
        .map_err(|e| XmltvError::DownloadError(format!("Failed to read response body: {}", e)))?
        .to_vec();

    // Determine if we need to decompress
    let should_decompress = match format {
        "xml_gz" => true,
        "xml" => false,
        "auto" | _ => {
            // Auto-detect: check magic bytes first, then content-type
            detect_gzip(&data) || is_gzip_content_type
        }
    };

    if should_decompress {
        decompress_gzip(&data)
    } else {
        Ok(data)
    }
}

/// Decompress gzip data
fn decompress_gzip(compressed: &[u8]) -> Result<Vec<u8>, XmltvError> {
    let mut decoder = GzDecoder::new(compressed);
    let mut decompressed = Vec::new();

    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| XmltvError::DecompressError(format!("Gzip decompression failed: {}", e)))?;

    Ok(decompressed)
}
