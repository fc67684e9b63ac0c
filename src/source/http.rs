//! HTTP(S) endpoint source

use crate::error::handlers::HttpErrorHandler;
use crate::error::{ImportError, Result};
use crate::registry::Credentials;
use crate::source::{DEFAULT_FILENAME, DataSource, SourceReader, taken_reader_error};
use futures::TryStreamExt;
use percent_encoding::percent_decode_str;
use reqwest::{Client, Response, StatusCode};
use tokio_util::io::StreamReader;
use tracing::info;
use url::Url;

pub struct HttpDataSource {
    response: Option<Response>,
    filename: String,
    length: u64,
}

impl HttpDataSource {
    pub async fn open(url: Url, credentials: Option<Credentials>, insecure_tls: bool) -> Result<Self> {
        let client = if insecure_tls {
            Client::builder().danger_accept_invalid_certs(true).build()?
        } else {
            Client::builder().build()?
        };

        let mut request = client.get(url.clone());
        if let Some(credentials) = &credentials {
            request = request.basic_auth(&credentials.username, Some(&credentials.password));
        }

        let response = request.send().await.map_err(|e| {
            ImportError::Source(format!("Failed to connect to {}: {}", url, e))
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    HttpErrorHandler::handle_auth_error(status, &error_text)
                }
                _ => ImportError::Source(format!("GET {} returned {}: {}", url, status, error_text)),
            });
        }

        let length = response.content_length().filter(|len| *len > 0).ok_or_else(|| {
            ImportError::Source(format!("{} did not report a Content-Length", url))
        })?;
        let filename = filename_from_url(&url);

        info!(url = %url, length, filename = %filename, "Opened HTTP source");
        Ok(Self {
            response: Some(response),
            filename,
            length,
        })
    }
}

impl DataSource for HttpDataSource {
    fn filename(&self) -> &str {
        &self.filename
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn reader(&mut self) -> Result<SourceReader> {
        let response = self.response.take().ok_or_else(taken_reader_error)?;
        let stream = response.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::new(StreamReader::new(Box::pin(stream))))
    }

    fn close(&mut self) {
        self.response.take();
    }
}

/// Last non-empty path segment of the URL, percent-decoded
pub fn filename_from_url(url: &Url) -> String {
    url.path_segments()
        .and_then(|segments| segments.filter(|segment| !segment.is_empty()).next_back())
        .map(|segment| percent_decode_str(segment).decode_utf8_lossy().replace('/', "_"))
        .unwrap_or_else(|| DEFAULT_FILENAME.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_is_the_last_path_segment() {
        let url = Url::parse("https://mirror.example.com/images/jammy.img?token=abc").unwrap();
        assert_eq!(filename_from_url(&url), "jammy.img");

        let url = Url::parse("https://mirror.example.com/images/").unwrap();
        assert_eq!(filename_from_url(&url), "images");

        let url = Url::parse("https://mirror.example.com").unwrap();
        assert_eq!(filename_from_url(&url), DEFAULT_FILENAME);
    }

    #[test]
    fn filename_is_percent_decoded() {
        let url = Url::parse("https://mirror.example.com/images/my%20disk.img").unwrap();
        assert_eq!(filename_from_url(&url), "my disk.img");

        let url = Url::parse("https://mirror.example.com/images/f%C3%A9dora.qcow2").unwrap();
        assert_eq!(filename_from_url(&url), "f\u{e9}dora.qcow2");

        let url = Url::parse("https://mirror.example.com/a%2Fb.img").unwrap();
        assert_eq!(filename_from_url(&url), "a_b.img");
    }
}
