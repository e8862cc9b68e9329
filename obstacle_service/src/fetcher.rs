use crate::config::FetcherConfig;
use async_trait::async_trait;
use image::DynamicImage;
use obstacle_schema::TaxonomyTag;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum ImageFetchError {
    #[error("Failed to download image: {0}")]
    Fetch(String),
    #[error("URL is not an image, detected content type: {0:?}")]
    NotAnImage(String),
    #[error("Failed to decode image: {0}")]
    Decode(String),
    #[error("Image body exceeds {limit} bytes")]
    TooLarge { limit: u64 },
}

impl ImageFetchError {
    /// Tag reported in place of a verdict when the image never reached the model.
    pub fn degraded_tag(&self) -> TaxonomyTag {
        match self {
            ImageFetchError::Fetch(_) => TaxonomyTag::DownloadError,
            ImageFetchError::NotAnImage(_)
            | ImageFetchError::Decode(_)
            | ImageFetchError::TooLarge { .. } => TaxonomyTag::ProcessError,
        }
    }
}

#[async_trait]
pub trait ImageFetcher: Send + Sync + 'static {
    async fn fetch(&self, url: &str) -> Result<DynamicImage, ImageFetchError>;
}

pub struct HttpImageFetcher {
    client: reqwest::Client,
    user_agent: String,
    max_bytes: u64,
}

impl HttpImageFetcher {
    pub fn new(config: &FetcherConfig) -> Result<Self, ImageFetchError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| ImageFetchError::Fetch(e.to_string()))?;

        Ok(Self {
            client,
            user_agent: config.user_agent.clone(),
            max_bytes: config.max_bytes,
        })
    }
}

pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, ImageFetchError> {
    image::ImageReader::new(std::io::Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| ImageFetchError::Decode(e.to_string()))?
        .decode()
        .map_err(|e| ImageFetchError::Decode(e.to_string()))
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    #[instrument(skip(self))]
    async fn fetch(&self, url: &str) -> Result<DynamicImage, ImageFetchError> {
        let mut response = self
            .client
            .get(url)
            .header(USER_AGENT, &self.user_agent)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| ImageFetchError::Fetch(e.to_string()))?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        tracing::debug!("Downloaded content type: {}", content_type);

        if !content_type.contains("image") {
            return Err(ImageFetchError::NotAnImage(content_type));
        }

        let limit = self.max_bytes;
        if response.content_length().is_some_and(|length| length > limit) {
            return Err(ImageFetchError::TooLarge { limit });
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| ImageFetchError::Fetch(e.to_string()))?
        {
            if (body.len() + chunk.len()) as u64 > limit {
                return Err(ImageFetchError::TooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }

        tokio::task::spawn_blocking(move || decode_image(&body))
            .await
            .map_err(|e| ImageFetchError::Decode(e.to_string()))?
    }
}
