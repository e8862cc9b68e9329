use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("the image list is empty")]
    EmptyBatch,
}

/// One candidate picture of a reported location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRef {
    pub file_url: String,
    pub latitude: f64,
    pub longitude: f64,
    pub address: String,
}

impl ImageRef {
    pub fn new(file_url: impl Into<String>, latitude: f64, longitude: f64, address: impl Into<String>) -> Self {
        Self {
            file_url: file_url.into(),
            latitude,
            longitude,
            address: address.into(),
        }
    }
}

/// Ordered, non-empty list of views of the same location.
///
/// Order matters: items are analyzed left to right and the first decisive
/// result wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ImageRef>", into = "Vec<ImageRef>")]
pub struct Batch(Vec<ImageRef>);

impl Batch {
    pub fn new(images: Vec<ImageRef>) -> Result<Self, ValidationError> {
        if images.is_empty() {
            return Err(ValidationError::EmptyBatch);
        }
        Ok(Self(images))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ImageRef> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[ImageRef] {
        &self.0
    }
}

impl TryFrom<Vec<ImageRef>> for Batch {
    type Error = ValidationError;

    fn try_from(images: Vec<ImageRef>) -> Result<Self, Self::Error> {
        Batch::new(images)
    }
}

impl From<Batch> for Vec<ImageRef> {
    fn from(batch: Batch) -> Self {
        batch.0
    }
}

impl<'a> IntoIterator for &'a Batch {
    type Item = &'a ImageRef;
    type IntoIter = std::slice::Iter<'a, ImageRef>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Body of `POST /analyze`.
///
/// The list is kept raw so an empty one can be rejected with a proper
/// validation message instead of a deserialization failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeRequest {
    #[serde(default)]
    pub images: Vec<ImageRef>,
}

impl AnalyzeRequest {
    pub fn into_batch(self) -> Result<Batch, ValidationError> {
        Batch::new(self.images)
    }
}
