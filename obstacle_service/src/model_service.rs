use image::DynamicImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to load model: {0}")]
    Load(String),
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),
    #[error("Inference failed: {0}")]
    Inference(String),
}

/// A loaded vision-language model.
///
/// Both calls are blocking and CPU bound; callers are expected to run them
/// off the async scheduler. Implementations own their tokenizer.
pub trait VisionLanguageModel: Send + Sync + 'static {
    type Embedding: Send + 'static;

    fn encode_image(&self, image: &DynamicImage) -> Result<Self::Embedding, ModelError>;

    fn answer_question(&self, embedding: &Self::Embedding, prompt: &str)
        -> Result<String, ModelError>;
}
