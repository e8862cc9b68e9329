use crate::model_service::{ModelError, VisionLanguageModel};
use image::DynamicImage;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::Semaphore;

/// Question asked about every image.
///
/// Every category word it offers must be recognized by the answer
/// classifier; `classifier::tests::test_prompt_categories_are_recognized`
/// pins the two together.
pub const OBSTACLE_PROMPT: &str = "Classify the image into exactly ONE tag based on walkability.

If a person can walk normally and no obstacle is blocking the way, output the word: clear

If the image does NOT show a walking path at all (animals, people, portraits, indoor scenes, illustrations), output: not a path

If an obstacle is blocking the path, output ONE of the following tags:
construction
tree
rock
furniture
stairs
other obstacle

Output ONLY the tag. Do NOT answer yes or no.";

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("Inference did not finish within {0:?}")]
    TimedOut(Duration),
    #[error("Inference adapter is shut down")]
    ShutDown,
    #[error("Inference worker failed: {0}")]
    WorkerFailed(String),
}

/// Runs blocking model calls on the blocking thread pool.
///
/// At most `max_concurrency` calls are in flight process-wide. The permit is
/// moved into the worker, so a call that timed out keeps its slot until the
/// model actually returns.
pub struct InferenceAdapter<M: VisionLanguageModel> {
    model: Arc<M>,
    permits: Arc<Semaphore>,
    timeout: Option<Duration>,
}

impl<M: VisionLanguageModel> Clone for InferenceAdapter<M> {
    fn clone(&self) -> Self {
        Self {
            model: self.model.clone(),
            permits: self.permits.clone(),
            timeout: self.timeout,
        }
    }
}

impl<M: VisionLanguageModel> InferenceAdapter<M> {
    /// Takes ownership of an already loaded model.
    pub fn new(model: M, max_concurrency: usize, timeout: Option<Duration>) -> Self {
        Self {
            model: Arc::new(model),
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            timeout,
        }
    }

    /// The timeout, when set, covers waiting for a free worker as well as the
    /// model call itself.
    pub async fn ask(&self, image: DynamicImage, prompt: &str) -> Result<String, InferenceError> {
        let work = self.run(image, prompt.to_string());

        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, work)
                .await
                .map_err(|_| InferenceError::TimedOut(limit))?,
            None => work.await,
        }
    }

    async fn run(&self, image: DynamicImage, prompt: String) -> Result<String, InferenceError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| InferenceError::ShutDown)?;

        let model = self.model.clone();
        let answer = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let embedding = model.encode_image(&image)?;
            model.answer_question(&embedding, &prompt)
        })
        .await
        .map_err(|e| InferenceError::WorkerFailed(e.to_string()))??;

        Ok(answer)
    }

    /// Rejects every later `ask`. Calls already running finish normally.
    pub fn shutdown(&self) {
        self.permits.close();
    }

    #[cfg(test)]
    pub fn available_workers(&self) -> usize {
        self.permits.available_permits()
    }
}
