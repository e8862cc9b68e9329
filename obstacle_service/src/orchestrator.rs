use crate::{
    classifier::{self, normalize},
    fetcher::ImageFetcher,
    inference::{InferenceAdapter, OBSTACLE_PROMPT},
    model_service::VisionLanguageModel,
    telemetry::Metrics,
};
use async_trait::async_trait;
use obstacle_schema::{Batch, Classification, ImageRef, TaxonomyTag, ValidationError};
use std::{sync::Arc, time::Instant};
use tracing::instrument;

/// Turns a batch of views of one location into a single verdict.
#[async_trait]
pub trait BatchAnalysis: Send + Sync + 'static {
    async fn analyze_batch(&self, batch: &Batch) -> Classification;

    /// Validates the raw list before anything is fetched.
    async fn analyze(&self, images: Vec<ImageRef>) -> Result<Classification, ValidationError> {
        let batch = Batch::new(images)?;
        Ok(self.analyze_batch(&batch).await)
    }
}

/// Fetch, infer and classify each image in order.
///
/// The first non-obstacle verdict ends the batch: one clear view is enough to
/// call the location passable. When every view shows an obstacle the earliest
/// one is reported. Failed downloads and failed inference are absorbed into
/// degraded non-obstacle tags and never abort the batch.
pub struct BatchAnalyzer<F: ImageFetcher, M: VisionLanguageModel> {
    fetcher: Arc<F>,
    adapter: InferenceAdapter<M>,
    metrics: Option<Arc<Metrics>>,
}

impl<F: ImageFetcher, M: VisionLanguageModel> BatchAnalyzer<F, M> {
    pub fn new(fetcher: F, adapter: InferenceAdapter<M>) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
            adapter,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[instrument(skip(self, image_ref), fields(url = %image_ref.file_url))]
    async fn analyze_item(&self, image_ref: &ImageRef) -> Classification {
        let image = match self.fetcher.fetch(&image_ref.file_url).await {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!("Image could not be analyzed: {}", e);
                return Classification::new(e.degraded_tag());
            }
        };

        let started = Instant::now();
        let answer = self.adapter.ask(image, OBSTACLE_PROMPT).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_inference_duration(started.elapsed().as_millis() as u64);
        }

        match answer {
            Ok(answer) => {
                tracing::debug!(raw = %answer, normalized = %normalize(&answer), "Model answer");
                classifier::classify(&answer)
            }
            Err(e) => {
                tracing::warn!("Inference failed: {}", e);
                Classification::new(TaxonomyTag::InferenceError)
            }
        }
    }
}

#[async_trait]
impl<F: ImageFetcher, M: VisionLanguageModel> BatchAnalysis for BatchAnalyzer<F, M> {
    async fn analyze_batch(&self, batch: &Batch) -> Classification {
        let mut first_obstacle = None;

        for (position, image_ref) in batch.iter().enumerate() {
            let classification = self.analyze_item(image_ref).await;
            tracing::info!(
                position,
                url = %image_ref.file_url,
                tag = %classification.tag(),
                is_obstacle = classification.is_obstacle(),
                "Image analyzed"
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_classification(classification.tag());
            }

            if !classification.is_obstacle() {
                return classification;
            }
            first_obstacle.get_or_insert(classification);
        }

        first_obstacle.unwrap_or_else(Classification::clear)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fetcher::ImageFetchError,
        inference::tests::ScriptedModel,
    };
    use image::{DynamicImage, ImageBuffer, Rgb};
    use parking_lot::Mutex;
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicUsize, Ordering},
    };

    enum Fixture {
        Answer(u8),
        Unreachable,
        NotAnImage,
    }

    /// Serves images whose first pixel selects the scripted model answer.
    #[derive(Default)]
    struct FakeFetcher {
        fixtures: HashMap<String, Fixture>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl FakeFetcher {
        fn with(mut self, url: &str, fixture: Fixture) -> Self {
            self.fixtures.insert(url.to_string(), fixture);
            self
        }
    }

    #[async_trait]
    impl ImageFetcher for FakeFetcher {
        async fn fetch(&self, url: &str) -> Result<DynamicImage, ImageFetchError> {
            self.calls.lock().push(url.to_string());
            match self.fixtures.get(url) {
                Some(Fixture::Answer(index)) => Ok(DynamicImage::ImageRgb8(
                    ImageBuffer::from_pixel(4, 4, Rgb([*index, 0, 0])),
                )),
                Some(Fixture::NotAnImage) => Err(ImageFetchError::NotAnImage("text/html".into())),
                Some(Fixture::Unreachable) | None => {
                    Err(ImageFetchError::Fetch("connection refused".into()))
                }
            }
        }
    }

    struct Harness {
        analyzer: BatchAnalyzer<FakeFetcher, ScriptedModel>,
        fetched: Arc<Mutex<Vec<String>>>,
        inferences: Arc<AtomicUsize>,
    }

    fn harness(fetcher: FakeFetcher, answers: &[&str]) -> Harness {
        let model = ScriptedModel::new(answers);
        let inferences = model.calls.clone();
        let fetched = fetcher.calls.clone();
        let analyzer = BatchAnalyzer::new(fetcher, InferenceAdapter::new(model, 1, None));
        Harness {
            analyzer,
            fetched,
            inferences,
        }
    }

    fn batch(urls: &[&str]) -> Batch {
        Batch::new(
            urls.iter()
                .map(|url| ImageRef::new(*url, 37.5, 127.0, "Jongno-gu"))
                .collect(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_first_clear_view_short_circuits() {
        let fetcher = FakeFetcher::default()
            .with("a", Fixture::Answer(0))
            .with("b", Fixture::Answer(1))
            .with("c", Fixture::Answer(1));
        let h = harness(fetcher, &["The path is clear.", "A fallen tree"]);

        let outcome = h.analyzer.analyze_batch(&batch(&["a", "b", "c"])).await;

        assert_eq!(outcome.tag(), TaxonomyTag::Normal);
        assert_eq!(*h.fetched.lock(), vec!["a"]);
        assert_eq!(h.inferences.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_all_obstacles_report_the_first_one() {
        let fetcher = FakeFetcher::default()
            .with("a", Fixture::Answer(0))
            .with("b", Fixture::Answer(1))
            .with("c", Fixture::Answer(2));
        let h = harness(fetcher, &["tree", "rock", "stairs"]);

        let outcome = h.analyzer.analyze_batch(&batch(&["a", "b", "c"])).await;

        assert_eq!(outcome.tag(), TaxonomyTag::Tree);
        assert!(outcome.is_obstacle());
        assert_eq!(*h.fetched.lock(), vec!["a", "b", "c"]);
        assert_eq!(h.inferences.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_later_clear_view_overrides_earlier_obstacles() {
        let fetcher = FakeFetcher::default()
            .with("a", Fixture::Answer(0))
            .with("b", Fixture::Answer(1))
            .with("c", Fixture::Answer(0));
        let h = harness(fetcher, &["construction", "clear"]);

        let outcome = h.analyzer.analyze_batch(&batch(&["a", "b", "c"])).await;

        assert_eq!(outcome.tag(), TaxonomyTag::Normal);
        assert_eq!(*h.fetched.lock(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_download_failure_is_absorbed() {
        let fetcher = FakeFetcher::default()
            .with("broken", Fixture::Unreachable)
            .with("b", Fixture::Answer(0));
        let h = harness(fetcher, &["rock"]);

        let outcome = h.analyzer.analyze_batch(&batch(&["broken", "b"])).await;

        assert_eq!(outcome.tag(), TaxonomyTag::DownloadError);
        assert!(!outcome.is_obstacle());
        assert_eq!(h.inferences.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_non_image_after_obstacle_is_a_process_error() {
        let fetcher = FakeFetcher::default()
            .with("a", Fixture::Answer(0))
            .with("html", Fixture::NotAnImage);
        let h = harness(fetcher, &["a big boulder"]);

        let outcome = h.analyzer.analyze_batch(&batch(&["a", "html"])).await;

        assert_eq!(outcome.tag(), TaxonomyTag::ProcessError);
        assert_eq!(*h.fetched.lock(), vec!["a", "html"]);
    }

    #[tokio::test]
    async fn test_inference_failure_maps_to_degraded_tag() {
        let fetcher = FakeFetcher::default().with("a", Fixture::Answer(9));
        let h = harness(fetcher, &["tree"]);

        let outcome = h.analyzer.analyze_batch(&batch(&["a"])).await;

        assert_eq!(outcome.tag(), TaxonomyTag::InferenceError);
        assert!(!outcome.is_obstacle());
    }

    #[tokio::test]
    async fn test_empty_list_is_rejected_before_fetching() {
        let h = harness(FakeFetcher::default(), &["clear"]);

        let result = h.analyzer.analyze(vec![]).await;

        assert_eq!(result, Err(ValidationError::EmptyBatch));
        assert!(h.fetched.lock().is_empty());
        assert_eq!(h.inferences.load(Ordering::SeqCst), 0);
    }
}
