use crate::{
    config::ModelConfig,
    model_service::{ModelError, VisionLanguageModel},
};
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use ndarray::{concatenate, s, Array, Array2, Array3, ArrayD, ArrayView1, Axis, Ix3, Ix4};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::{DynValue, TensorRef},
};
use parking_lot::{Mutex, MutexGuard};
use std::{
    path::Path,
    sync::atomic::{AtomicUsize, Ordering},
};
use tokenizers::Tokenizer;

const PIXEL_VALUES: &str = "pixel_values";
const IMAGE_EMBEDS: &str = "image_embeds";
const INPUT_IDS: &str = "input_ids";
const INPUTS_EMBEDS: &str = "inputs_embeds";
const LOGITS: &str = "logits";

fn load_error(e: impl std::fmt::Display) -> ModelError {
    ModelError::Load(e.to_string())
}

fn inference_error(e: impl std::fmt::Display) -> ModelError {
    ModelError::Inference(e.to_string())
}

fn normalize(channel: u8) -> f32 {
    (channel as f32 / 255.) * 2. - 1.
}

fn transform_image(image: &DynamicImage, size: u32) -> Array<f32, Ix4> {
    let img = image.resize_exact(size, size, FilterType::CatmullRom);
    let side = size as usize;

    let mut input = Array::zeros((1, 3, side, side));
    for pixel in img.pixels() {
        let x = pixel.0 as usize;
        let y = pixel.1 as usize;
        let [r, g, b, _] = pixel.2 .0;
        input[[0, 0, y, x]] = normalize(r);
        input[[0, 1, y, x]] = normalize(g);
        input[[0, 2, y, x]] = normalize(b);
    }

    input
}

fn extract_tensor(value: &DynValue) -> Result<ArrayD<f32>, ModelError> {
    let (shape, data) = value.try_extract_tensor::<f32>().map_err(inference_error)?;
    ArrayD::from_shape_vec(shape.to_ixdyn(), data.to_vec()).map_err(inference_error)
}

fn argmax(row: ArrayView1<f32>) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (index, &value)| {
            if value > best.1 {
                (index, value)
            } else {
                best
            }
        })
        .0
}

fn build_session(path: &Path) -> Result<Session, ModelError> {
    Session::builder()
        .map_err(load_error)?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(load_error)?
        .commit_from_file(path)
        .map_err(load_error)
}

/// Image features produced by the vision encoder, `[1, patches, hidden]`.
pub struct ImageEmbedding {
    embeds: Array3<f32>,
}

struct ModelInstance {
    vision_encoder: Session,
    text_embedding: Session,
    decoder: Session,
}

impl ModelInstance {
    fn load(config: &ModelConfig) -> Result<Self, ModelError> {
        Ok(Self {
            vision_encoder: build_session(&config.get_vision_encoder_path())?,
            text_embedding: build_session(&config.get_text_embedding_path())?,
            decoder: build_session(&config.get_decoder_path())?,
        })
    }

    fn embed_tokens(&mut self, ids: &[u32]) -> Result<Array3<f32>, ModelError> {
        let ids = Array2::from_shape_vec(
            (1, ids.len()),
            ids.iter().map(|&id| id as i64).collect(),
        )
        .map_err(inference_error)?;
        let tensor = TensorRef::from_array_view(ids.view()).map_err(inference_error)?;

        let outputs = self
            .text_embedding
            .run(ort::inputs![INPUT_IDS => tensor])
            .map_err(inference_error)?;

        extract_tensor(&outputs[INPUTS_EMBEDS])?
            .into_dimensionality::<Ix3>()
            .map_err(inference_error)
    }

    fn next_token(&mut self, sequence: &Array3<f32>) -> Result<u32, ModelError> {
        let tensor = TensorRef::from_array_view(sequence.view()).map_err(inference_error)?;

        let outputs = self
            .decoder
            .run(ort::inputs![INPUTS_EMBEDS => tensor])
            .map_err(inference_error)?;

        let logits = extract_tensor(&outputs[LOGITS])?
            .into_dimensionality::<Ix3>()
            .map_err(inference_error)?;

        Ok(argmax(logits.slice(s![0, -1, ..])) as u32)
    }
}

/// Moondream-style captioning model split into three ONNX graphs.
///
/// Sessions are not shared between threads: each loaded instance sits behind
/// its own mutex.
pub struct OrtVisionLanguageModel {
    instances: Vec<Mutex<ModelInstance>>,
    counter: AtomicUsize,
    tokenizer: Tokenizer,
    image_size: u32,
    max_new_tokens: usize,
    eos_token_id: u32,
}

impl OrtVisionLanguageModel {
    pub fn load(config: &ModelConfig) -> Result<Self, ModelError> {
        let tokenizer = Tokenizer::from_file(config.get_tokenizer_path())
            .map_err(|e| ModelError::Tokenizer(e.to_string()))?;

        let instances = (0..config.num_instances.max(1))
            .map(|_| ModelInstance::load(config).map(Mutex::new))
            .collect::<Result<Vec<_>, ModelError>>()?;

        tracing::info!("Created {} vision-language model instances", instances.len());

        Ok(Self {
            instances,
            counter: AtomicUsize::new(0),
            tokenizer,
            image_size: config.image_size,
            max_new_tokens: config.max_new_tokens,
            eos_token_id: config.eos_token_id,
        })
    }

    fn acquire(&self) -> MutexGuard<'_, ModelInstance> {
        for instance in &self.instances {
            if let Some(guard) = instance.try_lock() {
                return guard;
            }
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % self.instances.len();
        tracing::debug!("All model instances busy, waiting on instance {}", index);
        self.instances[index].lock()
    }
}

impl VisionLanguageModel for OrtVisionLanguageModel {
    type Embedding = ImageEmbedding;

    fn encode_image(&self, image: &DynamicImage) -> Result<ImageEmbedding, ModelError> {
        let input = transform_image(image, self.image_size);
        let tensor = TensorRef::from_array_view(input.view()).map_err(inference_error)?;

        let mut instance = self.acquire();
        let outputs = instance
            .vision_encoder
            .run(ort::inputs![PIXEL_VALUES => tensor])
            .map_err(inference_error)?;

        let embeds = extract_tensor(&outputs[IMAGE_EMBEDS])?
            .into_dimensionality::<Ix3>()
            .map_err(inference_error)?;

        Ok(ImageEmbedding { embeds })
    }

    fn answer_question(
        &self,
        embedding: &ImageEmbedding,
        prompt: &str,
    ) -> Result<String, ModelError> {
        let question = format!("\n\nQuestion: {}\n\nAnswer:", prompt);
        let encoding = self
            .tokenizer
            .encode(question, false)
            .map_err(|e| ModelError::Tokenizer(e.to_string()))?;

        let mut instance = self.acquire();

        // The end-of-text token doubles as the beginning-of-sequence marker.
        let bos = instance.embed_tokens(&[self.eos_token_id])?;
        let question = instance.embed_tokens(encoding.get_ids())?;
        let mut sequence = concatenate(
            Axis(1),
            &[bos.view(), embedding.embeds.view(), question.view()],
        )
        .map_err(inference_error)?;

        let mut generated = Vec::with_capacity(self.max_new_tokens);
        for _ in 0..self.max_new_tokens {
            let token = instance.next_token(&sequence)?;
            if token == self.eos_token_id {
                break;
            }
            generated.push(token);

            let token_embed = instance.embed_tokens(&[token])?;
            sequence = concatenate(Axis(1), &[sequence.view(), token_embed.view()])
                .map_err(inference_error)?;
        }
        drop(instance);

        tracing::debug!("Generated {} answer tokens", generated.len());

        self.tokenizer
            .decode(&generated, true)
            .map(|answer| answer.trim().to_string())
            .map_err(|e| ModelError::Tokenizer(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use ndarray::array;
    use std::path::PathBuf;

    #[test]
    fn test_transform_image() {
        let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(100, 60, Rgb([255, 0, 0]));
        let input = transform_image(&DynamicImage::ImageRgb8(img), 378);

        assert_eq!(input.shape(), &[1, 3, 378, 378]);
        assert!((input[[0, 0, 10, 10]] - 1.0).abs() < 1e-4);
        assert!((input[[0, 1, 10, 10]] + 1.0).abs() < 1e-4);
        assert!((input[[0, 2, 10, 10]] + 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_argmax_picks_first_maximum() {
        let row = array![0.1f32, 2.5, -1.0, 2.5];
        assert_eq!(argmax(row.view()), 1);
    }

    #[test]
    fn test_load_fails_without_tokenizer() {
        let config = ModelConfig {
            model_dir: PathBuf::from("./does_not_exist"),
            vision_encoder_file: "vision_encoder.onnx".into(),
            text_embedding_file: "text_embedding.onnx".into(),
            decoder_file: "text_decoder.onnx".into(),
            tokenizer_file: "tokenizer.json".into(),
            image_size: 378,
            max_new_tokens: 8,
            eos_token_id: 50256,
            num_instances: 1,
            inference_timeout_secs: None,
        };

        let result = OrtVisionLanguageModel::load(&config);
        assert!(matches!(result, Err(ModelError::Tokenizer(_))));
    }
}
