//! Caption-driven entity discovery via a BLIP-style ONNX model
//!
//! Generates a short caption for a frame with greedy decoding, then mines
//! candidate entity phrases out of it (see [`crate::discovery`]). The
//! returned candidates are already filtered against the generic-phrase stop
//! list, as the capability contract requires.

use crate::discovery::extract_candidate_phrases;
use entity_index_core::{CapabilityError, CapabilityResult, CaptionDiscovery};
use image::RgbImage;
use ndarray::{Array2, Array4};
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use tokenizers::Tokenizer;
use tracing::{debug, info};

/// Caption score used for mined candidates; greedy decoding does not yield a
/// per-phrase probability
const CANDIDATE_SCORE: f32 = 0.5;

/// Captioner configuration
#[derive(Debug, Clone)]
pub struct CaptionerConfig {
    /// Model input edge (384 for BLIP)
    pub image_size: u32,
    /// Decode length cap in tokens
    pub max_length: usize,
    /// Cap on mined candidate phrases per caption
    pub max_phrases: usize,
}

impl Default for CaptionerConfig {
    fn default() -> Self {
        Self {
            image_size: 384,
            max_length: 50,
            max_phrases: 8,
        }
    }
}

/// Vision-language captioner over a cached ONNX session
pub struct OnnxCaptioner {
    session: Session,
    tokenizer: Tokenizer,
    config: CaptionerConfig,
    bos_token_id: u32,
    eos_token_id: u32,
}

impl OnnxCaptioner {
    /// Load model and tokenizer; missing files mean `Unavailable`
    pub fn new(
        model_path: &Path,
        tokenizer_path: &Path,
        config: CaptionerConfig,
    ) -> CapabilityResult<Self> {
        if !model_path.exists() {
            return Err(CapabilityError::Unavailable(format!(
                "caption model not found at {}",
                model_path.display()
            )));
        }
        if !tokenizer_path.exists() {
            return Err(CapabilityError::Unavailable(format!(
                "caption tokenizer not found at {}",
                tokenizer_path.display()
            )));
        }

        info!("Loading caption model from {}", model_path.display());
        let session = Session::builder()
            .map_err(|e| CapabilityError::Unavailable(e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e| CapabilityError::Unavailable(e.to_string()))?;
        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| CapabilityError::Unavailable(format!("failed to load tokenizer: {e}")))?;

        // BLIP uses the BERT special tokens
        let bos_token_id = tokenizer.token_to_id("[CLS]").unwrap_or(101);
        let eos_token_id = tokenizer.token_to_id("[SEP]").unwrap_or(102);

        Ok(Self {
            session,
            tokenizer,
            config,
            bos_token_id,
            eos_token_id,
        })
    }

    fn preprocess_image(&self, image: &RgbImage) -> Array4<f32> {
        let size = self.config.image_size;
        let resized = image::imageops::resize(
            image,
            size,
            size,
            image::imageops::FilterType::Lanczos3,
        );
        let mut tensor = Array4::<f32>::zeros((1, 3, size as usize, size as usize));
        for y in 0..size as usize {
            for x in 0..size as usize {
                let pixel = resized.get_pixel(x as u32, y as u32);
                tensor[[0, 0, y, x]] = (f32::from(pixel[0]) / 255.0 - 0.485) / 0.229;
                tensor[[0, 1, y, x]] = (f32::from(pixel[1]) / 255.0 - 0.456) / 0.224;
                tensor[[0, 2, y, x]] = (f32::from(pixel[2]) / 255.0 - 0.406) / 0.225;
            }
        }
        tensor
    }

    /// Autoregressive greedy decode: feed the growing token sequence back in
    /// until EOS or the length cap
    fn generate_caption(&mut self, pixel_values: &Array4<f32>) -> CapabilityResult<String> {
        let mut token_ids = vec![i64::from(self.bos_token_id)];

        for _step in 0..self.config.max_length {
            let seq_len = token_ids.len();
            let input_ids = Array2::from_shape_vec((1, seq_len), token_ids.clone())
                .map_err(|e| CapabilityError::Runtime(format!("bad input_ids shape: {e}")))?;
            let attention_mask = Array2::<i64>::ones((1, seq_len));

            let pixels = TensorRef::from_array_view(pixel_values.view())
                .map_err(|e| CapabilityError::Runtime(e.to_string()))?;
            let ids = TensorRef::from_array_view(input_ids.view())
                .map_err(|e| CapabilityError::Runtime(e.to_string()))?;
            let mask = TensorRef::from_array_view(attention_mask.view())
                .map_err(|e| CapabilityError::Runtime(e.to_string()))?;

            let outputs = self
                .session
                .run(ort::inputs![
                    "pixel_values" => pixels,
                    "input_ids" => ids,
                    "attention_mask" => mask,
                ])
                .map_err(|e| CapabilityError::Runtime(e.to_string()))?;

            let (shape, logits) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| CapabilityError::Runtime(e.to_string()))?;
            let dims = shape.as_ref();
            if dims.len() != 3 {
                return Err(CapabilityError::Runtime(format!(
                    "expected 3D logits, got {}D",
                    dims.len()
                )));
            }
            let vocab = dims[2] as usize;
            let last = &logits[(seq_len - 1) * vocab..seq_len * vocab];
            let next = argmax(last);

            if next == self.eos_token_id as usize {
                break;
            }
            token_ids.push(next as i64);
        }

        let ids: Vec<u32> = token_ids[1..].iter().map(|&id| id as u32).collect();
        let caption = self
            .tokenizer
            .decode(&ids, true)
            .map_err(|e| CapabilityError::Runtime(format!("decode failed: {e}")))?;
        debug!("Generated caption: {caption}");
        Ok(caption)
    }
}

impl CaptionDiscovery for OnnxCaptioner {
    fn candidates(&mut self, image: &RgbImage) -> CapabilityResult<Vec<(String, f32)>> {
        let pixels = self.preprocess_image(image);
        let caption = self.generate_caption(&pixels)?;
        if caption.trim().is_empty() {
            return Ok(Vec::new());
        }
        let phrases = extract_candidate_phrases(&caption, self.config.max_phrases);
        Ok(phrases
            .into_iter()
            .map(|phrase| (phrase, CANDIDATE_SCORE))
            .collect())
    }
}

fn argmax(values: &[f32]) -> usize {
    let mut best = 0usize;
    let mut best_value = f32::NEG_INFINITY;
    for (i, &v) in values.iter().enumerate() {
        if v > best_value {
            best_value = v;
            best = i;
        }
    }
    best
}
