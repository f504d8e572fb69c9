//! Open-vocabulary scoring via CLIP exported to ONNX
//!
//! Scores an arbitrary label list against a frame by cosine similarity of
//! the image embedding with per-label text embeddings. The same scorer backs
//! both the `open_vocab` source and the `verify` confirmation pass.

use entity_index_core::{CapabilityError, CapabilityResult, OpenVocabScorer};
use image::RgbImage;
use ndarray::{Array2, Array4};
use ort::session::Session;
use ort::value::TensorRef;
use std::collections::HashMap;
use std::path::Path;
use tokenizers::Tokenizer;
use tracing::{debug, info};

/// CLIP scorer configuration
#[derive(Debug, Clone)]
pub struct ClipConfig {
    /// Input image edge (224 for ViT-B/32)
    pub image_size: u32,
    /// Prompt wrapper applied to every label
    pub prompt_template: &'static str,
}

impl Default for ClipConfig {
    fn default() -> Self {
        Self {
            image_size: 224,
            prompt_template: "a photo of {}",
        }
    }
}

/// CLIP dual-tower scorer over a cached ONNX session
pub struct ClipScorer {
    session: Session,
    tokenizer: Tokenizer,
    config: ClipConfig,
}

impl ClipScorer {
    /// Load model and tokenizer; missing files mean `Unavailable`
    pub fn new(model_path: &Path, tokenizer_path: &Path, config: ClipConfig) -> CapabilityResult<Self> {
        if !model_path.exists() {
            return Err(CapabilityError::Unavailable(format!(
                "open-vocab model not found at {}",
                model_path.display()
            )));
        }
        if !tokenizer_path.exists() {
            return Err(CapabilityError::Unavailable(format!(
                "open-vocab tokenizer not found at {}",
                tokenizer_path.display()
            )));
        }

        info!("Loading CLIP model from {}", model_path.display());
        let session = Session::builder()
            .map_err(|e| CapabilityError::Unavailable(e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e| CapabilityError::Unavailable(e.to_string()))?;
        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| CapabilityError::Unavailable(format!("failed to load tokenizer: {e}")))?;

        Ok(Self {
            session,
            tokenizer,
            config,
        })
    }

    /// NCHW float tensor with the CLIP preprocessing normalization
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

    /// Tokenize prompts into padded `input_ids` + `attention_mask`
    fn tokenize_prompts(&self, labels: &[String]) -> CapabilityResult<(Array2<i64>, Array2<i64>)> {
        let prompts: Vec<String> = labels
            .iter()
            .map(|label| self.config.prompt_template.replace("{}", label))
            .collect();

        let mut encodings = Vec::with_capacity(prompts.len());
        let mut max_len = 0usize;
        for prompt in &prompts {
            let encoding = self
                .tokenizer
                .encode(prompt.as_str(), true)
                .map_err(|e| CapabilityError::Runtime(format!("tokenization failed: {e}")))?;
            max_len = max_len.max(encoding.get_ids().len());
            encodings.push(encoding);
        }

        let batch = encodings.len();
        let mut input_ids = Array2::<i64>::zeros((batch, max_len));
        let mut attention_mask = Array2::<i64>::zeros((batch, max_len));
        for (row, encoding) in encodings.iter().enumerate() {
            for (col, &id) in encoding.get_ids().iter().enumerate() {
                input_ids[[row, col]] = i64::from(id);
                attention_mask[[row, col]] = 1;
            }
        }
        Ok((input_ids, attention_mask))
    }
}

impl OpenVocabScorer for ClipScorer {
    fn score(
        &mut self,
        image: &RgbImage,
        labels: &[String],
    ) -> CapabilityResult<HashMap<String, f32>> {
        if labels.is_empty() {
            return Ok(HashMap::new());
        }

        let pixels = self.preprocess_image(image);
        let (input_ids, attention_mask) = self.tokenize_prompts(labels)?;

        let pixel_values = TensorRef::from_array_view(pixels.view())
            .map_err(|e| CapabilityError::Runtime(e.to_string()))?;
        let ids = TensorRef::from_array_view(input_ids.view())
            .map_err(|e| CapabilityError::Runtime(e.to_string()))?;
        let mask = TensorRef::from_array_view(attention_mask.view())
            .map_err(|e| CapabilityError::Runtime(e.to_string()))?;

        let outputs = self
            .session
            .run(ort::inputs![
                "input_ids" => ids,
                "pixel_values" => pixel_values,
                "attention_mask" => mask,
            ])
            .map_err(|e| CapabilityError::Runtime(e.to_string()))?;

        let (_, image_embeds) = outputs
            .get("image_embeds")
            .ok_or_else(|| CapabilityError::Runtime("missing image_embeds output".to_string()))?
            .try_extract_tensor::<f32>()
            .map_err(|e| CapabilityError::Runtime(e.to_string()))?;
        let (text_shape, text_embeds) = outputs
            .get("text_embeds")
            .ok_or_else(|| CapabilityError::Runtime("missing text_embeds output".to_string()))?
            .try_extract_tensor::<f32>()
            .map_err(|e| CapabilityError::Runtime(e.to_string()))?;

        let dims = text_shape.as_ref();
        if dims.len() != 2 || dims[0] as usize != labels.len() {
            return Err(CapabilityError::Runtime(format!(
                "unexpected text_embeds shape {dims:?}"
            )));
        }
        let dim = dims[1] as usize;

        let image_vec = normalized(&image_embeds[..dim]);
        let mut scores = HashMap::with_capacity(labels.len());
        for (i, label) in labels.iter().enumerate() {
            let text_vec = normalized(&text_embeds[i * dim..(i + 1) * dim]);
            let score = dot(&image_vec, &text_vec);
            scores.insert(label.clone(), score);
        }
        debug!("Scored {} labels against frame", scores.len());
        Ok(scores)
    }
}

fn normalized(v: &[f32]) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter().map(|x| x / norm).collect()
    } else {
        v.to_vec()
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_model_is_unavailable() {
        let err = ClipScorer::new(
            Path::new("/nonexistent/clip.onnx"),
            Path::new("/nonexistent/tokenizer.json"),
            ClipConfig::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, CapabilityError::Unavailable(_)));
    }

    #[test]
    fn test_vector_math() {
        let v = normalized(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert!((dot(&v, &v) - 1.0).abs() < 1e-6);

        // Zero vectors stay untouched rather than dividing by zero
        assert_eq!(normalized(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_prompt_template() {
        let config = ClipConfig::default();
        assert_eq!(
            config.prompt_template.replace("{}", "fighter jet"),
            "a photo of fighter jet"
        );
    }
}
