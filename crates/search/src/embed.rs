//! Text embedding capability via a sentence-transformer ONNX export
//!
//! Mean-pools the last hidden state under the attention mask and normalizes
//! to unit length, so downstream cosine similarity is a plain dot product.

use entity_index_core::{CapabilityError, CapabilityResult, Embedder};
use ndarray::Array2;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use tokenizers::Tokenizer;
use tracing::info;

/// MiniLM-style text embedder over a cached ONNX session
pub struct OnnxTextEmbedder {
    session: Session,
    tokenizer: Tokenizer,
}

impl OnnxTextEmbedder {
    /// Load model and tokenizer; missing files mean `Unavailable`
    pub fn new(model_path: &Path, tokenizer_path: &Path) -> CapabilityResult<Self> {
        if !model_path.exists() {
            return Err(CapabilityError::Unavailable(format!(
                "embedding model not found at {}",
                model_path.display()
            )));
        }
        if !tokenizer_path.exists() {
            return Err(CapabilityError::Unavailable(format!(
                "embedding tokenizer not found at {}",
                tokenizer_path.display()
            )));
        }

        info!("Loading text embedding model from {}", model_path.display());
        let session = Session::builder()
            .map_err(|e| CapabilityError::Unavailable(e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e| CapabilityError::Unavailable(e.to_string()))?;
        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| CapabilityError::Unavailable(format!("failed to load tokenizer: {e}")))?;
        Ok(Self { session, tokenizer })
    }
}

impl Embedder for OnnxTextEmbedder {
    fn embed(&mut self, text: &str) -> CapabilityResult<Vec<f32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| CapabilityError::Runtime(format!("tokenization failed: {e}")))?;

        let ids: Vec<i64> = encoding.get_ids().iter().map(|&v| i64::from(v)).collect();
        let mask: Vec<i64> = encoding
            .get_attention_mask()
            .iter()
            .map(|&v| i64::from(v))
            .collect();
        let seq_len = ids.len();
        if seq_len == 0 {
            return Err(CapabilityError::Runtime("empty encoding".to_string()));
        }

        let input_ids = Array2::from_shape_vec((1, seq_len), ids)
            .map_err(|e| CapabilityError::Runtime(e.to_string()))?;
        let attention_mask = Array2::from_shape_vec((1, seq_len), mask.clone())
            .map_err(|e| CapabilityError::Runtime(e.to_string()))?;
        let token_type_ids = Array2::<i64>::zeros((1, seq_len));

        let ids_tensor = TensorRef::from_array_view(input_ids.view())
            .map_err(|e| CapabilityError::Runtime(e.to_string()))?;
        let mask_tensor = TensorRef::from_array_view(attention_mask.view())
            .map_err(|e| CapabilityError::Runtime(e.to_string()))?;
        let types_tensor = TensorRef::from_array_view(token_type_ids.view())
            .map_err(|e| CapabilityError::Runtime(e.to_string()))?;

        let outputs = self
            .session
            .run(ort::inputs![
                "input_ids" => ids_tensor,
                "attention_mask" => mask_tensor,
                "token_type_ids" => types_tensor,
            ])
            .map_err(|e| CapabilityError::Runtime(e.to_string()))?;

        let (shape, hidden) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| CapabilityError::Runtime(e.to_string()))?;
        let dims = shape.as_ref();
        if dims.len() != 3 {
            return Err(CapabilityError::Runtime(format!(
                "expected 3D hidden state, got {}D",
                dims.len()
            )));
        }
        let hidden_dim = dims[2] as usize;

        // Mean pooling under the attention mask
        let mut pooled = vec![0.0f32; hidden_dim];
        let mut token_count = 0.0f32;
        for (t, &m) in mask.iter().enumerate() {
            if m == 0 {
                continue;
            }
            token_count += 1.0;
            let row = &hidden[t * hidden_dim..(t + 1) * hidden_dim];
            for (acc, &v) in pooled.iter_mut().zip(row) {
                *acc += v;
            }
        }
        if token_count > 0.0 {
            for v in pooled.iter_mut() {
                *v /= token_count;
            }
        }

        let norm = pooled.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in pooled.iter_mut() {
                *v /= norm;
            }
        }
        Ok(pooled)
    }
}
