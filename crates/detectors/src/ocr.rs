//! OCR source via Tesseract
//!
//! Reads on-screen text and keeps only tokens that look like markings
//! (hull numbers, tail codes, unit designators). Vendor confidence is
//! reported on a 0-100 scale and normalized to [0, 1] on the way out.

use entity_index_common::{BoundingBox, Detection, Source};
use entity_index_core::{CapabilityError, CapabilityResult, OcrReader};
use image::RgbImage;
use leptess::{LepTess, Variable};
use tracing::debug;

/// OCR tuning
#[derive(Debug, Clone)]
pub struct OcrConfig {
    /// Tesseract language codes, e.g. "eng"
    pub language: String,
    /// Vendor confidence floor on the 0-100 scale
    pub min_confidence: i32,
    /// Tesseract page segmentation mode (3 = fully automatic)
    pub page_segmentation_mode: u32,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            language: "eng".to_string(),
            min_confidence: 60,
            page_segmentation_mode: 3,
        }
    }
}

/// Tesseract-backed text reader
pub struct TesseractReader {
    config: OcrConfig,
}

impl TesseractReader {
    /// Probe that Tesseract and the language data are present
    pub fn new(config: OcrConfig) -> CapabilityResult<Self> {
        LepTess::new(None, &config.language).map_err(|e| {
            CapabilityError::Unavailable(format!(
                "tesseract init failed for language '{}': {e}",
                config.language
            ))
        })?;
        Ok(Self { config })
    }
}

/// True for tokens that read like military markings rather than prose
#[must_use]
pub fn looks_like_marker(text: &str) -> bool {
    if text.len() < 3 || text.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    let has_digit = text.chars().any(|c| c.is_ascii_digit());
    let hyphenated_code = text.contains('-') && has_digit;
    let alnum_code = has_digit && text.len() >= 3;
    let all_caps_word = text.len() >= 4 && text.chars().all(|c| c.is_ascii_uppercase());
    hyphenated_code || alnum_code || all_caps_word
}

/// Strip to the designator alphabet and uppercase
fn clean_token(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect::<String>()
        .to_uppercase()
}

impl OcrReader for TesseractReader {
    fn read(&mut self, image: &RgbImage) -> CapabilityResult<Vec<Detection>> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Ok(Vec::new());
        }

        let mut lt = LepTess::new(None, &self.config.language)
            .map_err(|e| CapabilityError::Runtime(format!("tesseract init: {e}")))?;
        lt.set_variable(
            Variable::TesseditPagesegMode,
            &self.config.page_segmentation_mode.to_string(),
        )
        .map_err(|e| CapabilityError::Runtime(format!("failed to set PSM: {e}")))?;

        // leptess wants encoded bytes, not raw pixels
        let mut png = std::io::Cursor::new(Vec::new());
        image
            .write_to(&mut png, image::ImageFormat::Png)
            .map_err(|e| CapabilityError::Runtime(format!("png encode: {e}")))?;
        lt.set_image_from_mem(png.get_ref())
            .map_err(|e| CapabilityError::Runtime(format!("set image: {e}")))?;

        // A blank frame has no word boxes; that is a valid empty result
        let boxes = match lt.get_component_boxes(leptess::capi::TessPageIteratorLevel_RIL_WORD, true)
        {
            Some(boxes) => boxes,
            None => return Ok(Vec::new()),
        };

        let mut detections = Vec::new();
        for word_box in &boxes {
            let geom = word_box.get_geometry();
            lt.set_rectangle(geom.x, geom.y, geom.w, geom.h);

            let raw = lt.get_utf8_text().unwrap_or_default().trim().to_string();
            if raw.is_empty() {
                continue;
            }
            let vendor_conf = lt.mean_text_conf();
            if vendor_conf < self.config.min_confidence {
                continue;
            }

            let token = clean_token(&raw);
            if token.is_empty() || !looks_like_marker(&token) {
                continue;
            }

            debug!("OCR marker '{token}' at confidence {vendor_conf}");
            let mut det = Detection::new(token, Source::Ocr, vendor_conf as f32 / 100.0);
            det.raw_text = Some(raw);
            det.bbox = Some(BoundingBox::new(
                geom.x as f32,
                geom.y as f32,
                geom.w as f32,
                geom.h as f32,
            ));
            detections.push(det);
        }
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_heuristics() {
        assert!(looks_like_marker("SU-27"));
        assert!(looks_like_marker("MIG29"));
        assert!(looks_like_marker("NAVY"));
        assert!(looks_like_marker("A-10"));

        assert!(!looks_like_marker("12345")); // pure digits
        assert!(!looks_like_marker("ab")); // too short
        assert!(!looks_like_marker("hello")); // prose
    }

    #[test]
    fn test_clean_token() {
        assert_eq!(clean_token("su-27!"), "SU-27");
        assert_eq!(clean_token("  f/a-18 "), "FA-18");
        assert_eq!(clean_token("***"), "");
    }

    #[test]
    fn test_default_config_matches_pipeline_defaults() {
        let config = OcrConfig::default();
        assert_eq!(config.min_confidence, 60);
        assert_eq!(config.language, "eng");
    }
}
