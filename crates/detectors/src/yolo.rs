//! Object detection via YOLOv8 exported to ONNX
//!
//! Produces COCO class labels with pixel-unit bounding boxes; the fusion
//! layer applies the domain label mapping on top. The ONNX session is loaded
//! once at construction and reused for every frame.

use entity_index_common::{BoundingBox, Detection, Source};
use entity_index_core::{CapabilityError, CapabilityResult, ObjectDetector};
use image::RgbImage;
use ndarray::Array;
use ort::session::{Session, SessionOutputs};
use ort::value::TensorRef;
use std::path::Path;
use tracing::{debug, info};

/// 80 COCO object classes, in model output order
pub const COCO_CLASSES: &[&str] = &[
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich",
    "orange", "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch",
    "potted plant", "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote",
    "keyboard", "cell phone", "microwave", "oven", "toaster", "sink", "refrigerator", "book",
    "clock", "vase", "scissors", "teddy bear", "hair drier", "toothbrush",
];

/// YOLO inference tuning
#[derive(Debug, Clone)]
pub struct YoloConfig {
    /// Minimum confidence for a raw detection (0-1)
    pub confidence_threshold: f32,
    /// IoU threshold for non-maximum suppression
    pub iou_threshold: f32,
    /// Square model input edge (YOLOv8 default 640)
    pub input_size: u32,
    /// Cap on detections returned per frame
    pub max_detections: usize,
}

impl Default for YoloConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.25,
            iou_threshold: 0.45,
            input_size: 640,
            max_detections: 300,
        }
    }
}

/// YOLOv8 detector over a cached ONNX session
pub struct YoloDetector {
    session: Session,
    config: YoloConfig,
}

impl YoloDetector {
    /// Load the model; a missing weights file is `Unavailable`, not fatal
    pub fn new(model_path: &Path, config: YoloConfig) -> CapabilityResult<Self> {
        if !model_path.exists() {
            return Err(CapabilityError::Unavailable(format!(
                "object detection weights not found at {}",
                model_path.display()
            )));
        }
        info!("Loading YOLOv8 model from {}", model_path.display());
        let session = Session::builder()
            .map_err(|e| CapabilityError::Unavailable(e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e| CapabilityError::Unavailable(e.to_string()))?;
        Ok(Self { session, config })
    }

    /// Convert to CHW float tensor normalized to [0, 1]
    fn preprocess(image: &RgbImage, input_size: u32) -> Array<f32, ndarray::Dim<[usize; 4]>> {
        let resized = image::imageops::resize(
            image,
            input_size,
            input_size,
            image::imageops::FilterType::Triangle,
        );
        let mut tensor = Array::zeros((1, 3, input_size as usize, input_size as usize));
        for y in 0..input_size as usize {
            for x in 0..input_size as usize {
                let pixel = resized.get_pixel(x as u32, y as u32);
                tensor[[0, 0, y, x]] = f32::from(pixel[0]) / 255.0;
                tensor[[0, 1, y, x]] = f32::from(pixel[1]) / 255.0;
                tensor[[0, 2, y, x]] = f32::from(pixel[2]) / 255.0;
            }
        }
        tensor
    }

    /// Decode the (1, 84, anchors) output into pixel-space detections
    fn postprocess(
        outputs: SessionOutputs,
        config: &YoloConfig,
        image_w: u32,
        image_h: u32,
    ) -> CapabilityResult<Vec<Detection>> {
        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| CapabilityError::Runtime(format!("failed to extract tensor: {e}")))?;

        let dims = shape.as_ref();
        if dims.len() != 3 {
            return Err(CapabilityError::Runtime(format!(
                "expected 3D output tensor, got {}D",
                dims.len()
            )));
        }
        let num_features = dims[1] as usize;
        let num_anchors = dims[2] as usize;
        let num_classes = num_features.saturating_sub(4).min(COCO_CLASSES.len());

        let scale_x = image_w as f32 / config.input_size as f32;
        let scale_y = image_h as f32 / config.input_size as f32;

        let mut raw: Vec<(usize, f32, BoundingBox)> = Vec::with_capacity(num_anchors / 10);
        for anchor in 0..num_anchors {
            let feature = |idx: usize| data[idx * num_anchors + anchor];

            let mut best_class = 0usize;
            let mut best_prob = 0.0f32;
            for class_id in 0..num_classes {
                let prob = feature(4 + class_id);
                if prob > best_prob {
                    best_prob = prob;
                    best_class = class_id;
                }
            }
            if best_prob < config.confidence_threshold {
                continue;
            }

            // Center format in model space -> corner format in pixel space
            let cx = feature(0);
            let cy = feature(1);
            let w = feature(2);
            let h = feature(3);
            let bbox = BoundingBox::new(
                (cx - w / 2.0) * scale_x,
                (cy - h / 2.0) * scale_y,
                w * scale_x,
                h * scale_y,
            );
            raw.push((best_class, best_prob, bbox));
        }
        debug!("Raw detections before NMS: {}", raw.len());

        let kept = nms(raw, config.iou_threshold);
        let detections = kept
            .into_iter()
            .take(config.max_detections)
            .filter_map(|(class_id, confidence, bbox)| {
                let name = COCO_CLASSES.get(class_id)?;
                let mut det = Detection::new(*name, Source::Yolo, confidence);
                det.bbox = bbox.clipped(image_w, image_h);
                Some(det)
            })
            .collect();
        Ok(detections)
    }
}

impl ObjectDetector for YoloDetector {
    fn detect(&mut self, image: &RgbImage) -> CapabilityResult<Vec<Detection>> {
        let (w, h) = image.dimensions();
        let input = Self::preprocess(image, self.config.input_size);
        let tensor = TensorRef::from_array_view(input.view())
            .map_err(|e| CapabilityError::Runtime(e.to_string()))?;
        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .map_err(|e| CapabilityError::Runtime(e.to_string()))?;
        Self::postprocess(outputs, &self.config, w, h)
    }
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.w).min(b.x + b.w);
    let y2 = (a.y + a.h).min(b.y + b.h);
    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.w * a.h + b.w * b.h - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

/// Class-aware non-maximum suppression, highest confidence first
fn nms(
    mut detections: Vec<(usize, f32, BoundingBox)>,
    iou_threshold: f32,
) -> Vec<(usize, f32, BoundingBox)> {
    detections.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let mut keep = Vec::with_capacity(detections.len());
    while !detections.is_empty() {
        let current = detections.swap_remove(0);
        detections.retain(|(class_id, _, bbox)| {
            *class_id != current.0 || iou(bbox, &current.2) < iou_threshold
        });
        keep.push(current);
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coco_table() {
        assert_eq!(COCO_CLASSES.len(), 80);
        assert_eq!(COCO_CLASSES[0], "person");
        assert_eq!(COCO_CLASSES[4], "airplane");
        assert_eq!(COCO_CLASSES[7], "truck");
    }

    #[test]
    fn test_missing_weights_is_unavailable() {
        let err = YoloDetector::new(Path::new("/nonexistent/yolov8n.onnx"), YoloConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, CapabilityError::Unavailable(_)));
    }

    #[test]
    fn test_nms_suppresses_same_class_overlaps() {
        let near_identical = BoundingBox::new(10.0, 10.0, 50.0, 50.0);
        let shifted = BoundingBox::new(12.0, 12.0, 50.0, 50.0);
        let far = BoundingBox::new(300.0, 300.0, 50.0, 50.0);

        let kept = nms(
            vec![
                (0, 0.9, near_identical),
                (0, 0.7, shifted), // suppressed: same class, high IoU
                (0, 0.8, far),
                (2, 0.6, shifted), // kept: different class
            ],
            0.45,
        );
        assert_eq!(kept.len(), 3);
        assert!(kept.iter().any(|(c, conf, _)| *c == 0 && *conf == 0.9));
        assert!(kept.iter().any(|(c, _, _)| *c == 2));
        assert!(!kept.iter().any(|(_, conf, _)| *conf == 0.7));
    }

    #[test]
    fn test_iou() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        assert!((iou(&a, &b) - 1.0).abs() < 1e-6);

        let disjoint = BoundingBox::new(20.0, 20.0, 10.0, 10.0);
        assert_eq!(iou(&a, &disjoint), 0.0);
    }

    #[test]
    fn test_preprocess_shape_and_range() {
        let mut img = RgbImage::new(320, 240);
        img.put_pixel(0, 0, image::Rgb([255, 128, 0]));
        let tensor = YoloDetector::preprocess(&img, 64);
        assert_eq!(tensor.shape(), &[1, 3, 64, 64]);
        assert!(tensor.iter().all(|v| (0.0..=1.0).contains(v)));
    }
}
