use crate::config::{AnnotationConfig, Validatable};
use crate::detector::DetectionError;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::{
    fs::File,
    io::{self, BufRead, Cursor},
    path::Path,
};

const BOX_THICKNESS: u32 = 2;
const FALLBACK_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

/// Formats whose encoders accept 8-bit RGB. Anything else comes back as PNG.
const RGB8_OUTPUT_FORMATS: [ImageFormat; 8] = [
    ImageFormat::Png,
    ImageFormat::Jpeg,
    ImageFormat::Bmp,
    ImageFormat::Tiff,
    ImageFormat::Tga,
    ImageFormat::Gif,
    ImageFormat::WebP,
    ImageFormat::Pnm,
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub class_id: u32,
    pub confidence: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.) * (self.y2 - self.y1).max(0.)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColorLabel {
    pub label: String,
    pub red: u32,
    pub green: u32,
    pub blue: u32,
}

impl ColorLabel {
    fn color(&self) -> Rgb<u8> {
        Rgb([
            self.red.min(255) as u8,
            self.green.min(255) as u8,
            self.blue.min(255) as u8,
        ])
    }
}

fn intersection(box1: &BoundingBox, box2: &BoundingBox) -> f32 {
    let width = box1.x2.min(box2.x2) - box1.x1.max(box2.x1);
    let height = box1.y2.min(box2.y2) - box1.y1.max(box2.y1);
    width.max(0.) * height.max(0.)
}

fn union(box1: &BoundingBox, box2: &BoundingBox) -> f32 {
    box1.area() + box2.area() - intersection(box1, box2)
}

fn iou(box1: &BoundingBox, box2: &BoundingBox) -> f32 {
    let union = union(box1, box2);
    if union <= 0. {
        return 0.;
    }
    intersection(box1, box2) / union
}

/// Keeps the most confident box of every cluster overlapping by at least
/// `iou_threshold`.
pub fn non_max_suppression(mut boxes: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    boxes.sort_by(|box1, box2| box2.confidence.total_cmp(&box1.confidence));
    let mut result: Vec<BoundingBox> = Vec::new();

    for candidate in boxes {
        if result.iter().all(|kept| iou(kept, &candidate) < iou_threshold) {
            result.push(candidate);
        }
    }

    result
}

/// Loads `label,red,green,blue` lines; the line index is the class id.
pub fn load_labels(filepath: &Path) -> io::Result<Vec<ColorLabel>> {
    let file = File::open(filepath)?;
    let reader = io::BufReader::new(file);
    let mut color_labels = Vec::new();

    for line_result in reader.lines() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split(',').collect();

        if parts.len() != 4 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Invalid line format: {}", line),
            ));
        }

        let channel = |value: &str, name: &str| -> io::Result<u32> {
            value.trim().parse().map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, format!("Invalid {} value", name))
            })
        };

        color_labels.push(ColorLabel {
            label: parts[0].trim().to_string(),
            red: channel(parts[1], "red")?,
            green: channel(parts[2], "green")?,
            blue: channel(parts[3], "blue")?,
        });
    }

    Ok(color_labels)
}

/// Parses YOLO text output: `class x_center y_center width height [confidence]`
/// per line, coordinates normalized to the image size.
pub fn parse_yolo_labels(
    text: &str,
    img_width: u32,
    img_height: u32,
) -> Result<Vec<BoundingBox>, DetectionError> {
    let mut boxes = Vec::new();

    for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let invalid = || DetectionError::Model(format!("Invalid detection line: {}", line));
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 5 && fields.len() != 6 {
            return Err(invalid());
        }

        let class_id: u32 = fields[0].parse().map_err(|_| invalid())?;
        let values = fields[1..]
            .iter()
            .map(|field| field.parse::<f32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| invalid())?;

        let xc = values[0] * img_width as f32;
        let yc = values[1] * img_height as f32;
        let w = values[2] * img_width as f32;
        let h = values[3] * img_height as f32;

        boxes.push(BoundingBox {
            class_id,
            confidence: values.get(4).copied().unwrap_or(1.0),
            x1: xc - w / 2.,
            y1: yc - h / 2.,
            x2: xc + w / 2.,
            y2: yc + h / 2.,
        });
    }

    Ok(boxes)
}

pub fn image_dimensions(image: &[u8]) -> Result<(u32, u32), DetectionError> {
    image::ImageReader::new(Cursor::new(image))
        .with_guessed_format()
        .map_err(|e| DetectionError::InvalidImage(format!("Error reading image: {}", e)))?
        .into_dimensions()
        .map_err(|e| DetectionError::InvalidImage(format!("Error reading dimensions: {}", e)))
}

/// Draws detection boxes onto an encoded image.
#[derive(Debug, Clone)]
pub struct Annotator {
    labels: Vec<ColorLabel>,
    min_confidence: f32,
    iou_threshold: f32,
}

impl Annotator {
    pub fn new(labels: Vec<ColorLabel>, min_confidence: f32, iou_threshold: f32) -> Self {
        Self {
            labels,
            min_confidence,
            iou_threshold,
        }
    }

    pub fn from_config(config: &AnnotationConfig) -> io::Result<Self> {
        let labels = match &config.labels {
            Some(labels_config) => load_labels(&labels_config.get_path())?,
            None => Vec::new(),
        };
        tracing::info!("Loaded {} class labels", labels.len());

        Ok(Self::new(
            labels,
            config.min_confidence,
            config.iou_threshold,
        ))
    }

    fn label_for(&self, class_id: u32) -> (String, Rgb<u8>) {
        match self.labels.get(class_id as usize) {
            Some(color_label) => (color_label.label.clone(), color_label.color()),
            None => (format!("Unknown class {}", class_id), FALLBACK_COLOR),
        }
    }

    /// Returns the image with one rectangle per surviving detection,
    /// re-encoded in its original format when that format can hold 8-bit RGB
    /// and as PNG otherwise.
    pub fn annotate(
        &self,
        image_data: &[u8],
        boxes: Vec<BoundingBox>,
    ) -> Result<Vec<u8>, DetectionError> {
        let image_reader = image::ImageReader::new(Cursor::new(image_data))
            .with_guessed_format()
            .map_err(|e| DetectionError::InvalidImage(format!("Error reading image: {}", e)))?;
        let format = image_reader.format().unwrap_or(ImageFormat::Png);
        let mut img = image_reader
            .decode()
            .map_err(|e| DetectionError::InvalidImage(format!("Error decoding image: {}", e)))?
            .to_rgb8();

        let boxes = boxes
            .into_iter()
            .filter(|bbox| bbox.confidence >= self.min_confidence)
            .collect();
        let detections = non_max_suppression(boxes, self.iou_threshold);

        tracing::debug!("Drawing {} detections", detections.len());
        for (i, detection) in detections.iter().enumerate() {
            let (label, color) = self.label_for(detection.class_id);
            tracing::debug!(
                "Detection {}: {} confidence={:.3}, bbox=({:.1}, {:.1}, {:.1}, {:.1})",
                i,
                label,
                detection.confidence,
                detection.x1,
                detection.y1,
                detection.x2,
                detection.y2
            );
            draw_box(&mut img, detection, color);
        }

        encode_rgb8(DynamicImage::ImageRgb8(img), format)
    }
}

fn encode_rgb8(img: DynamicImage, format: ImageFormat) -> Result<Vec<u8>, DetectionError> {
    if RGB8_OUTPUT_FORMATS.contains(&format) {
        let mut annotated = Vec::new();
        match img.write_to(&mut Cursor::new(&mut annotated), format) {
            Ok(()) => return Ok(annotated),
            Err(e) => tracing::debug!("Cannot re-encode as {:?}, falling back to PNG: {}", format, e),
        }
    } else {
        tracing::debug!("Re-encoding {:?} input as PNG", format);
    }

    let mut annotated = Vec::new();
    img.write_to(&mut Cursor::new(&mut annotated), ImageFormat::Png)
        .map_err(|e| DetectionError::InvalidImage(format!("Error encoding image: {}", e)))?;
    Ok(annotated)
}

fn draw_box(img: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>) {
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return;
    }
    let clamp = |value: f32, limit: u32| value.max(0.).min((limit - 1) as f32) as u32;
    let x1 = clamp(bbox.x1, width);
    let y1 = clamp(bbox.y1, height);
    let x2 = clamp(bbox.x2, width);
    let y2 = clamp(bbox.y2, height);
    if x2 < x1 || y2 < y1 {
        return;
    }

    for offset in 0..BOX_THICKNESS {
        for x in x1..=x2 {
            img.put_pixel(x, (y1 + offset).min(y2), color);
            img.put_pixel(x, y2.saturating_sub(offset).max(y1), color);
        }
        for y in y1..=y2 {
            img.put_pixel((x1 + offset).min(x2), y, color);
            img.put_pixel(x2.saturating_sub(offset).max(x1), y, color);
        }
    }
}
