use crate::core::record::Embedding;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageReader, RgbImage};
use image_hasher::{HashAlg, Hasher, HasherConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Side length of the square input every extractor expects by default.
pub const DEFAULT_INPUT_SIZE: u32 = 224;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image decoding error: {0}")]
    Decode(#[from] image::ImageError),

    #[error("Failed to load model {path}: {message}")]
    ModelLoad { path: String, message: String },

    #[error("Expected a {expected}x{expected} input, got {width}x{height}")]
    InputSize {
        expected: u32,
        width: u32,
        height: u32,
    },

    #[error("Inference produced a non-finite embedding")]
    NonFinite,

    #[error("Expected a {expected}-dimensional embedding, got {found}")]
    DimensionMismatch { expected: usize, found: usize },
}

/// Turns a fixed-size image into an embedding.
///
/// Output dimensionality is constant for the lifetime of an extractor, and
/// `model_id` changes whenever embeddings stop being comparable (different
/// model, different parameters).
pub trait FeatureExtractor: Send + Sync {
    fn model_id(&self) -> &str;

    fn input_size(&self) -> u32;

    fn dimension(&self) -> usize;

    fn embed(&self, image: &RgbImage) -> Result<Embedding, ExtractionError>;
}

/// Decodes a file into the square pixel grid an extractor consumes.
pub trait ImageLoader: Send + Sync {
    fn load(&self, path: &Path, size: u32) -> Result<RgbImage, ExtractionError>;
}

/// Loader backed by the `image` crate: decode, then scale without filtering.
#[derive(Debug, Default, Clone, Copy)]
pub struct DecodingLoader;

impl ImageLoader for DecodingLoader {
    fn load(&self, path: &Path, size: u32) -> Result<RgbImage, ExtractionError> {
        let img = ImageReader::open(path)?.with_guessed_format()?.decode()?;
        Ok(img.resize_exact(size, size, FilterType::Nearest).to_rgb8())
    }
}

fn check_input(image: &RgbImage, expected: u32) -> Result<(), ExtractionError> {
    let (width, height) = image.dimensions();
    if width != expected || height != expected {
        return Err(ExtractionError::InputSize {
            expected,
            width,
            height,
        });
    }
    Ok(())
}

fn check_output(embedding: Embedding) -> Result<Embedding, ExtractionError> {
    if embedding.iter().all(|v| v.is_finite()) {
        Ok(embedding)
    } else {
        Err(ExtractionError::NonFinite)
    }
}

/// Downsampled luminance grid, mean-centred and doubled, so components lie
/// in [-2, 2].
///
/// Centering makes the descriptor insensitive to uniform exposure shifts,
/// which are common between burst shots of the same scene.
#[derive(Debug, Clone)]
pub struct PixelGridExtractor {
    grid: u32,
    input_size: u32,
    model_id: String,
}

impl PixelGridExtractor {
    pub fn new(grid: u32, input_size: u32) -> Self {
        let grid = grid.max(1);
        Self {
            grid,
            input_size,
            model_id: format!("pixel-grid-{grid}-{input_size}"),
        }
    }

    fn descriptor(&self, image: &RgbImage) -> Embedding {
        let gray = imageops::grayscale(image);
        let small = imageops::resize(&gray, self.grid, self.grid, FilterType::Triangle);

        let values: Vec<f32> = small.pixels().map(|p| p.0[0] as f32 / 255.0).collect();
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        values.into_iter().map(|v| (v - mean) * 2.0).collect()
    }
}

impl Default for PixelGridExtractor {
    fn default() -> Self {
        Self::new(16, DEFAULT_INPUT_SIZE)
    }
}

impl FeatureExtractor for PixelGridExtractor {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn input_size(&self) -> u32 {
        self.input_size
    }

    fn dimension(&self) -> usize {
        (self.grid as usize).pow(2)
    }

    fn embed(&self, image: &RgbImage) -> Result<Embedding, ExtractionError> {
        check_input(image, self.input_size)?;
        check_output(self.descriptor(image))
    }
}

/// Mean hash expanded to one 0/1 component per bit, so the Euclidean
/// distance between two embeddings is the square root of their Hamming
/// distance.
pub struct PerceptualHashExtractor {
    hasher: Hasher,
    hash_size: u32,
    input_size: u32,
    model_id: String,
}

impl PerceptualHashExtractor {
    pub fn new(hash_size: u32, input_size: u32) -> Self {
        let hash_size = hash_size.max(2);
        let hasher = HasherConfig::new()
            .hash_size(hash_size, hash_size)
            .hash_alg(HashAlg::Mean)
            .to_hasher();
        Self {
            hasher,
            hash_size,
            input_size,
            model_id: format!("mean-hash-{hash_size}-{input_size}"),
        }
    }
}

impl Default for PerceptualHashExtractor {
    fn default() -> Self {
        Self::new(8, DEFAULT_INPUT_SIZE)
    }
}

impl FeatureExtractor for PerceptualHashExtractor {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn input_size(&self) -> u32 {
        self.input_size
    }

    fn dimension(&self) -> usize {
        (self.hash_size as usize).pow(2)
    }

    fn embed(&self, image: &RgbImage) -> Result<Embedding, ExtractionError> {
        check_input(image, self.input_size)?;
        let hash = self
            .hasher
            .hash_image(&DynamicImage::ImageRgb8(image.clone()));

        let bits: Embedding = hash
            .as_bytes()
            .iter()
            .flat_map(|byte| (0..8).map(move |bit| ((byte >> bit) & 1) as f32))
            .take(self.dimension())
            .collect();
        Ok(bits)
    }
}

/// Weights of a linear classifier head, as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionWeights {
    /// Side of the luminance grid the head was trained on.
    pub grid: u32,
    /// One row per output logit, each `grid * grid` long.
    pub weights: Vec<Vec<f32>>,
    pub bias: Vec<f32>,
}

/// A linear classifier head over the pixel-grid descriptor. The logits are
/// used as the embedding.
#[derive(Debug, Clone)]
pub struct ProjectionModel {
    features: PixelGridExtractor,
    weights: Vec<Vec<f32>>,
    bias: Vec<f32>,
    model_id: String,
}

impl ProjectionModel {
    /// Load weights from a JSON file. The model id is derived from the file's
    /// contents, so editing the weights in place invalidates stored embeddings.
    pub fn load(path: &Path, input_size: u32) -> Result<Self, ExtractionError> {
        let model_load = |message: String| ExtractionError::ModelLoad {
            path: path.display().to_string(),
            message,
        };

        let raw = fs::read_to_string(path).map_err(|e| model_load(e.to_string()))?;
        let weights: ProjectionWeights =
            serde_json::from_str(&raw).map_err(|e| model_load(e.to_string()))?;

        let digest = blake3::hash(raw.as_bytes()).to_hex();
        let model_id = format!("projection-{}-{input_size}", &digest[..16]);
        Self::from_weights(weights, input_size, model_id).map_err(model_load)
    }

    pub fn from_weights(
        weights: ProjectionWeights,
        input_size: u32,
        model_id: String,
    ) -> Result<Self, String> {
        if weights.grid == 0 || weights.grid > input_size {
            return Err(format!(
                "grid must be between 1 and the input size {input_size}, got {}",
                weights.grid
            ));
        }
        if weights.weights.is_empty() {
            return Err("model has no outputs".to_string());
        }
        if weights.weights.len() != weights.bias.len() {
            return Err(format!(
                "{} weight rows but {} bias terms",
                weights.weights.len(),
                weights.bias.len()
            ));
        }
        let inputs = (weights.grid as usize).pow(2);
        if let Some(row) = weights.weights.iter().position(|r| r.len() != inputs) {
            return Err(format!(
                "weight row {row} has {} columns, expected {inputs}",
                weights.weights[row].len()
            ));
        }

        Ok(Self {
            features: PixelGridExtractor::new(weights.grid, input_size),
            weights: weights.weights,
            bias: weights.bias,
            model_id,
        })
    }
}

impl FeatureExtractor for ProjectionModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn input_size(&self) -> u32 {
        self.features.input_size()
    }

    fn dimension(&self) -> usize {
        self.weights.len()
    }

    fn embed(&self, image: &RgbImage) -> Result<Embedding, ExtractionError> {
        let descriptor = self.features.embed(image)?;
        let logits = self
            .weights
            .iter()
            .zip(&self.bias)
            .map(|(row, bias)| row.iter().zip(&descriptor).map(|(w, x)| w * x).sum::<f32>() + bias)
            .collect();
        check_output(logits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::record::euclidean_distance;
    use image::Rgb;
    use tempfile::TempDir;

    fn gradient(size: u32, offset: u8) -> RgbImage {
        RgbImage::from_fn(size, size, |x, y| {
            let v = ((x + y) % 200) as u8 + offset;
            Rgb([v, v, v])
        })
    }

    fn checkerboard(size: u32) -> RgbImage {
        RgbImage::from_fn(size, size, |x, y| {
            if (x / 28 + y / 28) % 2 == 0 {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        })
    }

    #[test]
    fn test_pixel_grid_dimension_and_determinism() {
        let extractor = PixelGridExtractor::default();
        let image = gradient(DEFAULT_INPUT_SIZE, 0);

        let a = extractor.embed(&image).unwrap();
        let b = extractor.embed(&image).unwrap();

        assert_eq!(a.len(), extractor.dimension());
        assert_eq!(a.len(), 256);
        assert_eq!(a, b);
    }

    #[test]
    fn test_pixel_grid_ignores_uniform_brightness_shift() {
        let extractor = PixelGridExtractor::default();

        let base = extractor.embed(&gradient(DEFAULT_INPUT_SIZE, 0)).unwrap();
        let brighter = extractor.embed(&gradient(DEFAULT_INPUT_SIZE, 40)).unwrap();
        let different = extractor.embed(&checkerboard(DEFAULT_INPUT_SIZE)).unwrap();

        assert!(euclidean_distance(&base, &brighter) < 0.1);
        assert!(euclidean_distance(&base, &different) > 1.65);
    }

    #[test]
    fn test_pixel_grid_components_are_bounded() {
        let extractor = PixelGridExtractor::default();
        let half = RgbImage::from_fn(DEFAULT_INPUT_SIZE, DEFAULT_INPUT_SIZE, |x, _| {
            if x < DEFAULT_INPUT_SIZE / 8 { Rgb([255, 255, 255]) } else { Rgb([0, 0, 0]) }
        });

        let embedding = extractor.embed(&half).unwrap();

        assert!(embedding.iter().all(|v| (-2.0..=2.0).contains(v)));
        assert!(embedding.iter().any(|v| *v > 1.0));
    }

    #[test]
    fn test_wrong_input_size_is_rejected() {
        let extractor = PixelGridExtractor::default();

        let err = extractor.embed(&gradient(64, 0)).unwrap_err();

        assert!(matches!(
            err,
            ExtractionError::InputSize {
                expected: 224,
                width: 64,
                height: 64
            }
        ));
    }

    #[test]
    fn test_perceptual_hash_is_binary() {
        let extractor = PerceptualHashExtractor::default();

        let embedding = extractor.embed(&checkerboard(DEFAULT_INPUT_SIZE)).unwrap();

        assert_eq!(embedding.len(), 64);
        assert!(embedding.iter().all(|&v| v == 0.0 || v == 1.0));
        assert_eq!(extractor.model_id(), "mean-hash-8-224");
    }

    #[test]
    fn test_projection_model_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("head.json");
        let weights = ProjectionWeights {
            grid: 2,
            weights: vec![vec![1.0, 0.0, 0.0, 0.0], vec![0.0, 0.0, 0.0, 0.0]],
            bias: vec![0.0, 0.5],
        };
        fs::write(&path, serde_json::to_string(&weights).unwrap()).unwrap();

        let model = ProjectionModel::load(&path, DEFAULT_INPUT_SIZE).unwrap();
        let logits = model.embed(&gradient(DEFAULT_INPUT_SIZE, 0)).unwrap();

        assert_eq!(model.dimension(), 2);
        assert!(model.model_id().starts_with("projection-"));
        assert_eq!(logits.len(), 2);
        assert_eq!(logits[1], 0.5);
    }

    #[test]
    fn test_projection_model_load_failures() {
        let temp_dir = TempDir::new().unwrap();

        let missing = ProjectionModel::load(&temp_dir.path().join("missing.json"), 224);
        assert!(matches!(missing, Err(ExtractionError::ModelLoad { .. })));

        let garbage = temp_dir.path().join("garbage.json");
        fs::write(&garbage, b"not json").unwrap();
        assert!(matches!(
            ProjectionModel::load(&garbage, 224),
            Err(ExtractionError::ModelLoad { .. })
        ));

        let mismatched = temp_dir.path().join("mismatched.json");
        let weights = ProjectionWeights {
            grid: 2,
            weights: vec![vec![1.0, 0.0, 0.0]],
            bias: vec![0.0],
        };
        fs::write(&mismatched, serde_json::to_string(&weights).unwrap()).unwrap();
        assert!(matches!(
            ProjectionModel::load(&mismatched, 224),
            Err(ExtractionError::ModelLoad { .. })
        ));
    }

    #[test]
    fn test_projection_model_id_follows_weights() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("head.json");
        let write = |outputs: usize| {
            let weights = ProjectionWeights {
                grid: 2,
                weights: vec![vec![1.0, 0.0, 0.0, 0.0]; outputs],
                bias: vec![0.0; outputs],
            };
            fs::write(&path, serde_json::to_string(&weights).unwrap()).unwrap();
        };

        write(3);
        let first = ProjectionModel::load(&path, DEFAULT_INPUT_SIZE).unwrap();
        let same = ProjectionModel::load(&path, DEFAULT_INPUT_SIZE).unwrap();
        let smaller_input = ProjectionModel::load(&path, 64).unwrap();
        write(2);
        let retrained = ProjectionModel::load(&path, DEFAULT_INPUT_SIZE).unwrap();

        assert_eq!(first.model_id(), same.model_id());
        assert_ne!(first.model_id(), smaller_input.model_id());
        assert_ne!(first.model_id(), retrained.model_id());
    }

    #[test]
    fn test_input_size_is_part_of_model_id() {
        assert_ne!(
            PixelGridExtractor::new(16, 224).model_id(),
            PixelGridExtractor::new(16, 128).model_id()
        );
        assert_ne!(
            PerceptualHashExtractor::new(8, 224).model_id(),
            PerceptualHashExtractor::new(8, 128).model_id()
        );
    }

    #[test]
    fn test_projection_grid_larger_than_input_is_rejected() {
        let weights = ProjectionWeights {
            grid: 70_000,
            weights: vec![Vec::new()],
            bias: vec![0.0],
        };

        let result = ProjectionModel::from_weights(weights, DEFAULT_INPUT_SIZE, "huge".to_string());

        assert!(result.is_err());
    }

    #[test]
    fn test_decoding_loader_resizes() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("photo.png");
        gradient(50, 0).save(&path).unwrap();

        let image = DecodingLoader.load(&path, DEFAULT_INPUT_SIZE).unwrap();

        assert_eq!(image.dimensions(), (DEFAULT_INPUT_SIZE, DEFAULT_INPUT_SIZE));
    }

    #[test]
    fn test_decoding_loader_rejects_corrupt_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broken.jpg");
        fs::write(&path, b"definitely not a jpeg").unwrap();

        assert!(DecodingLoader.load(&path, DEFAULT_INPUT_SIZE).is_err());
    }
}
