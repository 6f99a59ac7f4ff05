use serde::{Deserialize, Serialize};

/// A fixed-length feature vector describing an image's visual content.
pub type Embedding = Vec<f32>;

/// Anything the clusterer can place in embedding space.
///
/// Records sourced from the persisted store and synthetic vectors in tests
/// both go through this interface, so the clusterer never depends on a
/// concrete storage type.
pub trait Clusterable {
    fn identity(&self) -> &str;
    fn point(&self) -> &[f32];

    /// True when the point is non-empty and every component is finite.
    fn is_well_formed(&self) -> bool {
        let point = self.point();
        !point.is_empty() && point.iter().all(|v| v.is_finite())
    }
}

/// One processed image: its path, capture time and embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Absolute file path, unique within the store.
    pub identity: String,
    /// Capture time in milliseconds since the Unix epoch, 0 when unknown.
    pub captured_at: i64,
    pub embedding: Embedding,
}

impl ImageRecord {
    pub fn new(identity: impl Into<String>, captured_at: i64, embedding: Embedding) -> Self {
        Self {
            identity: identity.into(),
            captured_at,
            embedding,
        }
    }

    pub fn dimension(&self) -> usize {
        self.embedding.len()
    }
}

impl Clusterable for ImageRecord {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn point(&self) -> &[f32] {
        &self.embedding
    }
}

/// Euclidean distance between two points of equal dimension.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum::<f32>()
        .sqrt()
}
