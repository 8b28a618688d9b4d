use serde::{Deserialize, Serialize};

/// Distance under which two unmatched sightings count as the same visitor.
pub const SAME_FACE_THRESHOLD: f64 = 0.6;

/// Distance at or under which a sighting matches a registered identity.
pub const MATCH_TOLERANCE: f64 = 0.5;

/// A fixed-length face encoding produced by the perception sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding(Vec<f64>);

impl Embedding {
    pub fn new(values: Vec<f64>) -> Self {
        Self(values)
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Euclidean distance. Encodings of different lengths never compare close.
    pub fn distance(&self, other: &Embedding) -> f64 {
        if self.0.len() != other.0.len() {
            return f64::INFINITY;
        }
        self.0
            .iter()
            .zip(&other.0)
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f64>()
            .sqrt()
    }

    /// Strictly-below-threshold test used by the unmatched-face debounce.
    pub fn is_same_face(&self, other: &Embedding, threshold: f64) -> bool {
        self.distance(other) < threshold
    }

    /// Little-endian `f64` bytes, the on-disk format of the `face_encoding` column.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.0.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Inverse of [`Embedding::to_le_bytes`]. Returns `None` for a ragged blob.
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 8 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(8)
            .map(|chunk| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                f64::from_le_bytes(raw)
            })
            .collect();
        Some(Self(values))
    }
}

impl From<Vec<f64>> for Embedding {
    fn from(values: Vec<f64>) -> Self {
        Self(values)
    }
}
