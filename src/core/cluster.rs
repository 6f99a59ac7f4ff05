use crate::core::record::{Clusterable, ImageRecord, euclidean_distance};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;

/// Neighbourhood radius tuned for the default embedding space.
pub const DEFAULT_EPSILON: f32 = 1.65;
/// Minimum neighbourhood size (the point itself included) for a core point.
pub const DEFAULT_MIN_POINTS: usize = 2;

#[derive(Debug, Error, PartialEq)]
pub enum ClusterError {
    #[error("Invalid epsilon: {0}")]
    InvalidEpsilon(f32),

    #[error("min_points must be at least 1")]
    InvalidMinPoints,

    #[error("Embedding dimension mismatch for {identity}: expected {expected}, found {found}")]
    DimensionMismatch {
        identity: String,
        expected: usize,
        found: usize,
    },

    #[error("Malformed embedding for {identity}")]
    MalformedEmbedding { identity: String },
}

/// A group of visually similar images, or a single unmatched image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster<T = ImageRecord> {
    pub members: Vec<T>,
    /// Set when the member could not be placed in any dense group.
    pub is_noise: bool,
}

impl<T> Cluster<T> {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl Cluster<ImageRecord> {
    /// The member shown as the cluster's thumbnail and kept by default:
    /// the earliest capture, ties broken by path.
    pub fn representative(&self) -> Option<&ImageRecord> {
        self.members
            .iter()
            .min_by(|a, b| {
                a.captured_at
                    .cmp(&b.captured_at)
                    .then_with(|| a.identity.cmp(&b.identity))
            })
    }

    /// Every member except the representative.
    pub fn duplicates(&self) -> Vec<&ImageRecord> {
        let keep = self.representative().map(|r| r.identity.as_str());
        self.members
            .iter()
            .filter(|m| Some(m.identity.as_str()) != keep)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Label {
    Unvisited,
    Noise,
    Member(usize),
}

/// DBSCAN over embeddings with Euclidean distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DuplicateClusterer {
    epsilon: f32,
    min_points: usize,
}

impl DuplicateClusterer {
    pub fn new(epsilon: f32, min_points: usize) -> Result<Self, ClusterError> {
        if !epsilon.is_finite() || epsilon < 0.0 {
            return Err(ClusterError::InvalidEpsilon(epsilon));
        }
        if min_points == 0 {
            return Err(ClusterError::InvalidMinPoints);
        }
        Ok(Self {
            epsilon,
            min_points,
        })
    }

    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    pub fn min_points(&self) -> usize {
        self.min_points
    }

    /// Partition `points` into dense clusters followed by noise singletons.
    ///
    /// Every input point appears in exactly one returned cluster. Membership
    /// is deterministic for a given input order; the order of clusters is not
    /// part of the contract.
    pub fn cluster<T>(&self, points: &[T]) -> Result<Vec<Cluster<T>>, ClusterError>
    where
        T: Clusterable + Clone + Sync,
    {
        validate_points(points)?;

        let neighbourhoods = self.neighbourhoods(points);
        let mut labels = vec![Label::Unvisited; points.len()];
        let mut cluster_count = 0;

        for index in 0..points.len() {
            if labels[index] != Label::Unvisited {
                continue;
            }
            if neighbourhoods[index].len() < self.min_points {
                labels[index] = Label::Noise;
                continue;
            }

            let cluster_id = cluster_count;
            cluster_count += 1;
            labels[index] = Label::Member(cluster_id);

            let mut seeds: VecDeque<usize> = neighbourhoods[index].iter().copied().collect();
            while let Some(candidate) = seeds.pop_front() {
                match labels[candidate] {
                    Label::Member(_) => {}
                    // Previously rejected as noise, reachable now: border point.
                    Label::Noise => labels[candidate] = Label::Member(cluster_id),
                    Label::Unvisited => {
                        labels[candidate] = Label::Member(cluster_id);
                        if neighbourhoods[candidate].len() >= self.min_points {
                            seeds.extend(neighbourhoods[candidate].iter().copied());
                        }
                    }
                }
            }
        }

        let mut clusters: Vec<Cluster<T>> = (0..cluster_count)
            .map(|_| Cluster {
                members: Vec::new(),
                is_noise: false,
            })
            .collect();
        let mut noise = Vec::new();

        for (point, label) in points.iter().zip(labels) {
            match label {
                Label::Member(id) => clusters[id].members.push(point.clone()),
                _ => noise.push(Cluster {
                    members: vec![point.clone()],
                    is_noise: true,
                }),
            }
        }

        log::debug!(
            "Clustered {} points into {} groups and {} noise points",
            points.len(),
            clusters.len(),
            noise.len()
        );

        clusters.extend(noise);
        Ok(clusters)
    }

    /// Indices within `epsilon` of each point, the point itself included.
    /// Pairwise O(n²), computed in parallel.
    fn neighbourhoods<T>(&self, points: &[T]) -> Vec<Vec<usize>>
    where
        T: Clusterable + Sync,
    {
        points
            .par_iter()
            .map(|point| {
                points
                    .iter()
                    .enumerate()
                    .filter(|(_, other)| {
                        euclidean_distance(point.point(), other.point()) <= self.epsilon
                    })
                    .map(|(index, _)| index)
                    .collect()
            })
            .collect()
    }
}

impl Default for DuplicateClusterer {
    fn default() -> Self {
        Self {
            epsilon: DEFAULT_EPSILON,
            min_points: DEFAULT_MIN_POINTS,
        }
    }
}

fn validate_points<T: Clusterable>(points: &[T]) -> Result<(), ClusterError> {
    let Some(first) = points.first() else {
        return Ok(());
    };
    let expected = first.point().len();

    for point in points {
        let embedding = point.point();
        if !point.is_well_formed() {
            return Err(ClusterError::MalformedEmbedding {
                identity: point.identity().to_string(),
            });
        }
        if embedding.len() != expected {
            return Err(ClusterError::DimensionMismatch {
                identity: point.identity().to_string(),
                expected,
                found: embedding.len(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    /// Synthetic point used to check the clusterer works over any source.
    #[derive(Debug, Clone)]
    struct Point {
        id: String,
        coords: Vec<f32>,
    }

    impl Clusterable for Point {
        fn identity(&self) -> &str {
            &self.id
        }

        fn point(&self) -> &[f32] {
            &self.coords
        }
    }

    fn point(id: &str, coords: &[f32]) -> Point {
        Point {
            id: id.to_string(),
            coords: coords.to_vec(),
        }
    }

    fn record(id: &str, captured_at: i64, coords: &[f32]) -> ImageRecord {
        ImageRecord::new(id, captured_at, coords.to_vec())
    }

    fn ids<T: Clusterable>(cluster: &Cluster<T>) -> HashSet<String> {
        cluster
            .members
            .iter()
            .map(|m| m.identity().to_string())
            .collect()
    }

    #[test]
    fn test_close_points_form_one_cluster() {
        let records = vec![
            record("a", 0, &[0.0, 0.0]),
            record("b", 0, &[0.1, 0.1]),
            record("c", 0, &[0.2, 0.1]),
        ];

        let clusters = DuplicateClusterer::default().cluster(&records).unwrap();

        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].len(), 3);
        assert!(!clusters[0].is_noise);
        assert!(clusters.iter().all(|c| !c.is_noise));
    }

    #[test]
    fn test_distant_points_are_noise() {
        let records = vec![record("a", 0, &[0.0, 0.0]), record("b", 0, &[50.0, 50.0])];

        let clusters = DuplicateClusterer::default().cluster(&records).unwrap();

        assert_eq!(clusters.len(), 2);
        assert!(clusters.iter().all(|c| c.is_noise && c.len() == 1));
        let all: HashSet<String> = clusters.iter().flat_map(ids).collect();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_pair_within_epsilon_is_grouped() {
        // min_points counts the point itself, so two close images are a group.
        let records = vec![record("a", 0, &[1.0, 1.0]), record("b", 0, &[1.5, 1.0])];

        let clusters = DuplicateClusterer::default().cluster(&records).unwrap();

        assert_eq!(clusters.len(), 1);
        assert!(!clusters[0].is_noise);
    }

    #[test]
    fn test_density_connected_chain() {
        // Ends are far apart but linked through core points spaced 1.0 apart.
        let points: Vec<Point> = (0..6)
            .map(|i| point(&format!("p{i}"), &[i as f32, 0.0]))
            .collect();

        let clusters = DuplicateClusterer::new(1.65, 2)
            .unwrap()
            .cluster(&points)
            .unwrap();

        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].len(), 6);
    }

    #[test]
    fn test_border_point_joins_cluster() {
        // "edge" has only one neighbour besides itself, so it is not core with
        // min_points = 3, but it lies within epsilon of the core point "b".
        let points = vec![
            point("a", &[0.0]),
            point("b", &[1.0]),
            point("c", &[0.5]),
            point("edge", &[2.5]),
            point("far", &[10.0]),
        ];

        let clusters = DuplicateClusterer::new(1.5, 3)
            .unwrap()
            .cluster(&points)
            .unwrap();

        let groups: Vec<_> = clusters.iter().filter(|c| !c.is_noise).collect();
        assert_eq!(groups.len(), 1);
        let members = ids(groups[0]);
        assert!(members.contains("edge"));
        assert_eq!(members.len(), 4);

        let noise: Vec<_> = clusters.iter().filter(|c| c.is_noise).collect();
        assert_eq!(noise.len(), 1);
        assert!(ids(noise[0]).contains("far"));
    }

    #[test]
    fn test_output_is_a_partition() {
        let points: Vec<Point> = (0..60)
            .map(|i| {
                let x = ((i * 37) % 11) as f32 * 0.9;
                let y = ((i * 17) % 7) as f32 * 2.3;
                point(&format!("p{i}"), &[x, y])
            })
            .collect();

        let clusters = DuplicateClusterer::default().cluster(&points).unwrap();

        let mut seen = HashSet::new();
        for cluster in &clusters {
            assert!(!cluster.is_empty());
            if cluster.is_noise {
                assert_eq!(cluster.len(), 1);
            }
            for member in &cluster.members {
                assert!(seen.insert(member.id.clone()), "duplicate {}", member.id);
            }
        }
        assert_eq!(seen.len(), points.len());
    }

    #[test]
    fn test_membership_is_deterministic() {
        let points: Vec<Point> = (0..30)
            .map(|i| point(&format!("p{i}"), &[(i % 5) as f32 * 3.0, (i / 5) as f32 * 0.4]))
            .collect();
        let clusterer = DuplicateClusterer::default();

        let first: Vec<HashSet<String>> =
            clusterer.cluster(&points).unwrap().iter().map(ids).collect();
        let second: Vec<HashSet<String>> =
            clusterer.cluster(&points).unwrap().iter().map(ids).collect();

        assert_eq!(first, second);
    }

    #[test]
    fn test_min_points_one_makes_every_point_core() {
        let points = vec![point("a", &[0.0]), point("b", &[100.0])];

        let clusters = DuplicateClusterer::new(1.0, 1)
            .unwrap()
            .cluster(&points)
            .unwrap();

        assert_eq!(clusters.len(), 2);
        assert!(clusters.iter().all(|c| !c.is_noise));
    }

    #[test]
    fn test_empty_input() {
        let clusters = DuplicateClusterer::default()
            .cluster::<ImageRecord>(&[])
            .unwrap();
        assert!(clusters.is_empty());
    }

    #[test]
    fn test_rejects_mismatched_dimensions() {
        let records = vec![record("a", 0, &[0.0, 0.0]), record("b", 0, &[0.0])];

        let err = DuplicateClusterer::default().cluster(&records).unwrap_err();

        assert_eq!(
            err,
            ClusterError::DimensionMismatch {
                identity: "b".to_string(),
                expected: 2,
                found: 1,
            }
        );
    }

    #[test]
    fn test_rejects_non_finite_embeddings() {
        let records = vec![record("a", 0, &[0.0, f32::NAN])];

        let err = DuplicateClusterer::default().cluster(&records).unwrap_err();

        assert!(matches!(err, ClusterError::MalformedEmbedding { .. }));
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(matches!(
            DuplicateClusterer::new(-1.0, 2),
            Err(ClusterError::InvalidEpsilon(_))
        ));
        assert!(matches!(
            DuplicateClusterer::new(f32::NAN, 2),
            Err(ClusterError::InvalidEpsilon(_))
        ));
        assert_eq!(
            DuplicateClusterer::new(1.0, 0),
            Err(ClusterError::InvalidMinPoints)
        );
    }

    #[test]
    fn test_representative_is_earliest_capture() {
        let cluster = Cluster {
            members: vec![
                record("/b.jpg", 300, &[0.0]),
                record("/a.jpg", 100, &[0.0]),
                record("/c.jpg", 100, &[0.0]),
            ],
            is_noise: false,
        };

        assert_eq!(cluster.representative().unwrap().identity, "/a.jpg");
        let duplicates: Vec<&str> = cluster
            .duplicates()
            .iter()
            .map(|r| r.identity.as_str())
            .collect();
        assert_eq!(duplicates, vec!["/b.jpg", "/c.jpg"]);
    }
}
