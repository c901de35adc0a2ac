// Density-based grouping with a minimum cluster size of one: clusters are the
// connected components of the "distance <= eps" graph, so every vector gets a
// label and nothing is treated as noise.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

use crate::core::features::FeatureMatrix;

#[derive(Debug, Error, PartialEq)]
pub enum ClusterError {
    #[error("Feature vector {index} has {found} values, expected {expected}")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        found: usize,
    },

    #[error("Identity list has {ids} entries but there are {rows} feature vectors")]
    Misaligned { ids: usize, rows: usize },

    #[error("Clustering radius must be positive and finite, got {0}")]
    InvalidRadius(f64),
}

pub type ClusterLabel = u32;

/// How neighbours within eps are found. Both produce the same membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborSearch {
    /// Compare every pair.
    Pairwise,
    /// Sort by vector norm and only compare pairs whose norms differ by at
    /// most eps (`| |a| - |b| | <= |a - b|`).
    NormSweep,
    /// `Pairwise` up to the given batch size, `NormSweep` above it.
    Auto { threshold: usize },
}

/// Check every row has the same length; returns that length (0 when empty).
pub fn check_dimensions(rows: &[Vec<f32>]) -> Result<usize, ClusterError> {
    let Some(first) = rows.first() else {
        return Ok(0);
    };
    let expected = first.len();
    match rows.iter().position(|r| r.len() != expected) {
        Some(index) => Err(ClusterError::DimensionMismatch {
            index,
            expected,
            found: rows[index].len(),
        }),
        None => Ok(expected),
    }
}

pub struct Clusterer {
    eps: f64,
    search: NeighborSearch,
    distance_evaluations: AtomicUsize,
}

impl Clusterer {
    pub fn new(eps: f64) -> Result<Self, ClusterError> {
        if !eps.is_finite() || eps <= 0.0 {
            return Err(ClusterError::InvalidRadius(eps));
        }
        Ok(Self {
            eps,
            search: NeighborSearch::Auto { threshold: 512 },
            distance_evaluations: AtomicUsize::new(0),
        })
    }

    pub fn with_search(mut self, search: NeighborSearch) -> Self {
        self.search = search;
        self
    }

    pub fn eps(&self) -> f64 {
        self.eps
    }

    /// Number of pairwise distances computed so far by this instance.
    pub fn distance_evaluations(&self) -> usize {
        self.distance_evaluations.load(Ordering::Relaxed)
    }

    /// Label every row; rows sharing a label are in the same cluster.
    ///
    /// Labels are numbered by first appearance in `rows`. An empty input
    /// yields an empty labelling. Rows of differing length are rejected
    /// before any distance is computed.
    pub fn cluster(&self, rows: &[Vec<f32>]) -> Result<Vec<ClusterLabel>, ClusterError> {
        check_dimensions(rows)?;
        let n = rows.len();
        if n == 0 {
            return Ok(Vec::new());
        }

        let mut components = UnionFind::new(n);
        let search = match self.search {
            NeighborSearch::Auto { threshold } if n > threshold => NeighborSearch::NormSweep,
            NeighborSearch::Auto { .. } => NeighborSearch::Pairwise,
            other => other,
        };
        match search {
            NeighborSearch::NormSweep => self.link_norm_sweep(rows, &mut components),
            _ => self.link_pairwise(rows, &mut components),
        }

        let mut labels = Vec::with_capacity(n);
        let mut by_root: HashMap<usize, ClusterLabel> = HashMap::new();
        for i in 0..n {
            let root = components.find(i);
            let next = by_root.len() as ClusterLabel;
            labels.push(*by_root.entry(root).or_insert(next));
        }

        log::debug!(
            "clustered {} vectors into {} groups with eps {} ({} distance evaluations)",
            n,
            by_root.len(),
            self.eps,
            self.distance_evaluations()
        );
        Ok(labels)
    }

    /// Cluster a matrix and attach each label to its identity.
    pub fn partition(&self, matrix: &FeatureMatrix) -> Result<Partition, ClusterError> {
        let labels = self.cluster(matrix.rows())?;
        Partition::from_labels(matrix.ids(), &labels)
    }

    fn link_pairwise(&self, rows: &[Vec<f32>], components: &mut UnionFind) {
        for i in 0..rows.len() {
            for j in (i + 1)..rows.len() {
                if components.find(i) == components.find(j) {
                    continue;
                }
                if self.within_eps(&rows[i], &rows[j]) {
                    components.union(i, j);
                }
            }
        }
    }

    fn link_norm_sweep(&self, rows: &[Vec<f32>], components: &mut UnionFind) {
        let norms: Vec<f64> = rows.iter().map(|r| norm(r)).collect();
        let mut order: Vec<usize> = (0..rows.len()).collect();
        order.sort_by(|&a, &b| norms[a].total_cmp(&norms[b]).then(a.cmp(&b)));

        // Slack keeps pairs sitting exactly on the radius from being pruned
        // by rounding in the norms.
        let window = self.eps * (1.0 + 1e-9) + 1e-9;
        for (pos, &i) in order.iter().enumerate() {
            for &j in &order[pos + 1..] {
                if norms[j] - norms[i] > window {
                    break;
                }
                if components.find(i) == components.find(j) {
                    continue;
                }
                if self.within_eps(&rows[i], &rows[j]) {
                    components.union(i, j);
                }
            }
        }
    }

    fn within_eps(&self, a: &[f32], b: &[f32]) -> bool {
        self.distance_evaluations.fetch_add(1, Ordering::Relaxed);
        euclidean_distance(a, b) <= self.eps
    }
}

pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = f64::from(*x) - f64::from(*y);
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

fn norm(a: &[f32]) -> f64 {
    a.iter()
        .map(|x| f64::from(*x) * f64::from(*x))
        .sum::<f64>()
        .sqrt()
}

struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

/// One cluster: its label and member identities in input order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cluster {
    pub label: ClusterLabel,
    pub members: Vec<String>,
}

impl Cluster {
    /// First member, used to name the cluster.
    pub fn representative(&self) -> &str {
        &self.members[0]
    }
}

/// Ordered `(identity, label)` assignments for one clustering run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Partition {
    pub assignments: Vec<(String, ClusterLabel)>,
}

impl Partition {
    pub fn from_labels(ids: &[String], labels: &[ClusterLabel]) -> Result<Self, ClusterError> {
        if ids.len() != labels.len() {
            return Err(ClusterError::Misaligned {
                ids: ids.len(),
                rows: labels.len(),
            });
        }
        Ok(Self {
            assignments: ids.iter().cloned().zip(labels.iter().copied()).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    /// Clusters ordered by the first appearance of their label.
    pub fn clusters(&self) -> Vec<Cluster> {
        let mut clusters: Vec<Cluster> = Vec::new();
        let mut index: HashMap<ClusterLabel, usize> = HashMap::new();
        for (id, label) in &self.assignments {
            match index.get(label) {
                Some(&i) => clusters[i].members.push(id.clone()),
                None => {
                    index.insert(*label, clusters.len());
                    clusters.push(Cluster {
                        label: *label,
                        members: vec![id.clone()],
                    });
                }
            }
        }
        clusters
    }

    /// Membership as sorted groups of identities, independent of label
    /// values and input order.
    pub fn groups(&self) -> Vec<Vec<String>> {
        let mut groups: Vec<Vec<String>> = self
            .clusters()
            .into_iter()
            .map(|c| {
                let mut members = c.members;
                members.sort();
                members
            })
            .collect();
        groups.sort();
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("logo{i}")).collect()
    }

    #[test]
    fn test_empty_batch_is_empty_partition() {
        let clusterer = Clusterer::new(1.0).unwrap();
        assert_eq!(clusterer.cluster(&[]).unwrap(), Vec::<ClusterLabel>::new());
        assert_eq!(clusterer.distance_evaluations(), 0);
    }

    #[test]
    fn test_rejects_invalid_radius() {
        assert_eq!(
            Clusterer::new(0.0).err(),
            Some(ClusterError::InvalidRadius(0.0))
        );
        assert!(Clusterer::new(-3.0).is_err());
        assert!(Clusterer::new(f64::INFINITY).is_err());
    }

    #[test]
    fn test_dimension_mismatch_before_any_distance() {
        let clusterer = Clusterer::new(10.0).unwrap();
        let rows = vec![vec![0.0, 0.0], vec![1.0, 1.0], vec![1.0]];

        let err = clusterer.cluster(&rows).unwrap_err();
        assert_eq!(
            err,
            ClusterError::DimensionMismatch {
                index: 2,
                expected: 2,
                found: 1
            }
        );
        assert_eq!(clusterer.distance_evaluations(), 0);
    }

    #[test]
    fn test_identical_vectors_share_a_cluster() {
        let rows = vec![vec![3.0, -1.0, 7.5], vec![100.0, 0.0, 0.0], vec![3.0, -1.0, 7.5]];
        for eps in [1e-6, 0.5, 50.0] {
            let labels = Clusterer::new(eps).unwrap().cluster(&rows).unwrap();
            assert_eq!(labels[0], labels[2]);
        }
    }

    #[test]
    fn test_transitive_linking() {
        // a-b = 1.0, b-c = 1.0, a-c = 2.0 > eps
        let rows = vec![vec![0.0, 0.0], vec![1.0, 0.0], vec![2.0, 0.0], vec![9.0, 9.0]];
        let clusterer = Clusterer::new(1.0).unwrap();
        assert!(euclidean_distance(&rows[0], &rows[2]) > clusterer.eps());

        let labels = clusterer.cluster(&rows).unwrap();
        assert_eq!(labels[0], labels[1]);
        assert_eq!(labels[1], labels[2]);
        assert_ne!(labels[0], labels[3]);
    }

    #[test]
    fn test_labels_numbered_by_first_appearance() {
        let rows = vec![vec![10.0], vec![0.0], vec![10.5], vec![0.2]];
        let labels = Clusterer::new(1.0).unwrap().cluster(&rows).unwrap();
        assert_eq!(labels, vec![0, 1, 0, 1]);
    }

    #[test]
    fn test_partition_clusters_and_groups() {
        let rows = vec![vec![0.0], vec![50.0], vec![0.5]];
        let matrix = FeatureMatrix::from_parts(ids(3), rows).unwrap();
        let partition = Clusterer::new(1.0).unwrap().partition(&matrix).unwrap();

        let clusters = partition.clusters();
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].members, vec!["logo0", "logo2"]);
        assert_eq!(clusters[0].representative(), "logo0");
        assert_eq!(clusters[1].members, vec!["logo1"]);
        assert_eq!(
            partition.groups(),
            vec![
                vec!["logo0".to_string(), "logo2".to_string()],
                vec!["logo1".to_string()]
            ]
        );
    }

    #[test]
    fn test_partition_rejects_label_count_mismatch() {
        assert_eq!(
            Partition::from_labels(&ids(3), &[0, 0]),
            Err(ClusterError::Misaligned { ids: 3, rows: 2 })
        );
    }

    #[test]
    fn test_norm_sweep_prunes_distant_pairs() {
        let rows: Vec<Vec<f32>> = (0..40).map(|i| vec![i as f32 * 10.0, 0.0]).collect();

        let pairwise = Clusterer::new(1.0)
            .unwrap()
            .with_search(NeighborSearch::Pairwise);
        let sweep = Clusterer::new(1.0)
            .unwrap()
            .with_search(NeighborSearch::NormSweep);

        assert_eq!(pairwise.cluster(&rows).unwrap(), sweep.cluster(&rows).unwrap());
        assert!(sweep.distance_evaluations() < pairwise.distance_evaluations());
    }

    #[test]
    fn test_auto_search_switches_on_size() {
        let rows: Vec<Vec<f32>> = (0..10).map(|i| vec![i as f32 * 10.0]).collect();
        let small = Clusterer::new(1.0)
            .unwrap()
            .with_search(NeighborSearch::Auto { threshold: 100 });
        small.cluster(&rows).unwrap();
        assert_eq!(small.distance_evaluations(), 45);

        let large = Clusterer::new(1.0)
            .unwrap()
            .with_search(NeighborSearch::Auto { threshold: 5 });
        large.cluster(&rows).unwrap();
        assert_eq!(large.distance_evaluations(), 0);
    }

    fn point_sets() -> impl Strategy<Value = Vec<Vec<f32>>> {
        (1usize..4).prop_flat_map(|dim| {
            prop::collection::vec(
                prop::collection::vec((-20i32..20).prop_map(|v| v as f32), dim),
                0..25,
            )
        })
    }

    proptest! {
        #[test]
        fn prop_every_vector_is_labelled(rows in point_sets(), eps in 0.5f64..10.0) {
            let labels = Clusterer::new(eps).unwrap().cluster(&rows).unwrap();
            prop_assert_eq!(labels.len(), rows.len());
        }

        #[test]
        fn prop_membership_invariant_under_permutation(
            (rows, perm) in point_sets().prop_flat_map(|rows| {
                let n = rows.len();
                (Just(rows), Just((0..n).collect::<Vec<usize>>()).prop_shuffle())
            }),
            eps in 0.5f64..10.0,
        ) {
            let names = ids(rows.len());
            let original = FeatureMatrix::from_parts(names.clone(), rows.clone()).unwrap();
            let shuffled = FeatureMatrix::from_parts(
                perm.iter().map(|&i| names[i].clone()).collect(),
                perm.iter().map(|&i| rows[i].clone()).collect(),
            )
            .unwrap();

            let clusterer = Clusterer::new(eps).unwrap();
            prop_assert_eq!(
                clusterer.partition(&original).unwrap().groups(),
                clusterer.partition(&shuffled).unwrap().groups()
            );
        }

        #[test]
        fn prop_search_strategies_agree(rows in point_sets(), eps in 0.5f64..10.0) {
            let pairwise = Clusterer::new(eps).unwrap().with_search(NeighborSearch::Pairwise);
            let sweep = Clusterer::new(eps).unwrap().with_search(NeighborSearch::NormSweep);
            prop_assert_eq!(pairwise.cluster(&rows).unwrap(), sweep.cluster(&rows).unwrap());
        }
    }
}
