//! Isolation forest outlier estimator.
//!
//! Each tree recursively splits a random subsample on a random feature at a
//! random threshold. Points that are isolated after few splits are unusual.
//! Training is seeded so the same data and parameters always produce the
//! same forest.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::ModelError;
use crate::features::FeatureVector;

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Training parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestParams {
    /// Number of trees in the ensemble.
    pub n_estimators: usize,
    /// Upper bound on rows drawn (without replacement) per tree.
    pub max_samples: usize,
    /// Expected fraction of anomalous rows in the training data.
    pub contamination: f64,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_samples: 256,
            contamination: 0.05,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Normal,
    Anomalous,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Node {
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct IsolationTree {
    root: Node,
}

impl IsolationTree {
    fn grow(data: &[FeatureVector], idx: &mut [usize], max_depth: usize, rng: &mut StdRng) -> Self {
        Self {
            root: grow_node(data, idx, 0, max_depth, rng),
        }
    }

    fn path_length(&self, x: &[f64]) -> f64 {
        let mut node = &self.root;
        let mut depth = 0.0;
        loop {
            match node {
                Node::Leaf { size } => return depth + average_path_length(*size),
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    node = if x[*feature] <= *threshold { left } else { right };
                    depth += 1.0;
                }
            }
        }
    }
}

fn grow_node(
    data: &[FeatureVector],
    idx: &mut [usize],
    depth: usize,
    max_depth: usize,
    rng: &mut StdRng,
) -> Node {
    if idx.len() <= 1 || depth >= max_depth {
        return Node::Leaf { size: idx.len() };
    }

    // Only features that still vary inside this node can separate it.
    let width = data[idx[0]].len();
    let mut candidates = Vec::with_capacity(width);
    for f in 0..width {
        let (lo, hi) = idx.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &i| {
            (lo.min(data[i][f]), hi.max(data[i][f]))
        });
        if hi > lo {
            candidates.push((f, lo, hi));
        }
    }
    if candidates.is_empty() {
        return Node::Leaf { size: idx.len() };
    }

    let (feature, lo, hi) = candidates[rng.gen_range(0..candidates.len())];
    let threshold = rng.gen_range(lo..hi);

    // `lo <= threshold < hi`, so both sides are non-empty.
    let mut split = 0;
    for k in 0..idx.len() {
        if data[idx[k]][feature] <= threshold {
            idx.swap(split, k);
            split += 1;
        }
    }
    let (l, r) = idx.split_at_mut(split);

    Node::Split {
        feature,
        threshold,
        left: Box::new(grow_node(data, l, depth + 1, max_depth, rng)),
        right: Box::new(grow_node(data, r, depth + 1, max_depth, rng)),
    }
}

/// Expected path length of an unsuccessful BST search over `n` points.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

/// A fitted isolation forest plus its decision threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationForest {
    params: ForestParams,
    n_features: usize,
    sample_size: usize,
    threshold: f64,
    trees: Vec<IsolationTree>,
}

impl IsolationForest {
    pub fn fit(data: &[FeatureVector], params: ForestParams) -> Result<Self, ModelError> {
        if data.is_empty() {
            return Err(ModelError::EmptyTrainingSet);
        }
        let n_features = data[0].len();
        if let Some(bad) = data.iter().find(|r| r.len() != n_features) {
            return Err(ModelError::SchemaMismatch {
                expected: n_features,
                found: bad.len(),
            });
        }

        let varies = (0..n_features).any(|f| data.iter().any(|r| r[f] != data[0][f]));
        if !varies {
            return Err(ModelError::ConstantTrainingSet { rows: data.len() });
        }

        let sample_size = params.max_samples.clamp(1, data.len());
        let max_depth = (sample_size as f64).log2().ceil().max(1.0) as usize;
        let mut rng = StdRng::seed_from_u64(params.seed);

        let trees = (0..params.n_estimators.max(1))
            .map(|_| {
                let mut idx = rand::seq::index::sample(&mut rng, data.len(), sample_size).into_vec();
                IsolationTree::grow(data, &mut idx, max_depth, &mut rng)
            })
            .collect();

        let mut forest = Self {
            params,
            n_features,
            sample_size,
            threshold: 0.0,
            trees,
        };

        let mut scores: Vec<f64> = data.iter().map(|r| forest.raw_score(r)).collect();
        scores.sort_by(f64::total_cmp);
        forest.threshold = quantile(&scores, 1.0 - forest.params.contamination);

        tracing::debug!(
            trees = forest.trees.len(),
            sample_size,
            threshold = forest.threshold,
            "isolation forest fit"
        );
        Ok(forest)
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn params(&self) -> &ForestParams {
        &self.params
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Anomaly score in `(0, 1]`; higher is more unusual.
    pub fn score(&self, x: &[f64]) -> Result<f64, ModelError> {
        if x.len() != self.n_features {
            return Err(ModelError::SchemaMismatch {
                expected: self.n_features,
                found: x.len(),
            });
        }
        Ok(self.raw_score(x))
    }

    pub fn predict(&self, x: &[f64]) -> Result<Verdict, ModelError> {
        let score = self.score(x)?;
        Ok(self.classify(score))
    }

    pub fn classify(&self, score: f64) -> Verdict {
        if score > self.threshold {
            Verdict::Anomalous
        } else {
            Verdict::Normal
        }
    }

    fn raw_score(&self, x: &[f64]) -> f64 {
        let mean_path =
            self.trees.iter().map(|t| t.path_length(x)).sum::<f64>() / self.trees.len() as f64;
        let norm = average_path_length(self.sample_size);
        if norm == 0.0 {
            return 0.5;
        }
        2f64.powf(-mean_path / norm)
    }
}

/// Linear-interpolated quantile of already sorted values.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}
