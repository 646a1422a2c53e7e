//! K-means++ cluster summarizer for point clouds (spec.md §4.F, §4.H).
//!
//! Points are normalized per-axis into the unit cube (degenerate axes,
//! range `< 1e-6`, are left unscaled to avoid dividing by ~0), clustered
//! with PP-initialized Lloyd iterations, then folded back into
//! `[min.xyz, max.xyz, color.rgb]` records via an online Welford pass
//! over the *original* (unnormalized) coordinates and colors.

use rand::Rng;

use crate::config::KMEANS_MAX_ITERS;

const EPSILON: f32 = 1e-4;
const DEGENERATE_RANGE: f32 = 1e-6;

/// A clustered summary record: nine little-endian f32 values,
/// `[min.xyz, max.xyz, color.rgb]`.
pub type ClusterRecord = [f32; 9];

/// Chooses the cluster count `⌊log₁₀(n+1)⌋ + 1`, clamped to `[1, n]`.
pub fn cluster_count(n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    let k = ((n as f64 + 1.0).log10().floor() as usize) + 1;
    k.clamp(1, n)
}

fn normalize(points: &[[f32; 3]]) -> Vec<[f32; 3]> {
    let mut min = [f32::INFINITY; 3];
    let mut max = [f32::NEG_INFINITY; 3];
    for p in points {
        for axis in 0..3 {
            min[axis] = min[axis].min(p[axis]);
            max[axis] = max[axis].max(p[axis]);
        }
    }

    let mut ranges = [0.0f32; 3];
    for axis in 0..3 {
        ranges[axis] = max[axis] - min[axis];
    }

    points
        .iter()
        .map(|p| {
            let mut out = [0.0f32; 3];
            for axis in 0..3 {
                out[axis] = if ranges[axis] < DEGENERATE_RANGE {
                    p[axis]
                } else {
                    (p[axis] - min[axis]) / ranges[axis]
                };
            }
            out
        })
        .collect()
}

fn sq_dist(a: [f32; 3], b: [f32; 3]) -> f32 {
    (0..3).map(|i| (a[i] - b[i]).powi(2)).sum()
}

/// PP (k-means++) seeding: first center chosen uniformly, subsequent
/// centers chosen with probability proportional to squared distance to
/// the nearest already-chosen center.
fn init_centers(points: &[[f32; 3]], k: usize, rng: &mut impl Rng) -> Vec<[f32; 3]> {
    let mut centers = Vec::with_capacity(k);
    centers.push(points[rng.gen_range(0..points.len())]);

    while centers.len() < k {
        let weights: Vec<f32> = points
            .iter()
            .map(|p| {
                centers
                    .iter()
                    .map(|c| sq_dist(*p, *c))
                    .fold(f32::INFINITY, f32::min)
            })
            .collect();

        let total: f32 = weights.iter().sum();
        if total <= 0.0 {
            centers.push(points[rng.gen_range(0..points.len())]);
            continue;
        }

        let mut target = rng.gen_range(0.0..total);
        let mut chosen = points.len() - 1;
        for (i, w) in weights.iter().enumerate() {
            if target < *w {
                chosen = i;
                break;
            }
            target -= w;
        }
        centers.push(points[chosen]);
    }

    centers
}

fn assign(points: &[[f32; 3]], centers: &[[f32; 3]]) -> Vec<usize> {
    points
        .iter()
        .map(|p| {
            let mut best = 0;
            let mut best_dist = f32::INFINITY;
            for (i, c) in centers.iter().enumerate() {
                let d = sq_dist(*p, *c);
                if d < best_dist {
                    best_dist = d;
                    best = i;
                }
            }
            best
        })
        .collect()
}

fn recompute_centers(points: &[[f32; 3]], assignments: &[usize], k: usize) -> Vec<[f32; 3]> {
    let mut sums = vec![[0.0f32; 3]; k];
    let mut counts = vec![0usize; k];
    for (p, &a) in points.iter().zip(assignments) {
        for axis in 0..3 {
            sums[a][axis] += p[axis];
        }
        counts[a] += 1;
    }
    sums.into_iter()
        .zip(counts)
        .map(|(sum, count)| {
            if count == 0 {
                [0.0; 3]
            } else {
                [
                    sum[0] / count as f32,
                    sum[1] / count as f32,
                    sum[2] / count as f32,
                ]
            }
        })
        .collect()
}

/// Runs k-means++ with `KMEANS_MAX_ITERS` Lloyd iterations, single
/// attempt, and returns the cluster assignment for each input point.
fn kmeans_assign(normalized: &[[f32; 3]], k: usize, rng: &mut impl Rng) -> Vec<usize> {
    let mut centers = init_centers(normalized, k, rng);
    let mut assignments = assign(normalized, &centers);

    for _ in 0..KMEANS_MAX_ITERS {
        let new_centers = recompute_centers(normalized, &assignments, k);
        let shift: f32 = centers
            .iter()
            .zip(&new_centers)
            .map(|(a, b)| sq_dist(*a, *b))
            .sum();
        centers = new_centers;
        assignments = assign(normalized, &centers);
        if shift < EPSILON {
            break;
        }
    }

    assignments
}

/// Online (Welford) mean/variance accumulator for a single cluster.
#[derive(Default)]
struct Welford {
    count: u64,
    mean: [f64; 3],
    m2: [f64; 3],
    color_sum: [f64; 3],
}

impl Welford {
    fn push(&mut self, point: [f32; 3], color: [f32; 3]) {
        self.count += 1;
        let n = self.count as f64;
        for axis in 0..3 {
            let x = point[axis] as f64;
            let delta = x - self.mean[axis];
            self.mean[axis] += delta / n;
            let delta2 = x - self.mean[axis];
            self.m2[axis] += delta * delta2;
            self.color_sum[axis] += color[axis] as f64;
        }
    }

    fn finish(&self) -> ClusterRecord {
        let mut record = [0.0f32; 9];
        for axis in 0..3 {
            let stddev = if self.count > 1 {
                (self.m2[axis] / (self.count - 1) as f64).sqrt()
            } else {
                0.0
            };
            record[axis] = (self.mean[axis] - stddev) as f32;
            record[3 + axis] = (self.mean[axis] + stddev) as f32;
            record[6 + axis] = (self.color_sum[axis] / self.count as f64) as f32;
        }
        record
    }
}

/// Clusters `points`/`colors` (parallel arrays) and returns one record per
/// cluster, `[min.xyz, max.xyz, color.rgb]`. Returns an empty vec if
/// `points` has fewer than 2 entries.
pub fn summarize(points: &[[f32; 3]], colors: &[[f32; 3]], rng: &mut impl Rng) -> Vec<ClusterRecord> {
    if points.len() < 2 {
        return Vec::new();
    }

    let k = cluster_count(points.len());
    let normalized = normalize(points);
    let assignments = kmeans_assign(&normalized, k, rng);

    let mut accumulators: Vec<Welford> = (0..k).map(|_| Welford::default()).collect();
    for ((p, c), &a) in points.iter().zip(colors).zip(&assignments) {
        accumulators[a].push(*p, *c);
    }

    accumulators
        .iter()
        .filter(|w| w.count > 0)
        .map(Welford::finish)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn cluster_count_matches_log_rule() {
        assert_eq!(cluster_count(0), 0);
        assert_eq!(cluster_count(1), 1);
        assert_eq!(cluster_count(9), 1);
        assert_eq!(cluster_count(10), 2);
        assert_eq!(cluster_count(99), 2);
        assert_eq!(cluster_count(100), 3);
    }

    #[test]
    fn single_point_yields_no_clusters() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let records = summarize(&[[0.0, 0.0, 0.0]], &[[1.0, 1.0, 1.0]], &mut rng);
        assert!(records.is_empty());
    }

    #[test]
    fn two_tight_groups_separate_into_two_clusters() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let mut points = Vec::new();
        let mut colors = Vec::new();
        for i in 0..10 {
            points.push([i as f32 * 0.01, 0.0, 0.0]);
            colors.push([1.0, 0.0, 0.0]);
        }
        for i in 0..10 {
            points.push([100.0 + i as f32 * 0.01, 0.0, 0.0]);
            colors.push([0.0, 0.0, 1.0]);
        }
        let records = summarize(&points, &colors, &mut rng);
        assert_eq!(records.len(), cluster_count(20));
        for r in &records {
            assert!(r[0] <= r[3]);
        }
    }

    #[test]
    fn degenerate_axis_does_not_nan() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let points: Vec<_> = (0..5).map(|i| [i as f32, 0.0, 0.0]).collect();
        let colors = vec![[0.5, 0.5, 0.5]; 5];
        let records = summarize(&points, &colors, &mut rng);
        for r in &records {
            assert!(r.iter().all(|v| v.is_finite()));
        }
    }
}
