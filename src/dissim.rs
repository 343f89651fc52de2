use crate::common::{Config, DissimCriterion};
use crate::region::Region;
use multiversion::multiversion;
use std::cmp::Ordering;

/// Ordering key of a merge candidate.
///
/// Lower dissimilarity wins; on equal dissimilarity the larger combined pixel count wins, then
/// the smaller label. `Ordering::Less` means "better", so heaps over `MergeKey` are min-heaps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergeKey {
    pub dissim: f64,
    /// Combined pixel count of the region and its chosen partner.
    pub npix: u32,
    pub label: u32,
}

impl MergeKey {
    /// Key of a region without candidates. Sorts after every real candidate.
    pub fn none(label: u32) -> Self {
        Self {
            dissim: f64::INFINITY,
            npix: 0,
            label,
        }
    }

    pub fn is_none(&self) -> bool {
        self.dissim == f64::INFINITY
    }

    pub fn is_better(&self, other: &MergeKey) -> bool {
        self.cmp(other) == Ordering::Less
    }
}

impl Eq for MergeKey {}

impl PartialOrd for MergeKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dissim
            .total_cmp(&other.dissim)
            .then_with(|| other.npix.cmp(&self.npix))
            .then_with(|| self.label.cmp(&other.label))
    }
}

#[multiversion(targets = "simd")]
fn sq_mean_diff(a: &[f64], na: f64, b: &[f64], nb: f64) -> f64 {
    a.iter()
        .zip(b)
        .map(|(sa, sb)| {
            let d = sa / na - sb / nb;
            d * d
        })
        .sum()
}

#[multiversion(targets = "simd")]
fn abs_mean_diff(a: &[f64], na: f64, b: &[f64], nb: f64) -> f64 {
    a.iter().zip(b).map(|(sa, sb)| (sa / na - sb / nb).abs()).sum()
}

#[multiversion(targets = "simd")]
fn max_abs_mean_diff(a: &[f64], na: f64, b: &[f64], nb: f64) -> f64 {
    a.iter()
        .zip(b)
        .map(|(sa, sb)| (sa / na - sb / nb).abs())
        .fold(0.0, f64::max)
}

fn band_std_dev(sum: f64, sumsq: f64, n: f64) -> f64 {
    let mean = sum / n;
    (sumsq / n - mean * mean).max(0.0).sqrt()
}

/// Distance of a band's intensity distribution from the uniform one over `n` pixels
/// (`ln n` minus its entropy). Zero for a uniform region.
fn band_entropy_deficit(sum: f64, sumxlogx: f64, n: f64) -> f64 {
    if sum > 0.0 {
        n.ln() - (sum.ln() - sumxlogx / sum)
    } else {
        0.0
    }
}

/// Computes region-pair dissimilarities for one partition.
#[derive(Debug, Clone)]
pub struct DissimEvaluator {
    criterion: DissimCriterion,
    edge_wght: f64,
    edge_scale: f64,
    initial_merge_divisor: f64,
    spclust_wght: f64,
}

impl DissimEvaluator {
    /// `edge_scale` normalizes region max-edge values into `[0, 1]`.
    pub fn new(config: &Config, edge_scale: f32) -> Self {
        Self {
            criterion: config.dissim_criterion,
            edge_wght: config.edge_wght as f64,
            edge_scale: if edge_scale > 0.0 { edge_scale as f64 } else { 1.0 },
            initial_merge_divisor: config.initial_merge_divisor,
            spclust_wght: config.spclust_wght as f64,
        }
    }

    pub fn spclust_enabled(&self) -> bool {
        self.spclust_wght > 0.0
    }

    /// The criterion alone, without weighting.
    pub fn raw(&self, a: &Region, b: &Region) -> f64 {
        if a.npix == 0 || b.npix == 0 {
            return f64::INFINITY;
        }
        let na = a.npix as f64;
        let nb = b.npix as f64;
        let nbands = a.sum.len().max(1) as f64;
        match self.criterion {
            DissimCriterion::OneNorm => abs_mean_diff(&a.sum, na, &b.sum, nb),
            DissimCriterion::TwoNorm => sq_mean_diff(&a.sum, na, &b.sum, nb).sqrt(),
            DissimCriterion::InfinityNorm => max_abs_mean_diff(&a.sum, na, &b.sum, nb),
            DissimCriterion::SpectralAngle => {
                let (mut dot, mut norm_a, mut norm_b) = (0.0, 0.0, 0.0);
                for (sa, sb) in a.sum.iter().zip(&b.sum) {
                    let (ma, mb) = (sa / na, sb / nb);
                    dot += ma * mb;
                    norm_a += ma * ma;
                    norm_b += mb * mb;
                }
                if norm_a == 0.0 && norm_b == 0.0 {
                    0.0
                } else if norm_a == 0.0 || norm_b == 0.0 {
                    std::f64::consts::FRAC_PI_2
                } else {
                    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0).acos()
                }
            }
            DissimCriterion::BandSumMse => {
                let weight = na * nb / (na + nb);
                (weight * sq_mean_diff(&a.sum, na, &b.sum, nb) / nbands).sqrt()
            }
            DissimCriterion::StdDevIncrease => {
                let n = na + nb;
                let increase: f64 = (0..a.sum.len())
                    .map(|band| {
                        let merged = band_std_dev(
                            a.sum[band] + b.sum[band],
                            a.sumsq[band] + b.sumsq[band],
                            n,
                        );
                        let sa = band_std_dev(a.sum[band], a.sumsq[band], na);
                        let sb = band_std_dev(b.sum[band], b.sumsq[band], nb);
                        merged - (na * sa + nb * sb) / n
                    })
                    .sum();
                (increase / nbands).max(0.0)
            }
            DissimCriterion::Entropy => {
                let n = na + nb;
                let increase: f64 = (0..a.sum.len())
                    .map(|band| {
                        let merged = band_entropy_deficit(
                            a.sum[band] + b.sum[band],
                            a.sumxlogx[band] + b.sumxlogx[band],
                            n,
                        );
                        n * merged
                            - na * band_entropy_deficit(a.sum[band], a.sumxlogx[band], na)
                            - nb * band_entropy_deficit(b.sum[band], b.sumxlogx[band], nb)
                    })
                    .sum();
                (increase / nbands).max(0.0)
            }
        }
    }

    /// Dissimilarity of a spatially adjacent pair, with initial-merge and edge weighting.
    pub fn neighbor(&self, a: &Region, b: &Region) -> f64 {
        let raw = self.raw(a, b);
        if a.init_merge && b.init_merge {
            return raw / self.initial_merge_divisor;
        }
        if self.edge_wght > 0.0 {
            let edge = (a.max_edge.min(b.max_edge) as f64 / self.edge_scale).clamp(0.0, 1.0);
            raw * ((1.0 - self.edge_wght) + self.edge_wght * edge)
        } else {
            raw
        }
    }

    /// Dissimilarity of a pair considered by spectral clustering, regardless of adjacency.
    pub fn nonadjacent(&self, a: &Region, b: &Region) -> f64 {
        if !self.spclust_enabled() {
            return f64::INFINITY;
        }
        self.raw(a, b) / self.spclust_wght
    }
}
