//! Splits the particle population across ranks.
//!
//! Every policy produces a ratio per rank. Ranks other than 0 take
//! `floor(ratio * n)`; rank 0 also takes the rounding remainder so the
//! allocations always sum to exactly `n`. The bounded policy is the exception:
//! rank 0 gets exactly its cap and the remainder is spread over the others.

use crate::error::LoadBalanceError;
use bioreactor_common::LoadBalancerConfig;
use log::{debug, info};

const RATIO_TOLERANCE: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq)]
pub enum LoadBalancer {
    Uniform { ranks: u32 },
    /// Rank 0 weighs `alpha`, every other rank weighs 1.
    HostWeighted { ranks: u32, alpha: f64 },
    Custom { ratios: Vec<f64> },
    /// Rank 0 holds at most `n_max` particles; the rest is split evenly.
    Bounded { ranks: u32, n_max: u64 },
}

impl LoadBalancer {
    pub fn uniform(ranks: u32) -> Result<Self, LoadBalanceError> {
        check_ranks(ranks)?;
        Ok(LoadBalancer::Uniform { ranks })
    }

    /// A single rank always gets everything, whatever `alpha` is.
    pub fn host_weighted(ranks: u32, alpha: f64) -> Result<Self, LoadBalanceError> {
        check_ranks(ranks)?;
        if ranks == 1 {
            return Ok(LoadBalancer::HostWeighted { ranks, alpha: 1.0 });
        }
        if !(alpha > 0.0) {
            return Err(LoadBalanceError::NonPositiveAlpha { alpha });
        }
        Ok(LoadBalancer::HostWeighted { ranks, alpha })
    }

    pub fn custom(ranks: u32, ratios: Vec<f64>) -> Result<Self, LoadBalanceError> {
        check_ranks(ranks)?;
        if ratios.len() != ranks as usize {
            return Err(LoadBalanceError::CustomRatioLength { len: ratios.len(), ranks });
        }
        Ok(LoadBalancer::Custom { ratios })
    }

    pub fn bounded(ranks: u32, n_max: u64) -> Result<Self, LoadBalanceError> {
        check_ranks(ranks)?;
        Ok(LoadBalancer::Bounded { ranks, n_max })
    }

    pub fn from_config(config: &LoadBalancerConfig, ranks: u32) -> Result<Self, LoadBalanceError> {
        let balancer = match config {
            LoadBalancerConfig::Uniform => Self::uniform(ranks),
            LoadBalancerConfig::HostWeighted { alpha } => Self::host_weighted(ranks, *alpha),
            LoadBalancerConfig::Custom { ratios } => Self::custom(ranks, ratios.clone()),
            LoadBalancerConfig::Bounded { n_max } => Self::bounded(ranks, *n_max),
        }?;
        debug!("Load balancer for {} ranks: {:?}", ranks, balancer);
        Ok(balancer)
    }

    pub fn rank_count(&self) -> u32 {
        match self {
            LoadBalancer::Uniform { ranks }
            | LoadBalancer::HostWeighted { ranks, .. }
            | LoadBalancer::Bounded { ranks, .. } => *ranks,
            LoadBalancer::Custom { ratios } => ratios.len() as u32,
        }
    }

    /// Fraction of `n` particles assigned to `rank`. Only the bounded policy
    /// depends on `n`. Out-of-range ranks get 0.
    pub fn ratio(&self, rank: u32, n: u64) -> f64 {
        let ranks = self.rank_count();
        if rank >= ranks {
            return 0.0;
        }
        match self {
            LoadBalancer::Uniform { .. } => 1.0 / ranks as f64,
            LoadBalancer::HostWeighted { alpha, .. } => {
                let weight = if rank == 0 { *alpha } else { 1.0 };
                weight / (alpha + (ranks - 1) as f64)
            }
            LoadBalancer::Custom { ratios } => ratios[rank as usize],
            LoadBalancer::Bounded { n_max, .. } => {
                if ranks == 1 {
                    1.0
                } else if n == 0 || *n_max > n {
                    // Infeasible cap: fall back to an even split.
                    1.0 / ranks as f64
                } else {
                    let beta = *n_max as f64 / n as f64;
                    if rank == 0 {
                        beta
                    } else {
                        (1.0 - beta) / (ranks - 1) as f64
                    }
                }
            }
        }
    }

    /// True when every ratio is a finite non-negative number and they sum to
    /// one within tolerance.
    pub fn check(&self, n: u64) -> bool {
        let ratios: Vec<f64> = (0..self.rank_count()).map(|rank| self.ratio(rank, n)).collect();
        let valid = ratios.iter().all(|r| r.is_finite() && *r >= 0.0);
        valid && (ratios.iter().sum::<f64>() - 1.0).abs() < RATIO_TOLERANCE
    }

    /// Allocation of `rank` before rank 0 absorbs the rounding remainder.
    fn floor_share(&self, rank: u32, n: u64) -> u64 {
        (self.ratio(rank, n) * n as f64).floor() as u64
    }

    /// Number of particles `rank` simulates out of `n`.
    pub fn balance(&self, rank: u32, n: u64) -> Result<u64, LoadBalanceError> {
        let ranks = self.rank_count();
        if rank >= ranks {
            return Err(LoadBalanceError::RankOutOfRange { rank, ranks });
        }
        if let LoadBalancer::Bounded { n_max, .. } = self {
            if ranks > 1 && n > 0 && *n_max <= n {
                return Ok(capped_share(rank, ranks, n, *n_max));
            }
        }
        if rank != 0 {
            return Ok(self.floor_share(rank, n));
        }
        let allocated: u64 = (0..ranks).map(|r| self.floor_share(r, n)).sum();
        if allocated > n {
            return Err(LoadBalanceError::OverAllocated { allocated, n });
        }
        Ok(self.floor_share(0, n) + (n - allocated))
    }

    /// Allocation of every rank, in rank order.
    pub fn allocations(&self, n: u64) -> Result<Vec<u64>, LoadBalanceError> {
        let shares = (0..self.rank_count())
            .map(|rank| self.balance(rank, n))
            .collect::<Result<Vec<_>, _>>()?;
        info!("Particle allocation over {} ranks: {:?}", shares.len(), shares);
        Ok(shares)
    }
}

/// Rank 0 takes `n_max`; ranks `1..=extra` take one particle more than the
/// others so nothing is lost to flooring.
fn capped_share(rank: u32, ranks: u32, n: u64, n_max: u64) -> u64 {
    if rank == 0 {
        return n_max;
    }
    let rest = n - n_max;
    let others = (ranks - 1) as u64;
    let extra = rest % others;
    rest / others + u64::from((rank as u64) <= extra)
}

fn check_ranks(ranks: u32) -> Result<(), LoadBalanceError> {
    if ranks == 0 {
        return Err(LoadBalanceError::ZeroRanks);
    }
    Ok(())
}
