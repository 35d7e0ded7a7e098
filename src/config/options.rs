//! Factorization options.
//!
//! This module provides the `FactorOptions` struct, which controls how the
//! multifrontal factorization chooses a representation for every front
//! (dense, HSS, BLR, HODLR, H2, lossy or GPU-resident dense), and the
//! numeric layout parameters of distributed fronts. Options are read once
//! when the front tree is built and stay fixed for that factorization.

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;

use crate::error::MfError;

/// Compression policy for frontal matrices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionType {
    /// Dense fronts everywhere (or GPU-resident dense when enabled).
    #[default]
    None,
    /// Hierarchically semi-separable fronts.
    Hss,
    /// Block low-rank fronts.
    Blr,
    /// Hierarchically off-diagonal low-rank fronts.
    Hodlr,
    /// H2 fronts (sequential only).
    H2,
    /// HODLR for the largest fronts, BLR for the intermediate tier.
    BlrHodlr,
    /// HODLR, then BLR, then lossy compression for the smallest tier.
    ZfpBlrHodlr,
    /// Lossless compressed storage of dense fronts.
    Lossless,
    /// Lossy compressed storage of dense fronts.
    Lossy,
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompressionType::None => "none",
            CompressionType::Hss => "hss",
            CompressionType::Blr => "blr",
            CompressionType::Hodlr => "hodlr",
            CompressionType::H2 => "h2",
            CompressionType::BlrHodlr => "blr_hodlr",
            CompressionType::ZfpBlrHodlr => "zfp_blr_hodlr",
            CompressionType::Lossless => "lossless",
            CompressionType::Lossy => "lossy",
        };
        f.write_str(name)
    }
}

impl FromStr for CompressionType {
    type Err = MfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(CompressionType::None),
            "hss" => Ok(CompressionType::Hss),
            "blr" => Ok(CompressionType::Blr),
            "hodlr" => Ok(CompressionType::Hodlr),
            "h2" => Ok(CompressionType::H2),
            "blr_hodlr" => Ok(CompressionType::BlrHodlr),
            "zfp_blr_hodlr" => Ok(CompressionType::ZfpBlrHodlr),
            "lossless" => Ok(CompressionType::Lossless),
            "lossy" => Ok(CompressionType::Lossy),
            _ => Err(MfError::Unsupported("unknown compression type")),
        }
    }
}

bitflags! {
    /// Optional front kernels available in this build.
    ///
    /// HSS and BLR are always available; the others are external backends.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct Backends: u8 {
        const HODLR = 0b0001;
        const H2    = 0b0010;
        const ZFP   = 0b0100;
        const GPU   = 0b1000;
    }
}

impl Backends {
    /// Backends enabled through cargo features.
    pub fn compiled() -> Self {
        let mut b = Backends::empty();
        if cfg!(feature = "hodlr") {
            b |= Backends::HODLR;
        }
        if cfg!(feature = "h2") {
            b |= Backends::H2;
        }
        if cfg!(feature = "zfp") {
            b |= Backends::ZFP;
        }
        if cfg!(feature = "gpu") {
            b |= Backends::GPU;
        }
        b
    }
}

/// Minimum sizes for which a compressed representation is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionThresholds {
    /// Minimum separator dimension.
    pub min_sep_size: usize,
    /// Minimum front dimension (separator + update).
    pub min_front_size: usize,
}

impl CompressionThresholds {
    pub const fn new(min_sep_size: usize, min_front_size: usize) -> Self {
        Self { min_sep_size, min_front_size }
    }

    /// Cost-model predicate: is a front of this shape worth compressing?
    pub fn admits(&self, dim_sep: usize, dim_upd: usize) -> bool {
        dim_sep >= self.min_sep_size && dim_sep + dim_upd >= self.min_front_size
    }
}

/// Options of one multifrontal factorization.
#[derive(Debug, Clone)]
pub struct FactorOptions {
    /// Compression policy.
    pub compression: CompressionType,
    pub hss: CompressionThresholds,
    pub blr: CompressionThresholds,
    pub hodlr: CompressionThresholds,
    pub h2: CompressionThresholds,
    pub lossy: CompressionThresholds,
    /// Thresholds of the chained policies: tier 0 (HODLR), 1 (BLR), 2 (lossy).
    pub tiers: [CompressionThresholds; 3],
    /// Optional kernels compiled in.
    pub backends: Backends,
    /// Use GPU-resident dense fronts when no compression applies.
    pub use_gpu: bool,
    /// The global matrix is symmetric.
    pub symmetric: bool,
    /// The global matrix is positive definite.
    pub positive_definite: bool,
    /// Block size of the 2D block-cyclic layout.
    pub block_size: usize,
    /// Column panel width used when a compressed front samples its entries.
    pub leaf_size: usize,
    /// Factor two sequential sibling subtrees concurrently.
    pub parallel_subtrees: bool,
}

impl Default for FactorOptions {
    fn default() -> Self {
        let hss = CompressionThresholds::new(256, 1000);
        let blr = CompressionThresholds::new(256, 1000);
        let hodlr = CompressionThresholds::new(5000, 10000);
        let lossy = CompressionThresholds::new(8, 16);
        Self {
            compression: CompressionType::None,
            hss,
            blr,
            hodlr,
            h2: hodlr,
            lossy,
            tiers: [hodlr, blr, lossy],
            backends: Backends::compiled(),
            use_gpu: false,
            symmetric: false,
            positive_definite: false,
            block_size: 32,
            leaf_size: 128,
            parallel_subtrees: true,
        }
    }
}

impl FactorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_backends(mut self, backends: Backends) -> Self {
        self.backends = backends;
        self
    }

    pub fn with_gpu(mut self, use_gpu: bool) -> Self {
        self.use_gpu = use_gpu;
        self
    }

    /// Declare symmetry and definiteness of the global matrix.
    pub fn with_spd(mut self, symmetric: bool, positive_definite: bool) -> Self {
        self.symmetric = symmetric;
        self.positive_definite = positive_definite;
        self
    }

    /// Set the same thresholds for every compressed kind and tier.
    pub fn with_thresholds(mut self, t: CompressionThresholds) -> Self {
        self.hss = t;
        self.blr = t;
        self.hodlr = t;
        self.h2 = t;
        self.lossy = t;
        self.tiers = [t; 3];
        self
    }

    pub fn with_block_size(mut self, nb: usize) -> Self {
        self.block_size = nb.max(1);
        self
    }

    pub fn with_leaf_size(mut self, leaf: usize) -> Self {
        self.leaf_size = leaf.max(1);
        self
    }

    pub fn with_parallel_subtrees(mut self, on: bool) -> Self {
        self.parallel_subtrees = on;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compression_names_round_trip() {
        for c in [
            CompressionType::None,
            CompressionType::Hss,
            CompressionType::Blr,
            CompressionType::Hodlr,
            CompressionType::H2,
            CompressionType::BlrHodlr,
            CompressionType::ZfpBlrHodlr,
            CompressionType::Lossless,
            CompressionType::Lossy,
        ] {
            assert_eq!(c.to_string().parse::<CompressionType>().unwrap(), c);
        }
        assert!("hmatrix".parse::<CompressionType>().is_err());
    }

    #[test]
    fn thresholds_need_both_sizes() {
        let t = CompressionThresholds::new(10, 30);
        assert!(t.admits(10, 20));
        assert!(!t.admits(9, 100));
        assert!(!t.admits(10, 19));
    }
}
