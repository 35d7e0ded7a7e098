//! Choice of front representation.
//!
//! Selection depends only on the front dimensions and the options, so every
//! rank of a grid picks the same kind without communicating. Dense is the
//! unconditional fallback: it is what a front becomes whenever a compressed
//! or GPU kernel is not compiled in or not worth it.

use crate::config::{Backends, CompressionType, FactorOptions};

use super::FrontKind;

/// Compressed kind for the policy, if any applies. `distributed` restricts
/// the chain to kinds with a grid-resident implementation.
fn compressed(dim_sep: usize, dim_upd: usize, opts: &FactorOptions, distributed: bool) -> Option<FrontKind> {
    let backends = opts.backends;
    let hodlr = |tier: Option<usize>| {
        let t = tier.map_or(opts.hodlr, |k| opts.tiers[k]);
        (backends.contains(Backends::HODLR) && t.admits(dim_sep, dim_upd)).then_some(FrontKind::Hodlr)
    };
    let blr = |tier: Option<usize>| {
        let t = tier.map_or(opts.blr, |k| opts.tiers[k]);
        t.admits(dim_sep, dim_upd).then_some(FrontKind::Blr)
    };
    let lossy = |tier: Option<usize>| {
        let t = tier.map_or(opts.lossy, |k| opts.tiers[k]);
        (!distributed && backends.contains(Backends::ZFP) && t.admits(dim_sep, dim_upd))
            .then_some(FrontKind::Lossy)
    };
    match opts.compression {
        CompressionType::None => None,
        CompressionType::Hss => opts.hss.admits(dim_sep, dim_upd).then_some(FrontKind::Hss),
        CompressionType::Blr => blr(None),
        CompressionType::Hodlr => hodlr(None),
        CompressionType::H2 => (!distributed
            && backends.contains(Backends::H2)
            && opts.h2.admits(dim_sep, dim_upd))
        .then_some(FrontKind::H2),
        CompressionType::BlrHodlr => hodlr(Some(0)).or_else(|| blr(Some(1))),
        CompressionType::ZfpBlrHodlr => hodlr(Some(0))
            .or_else(|| blr(Some(1)))
            .or_else(|| lossy(Some(2))),
        CompressionType::Lossless | CompressionType::Lossy => lossy(None),
    }
}

/// Representation of a single-rank front.
pub fn select(dim_sep: usize, dim_upd: usize, opts: &FactorOptions) -> FrontKind {
    if let Some(kind) = compressed(dim_sep, dim_upd, opts, false) {
        return kind;
    }
    if opts.use_gpu && opts.backends.contains(Backends::GPU) {
        return if opts.symmetric && opts.positive_definite {
            FrontKind::GpuSpd
        } else {
            FrontKind::Gpu
        };
    }
    FrontKind::Dense
}

/// Representation of a grid-resident front. H2, lossy and GPU fronts only
/// exist on a single rank; distributed fronts fall back to dense instead.
pub fn select_distributed(dim_sep: usize, dim_upd: usize, opts: &FactorOptions) -> FrontKind {
    compressed(dim_sep, dim_upd, opts, true).unwrap_or(FrontKind::Dense)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompressionThresholds;

    fn opts(c: CompressionType, backends: Backends) -> FactorOptions {
        FactorOptions::new()
            .with_compression(c)
            .with_backends(backends)
            .with_thresholds(CompressionThresholds::new(10, 20))
    }

    #[test]
    fn dense_when_nothing_applies() {
        let o = opts(CompressionType::None, Backends::all());
        assert_eq!(select(100, 100, &o), FrontKind::Dense);
        let o = opts(CompressionType::Hodlr, Backends::empty());
        assert_eq!(select(100, 100, &o), FrontKind::Dense);
        let o = opts(CompressionType::Blr, Backends::empty());
        assert_eq!(select(9, 100, &o), FrontKind::Dense);
        assert_eq!(select(10, 10, &o), FrontKind::Blr);
    }

    #[test]
    fn selection_is_deterministic() {
        let o = opts(CompressionType::ZfpBlrHodlr, Backends::ZFP);
        for ds in 0..40 {
            for du in 0..40 {
                assert_eq!(select(ds, du, &o), select(ds, du, &o));
            }
        }
    }

    #[test]
    fn chained_policies_use_their_tiers() {
        let mut o = opts(CompressionType::ZfpBlrHodlr, Backends::HODLR | Backends::ZFP);
        o.tiers = [
            CompressionThresholds::new(100, 100),
            CompressionThresholds::new(50, 50),
            CompressionThresholds::new(5, 5),
        ];
        assert_eq!(select(200, 0, &o), FrontKind::Hodlr);
        assert_eq!(select(60, 0, &o), FrontKind::Blr);
        assert_eq!(select(6, 0, &o), FrontKind::Lossy);
        assert_eq!(select(4, 0, &o), FrontKind::Dense);
        assert_eq!(select_distributed(6, 0, &o), FrontKind::Dense);
        o.compression = CompressionType::BlrHodlr;
        o.backends = Backends::empty();
        assert_eq!(select(200, 0, &o), FrontKind::Blr);
    }

    #[test]
    fn gpu_variants() {
        let o = opts(CompressionType::None, Backends::GPU).with_gpu(true);
        assert_eq!(select(5, 5, &o), FrontKind::Gpu);
        let o = o.with_spd(true, true);
        assert_eq!(select(5, 5, &o), FrontKind::GpuSpd);
        assert_eq!(select_distributed(5, 5, &o), FrontKind::Dense);
        let o = o.with_backends(Backends::empty());
        assert_eq!(select(5, 5, &o), FrontKind::Dense);
    }

    #[test]
    fn distributed_chain_drops_h2_and_lossy() {
        let o = opts(CompressionType::H2, Backends::all());
        assert_eq!(select(50, 50, &o), FrontKind::H2);
        assert_eq!(select_distributed(50, 50, &o), FrontKind::Dense);
        let o = opts(CompressionType::Lossy, Backends::all());
        assert_eq!(select(50, 50, &o), FrontKind::Lossy);
        assert_eq!(select_distributed(50, 50, &o), FrontKind::Dense);
        let o = opts(CompressionType::Hss, Backends::empty());
        assert_eq!(select_distributed(50, 50, &o), FrontKind::Hss);
    }
}
