// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Execution-environment probe.
//!
//! Run once at startup, before any device is touched. The probe answers two
//! questions that govern everything the DMA path is allowed to do: may the
//! driver hand physical addresses to a bus master at all, and what cache
//! maintenance must bracket each transfer. The answers are folded into a
//! [`PlatformProfile`] that is passed by value into device bring-up and never
//! changes afterwards.
//!
//! The raw environment signals come through the [`PlatformProbe`] trait so
//! that hosted tests can exercise every row of the policy table. On any
//! ambiguity -- most importantly a CPU the tier tests cannot classify -- the
//! probe falls back to the conservative answer: no DMA, no cache games.

use dmapool::{CachePolicy, DmaPolicy};

/// CPU tiers, as distinguished by the flag-probing tests (or the feature
/// identification instruction where present). Only cache behavior matters
/// here.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CpuTier {
    /// No cache at all.
    NoCache,
    /// Cached, but no usable flush instruction; DMA is coherent and a fence
    /// suffices for ordering.
    CachedNoFlush,
    /// Only a coarse whole-cache write-back-and-invalidate is available.
    CoarseFlush,
    /// Per-line flush and invalidate are available.
    LineFlush,
}

/// Raw environment signals, separated from policy so the mapping is a pure
/// function.
pub trait PlatformProbe {
    /// Whether the CPU is executing with the virtualization-mode flag set
    /// (some memory manager is remapping addresses under us).
    fn virtualization_active(&self) -> bool;
    /// Whether a virtual-DMA translation service answered its discovery
    /// call.
    fn translation_service_present(&self) -> bool;
    /// CPU tier, or `None` if the probing sequence could not classify it.
    fn cpu_tier(&self) -> Option<CpuTier>;
}

/// The fixed result of the probe.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PlatformProfile {
    pub cpu: CpuTier,
    pub dma: DmaPolicy,
    pub cache: CachePolicy,
}

impl PlatformProfile {
    /// Profile for environments where DMA must not happen; also the fallback
    /// for anything the probe cannot classify.
    pub const NO_DMA: Self = Self {
        cpu: CpuTier::NoCache,
        dma: DmaPolicy::Forbidden,
        cache: CachePolicy::None,
    };
}

/// Maps a CPU tier to the cache action required around DMA transfers.
fn cache_policy_for(cpu: CpuTier) -> CachePolicy {
    match cpu {
        CpuTier::NoCache => CachePolicy::None,
        CpuTier::CachedNoFlush => CachePolicy::SoftwareBarrier,
        CpuTier::CoarseFlush => CachePolicy::FullWritebackInvalidate,
        CpuTier::LineFlush => CachePolicy::LineFlush,
    }
}

/// Runs the probe. Cannot fail: every unclassifiable input maps to
/// [`PlatformProfile::NO_DMA`].
pub fn probe(p: &impl PlatformProbe) -> PlatformProfile {
    let Some(cpu) = p.cpu_tier() else {
        return PlatformProfile::NO_DMA;
    };

    let virtualized = p.virtualization_active();
    let service = p.translation_service_present();

    let dma = match (virtualized, service) {
        (false, false) => DmaPolicy::Direct,
        (false, true) | (true, true) => DmaPolicy::TranslateViaService,
        // Addresses are virtualized and nothing can translate them for the
        // device: physical programming would scribble on someone else.
        (true, false) => DmaPolicy::Forbidden,
    };

    let cache = if dma == DmaPolicy::Forbidden {
        CachePolicy::None
    } else {
        cache_policy_for(cpu)
    };

    PlatformProfile { cpu, dma, cache }
}
