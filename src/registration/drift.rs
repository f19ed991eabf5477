//! Cycle-end drift correction.
//!
//! Aligns the vision camera positions of every frame placed so far onto the
//! reported positions and applies the resulting rigid transform to the
//! vision chain and the accumulated cloud together.

use thiserror::Error;

use super::alignment::{rms_error, AlignmentError, KabschAligner, RigidAligner};
use crate::chain::{ChainError, TransformChain};
use crate::core::SE3;
use crate::fusion::FusionEngine;

#[derive(Debug, Error)]
pub enum DriftError {
    #[error("vision chain has {vision} positions but reported chain has {reported}")]
    CardinalityMismatch { vision: usize, reported: usize },
    #[error("drift alignment failed: {0}")]
    Alignment(#[from] AlignmentError),
    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// Outcome of one correction pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftCorrection {
    /// Transform actually applied (identity when rejected).
    pub transform: SE3,
    pub rms_before: f64,
    pub rms_after: f64,
    /// The fitted transform would have increased the position error.
    pub rejected: bool,
}

pub struct DriftCorrector {
    aligner: Box<dyn RigidAligner>,
    reject_worsening: bool,
}

impl Default for DriftCorrector {
    fn default() -> Self {
        Self::new(Box::new(KabschAligner::new()))
    }
}

impl DriftCorrector {
    pub fn new(aligner: Box<dyn RigidAligner>) -> Self {
        Self {
            aligner,
            reject_worsening: true,
        }
    }

    pub fn with_reject_worsening(mut self, reject: bool) -> Self {
        self.reject_worsening = reject;
        self
    }

    /// Fit the correction over frames `[0, upto_index]` without applying it.
    pub fn estimate(&self, chain: &TransformChain, upto_index: usize) -> Result<DriftCorrection, DriftError> {
        let vision = chain.vision_positions();
        let reported = chain.reported_positions();
        if vision.len() <= upto_index || reported.len() <= upto_index {
            return Err(DriftError::CardinalityMismatch {
                vision: vision.len(),
                reported: reported.len(),
            });
        }
        let source = &vision[..=upto_index];
        let target = &reported[..=upto_index];

        let fitted = self.aligner.align(source, target)?;
        let rms_before = rms_error(&SE3::identity(), source, target);
        let rms_after = rms_error(&fitted, source, target);

        if self.reject_worsening && rms_after > rms_before {
            log::warn!(
                "drift correction rejected: rms {:.4} -> {:.4} over {} frames",
                rms_before,
                rms_after,
                source.len()
            );
            return Ok(DriftCorrection {
                transform: SE3::identity(),
                rms_before,
                rms_after: rms_before,
                rejected: true,
            });
        }

        Ok(DriftCorrection {
            transform: fitted,
            rms_before,
            rms_after,
            rejected: false,
        })
    }

    /// Fit and apply the correction to the chain and the engine's
    /// accumulated cloud. On error neither is modified.
    pub fn correct(
        &self,
        chain: &mut TransformChain,
        engine: &mut FusionEngine,
        upto_index: usize,
    ) -> Result<DriftCorrection, DriftError> {
        let correction = self.estimate(chain, upto_index)?;
        chain.apply_correction(correction.transform, upto_index)?;
        engine.apply_correction(&correction.transform);
        log::debug!(
            "drift correction up to frame {}: rms {:.4} -> {:.4}",
            upto_index,
            correction.rms_before,
            correction.rms_after
        );
        Ok(correction)
    }
}
