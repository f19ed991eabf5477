//! Pose registration: rigid alignment, frame-to-window estimation and
//! drift correction.

pub mod alignment;
pub mod correspondence;
pub mod drift;

pub use alignment::{rms_error, AlignmentError, KabschAligner, RigidAligner};
pub use correspondence::{
    CorrespondenceEstimator, EstimationError, IdentityEstimator, PlacedFrame, TrackMatchEstimator,
};
pub use drift::{DriftCorrection, DriftCorrector, DriftError};
