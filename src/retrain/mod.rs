pub mod calibration;
pub mod controller;
pub mod drift;

pub use controller::{ControllerState, PromotionDecision, RetrainController};
pub use drift::{aggregate_drift, compute_drift, select_aggregate, AggregateDrift, DriftStat};
