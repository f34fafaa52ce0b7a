mod backpressure;
mod state;
mod triggers;

pub use self::backpressure::{BackpressureController, ModeCell, Thresholds};
pub use self::state::{StateManager, StateParams, TickTransitions};
pub use self::triggers::{FieldId, RuleSet, TriggerEvaluator, TriggerFire};
