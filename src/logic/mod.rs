pub mod builder;
pub mod calculations;
pub mod expression;
pub mod hub;
pub mod model;
pub mod output_model;
pub mod outputs;
pub mod recurrence;
pub mod rules;

pub use builder::{Built, RuleGraphBuilder, RuleRegistry};
pub use hub::{ErrorPolicy, RuleHub};
pub use model::RiskModel;
pub use output_model::{ModelResults, ModelState, OutputModel};
pub use outputs::OutputRule;
pub use rules::AgroRule;
