pub mod gold;
pub mod knowledge;
pub mod result;
pub mod transform;
pub mod validation;

pub use gold::{ExampleBody, ExampleClass, ExampleOutput, GoldExample, RewriteSet};
pub use knowledge::{
    AttemptStatus, BlackboardEntry, GlobalKnowledge, KnowledgeAntiPattern, KnowledgePrinciple,
};
pub use result::{Leaderboard, LeaderboardEntry, Provenance, QueryResult, WorkerAttempt};
pub use transform::{Opportunity, Transform, TransformCategory};
pub use validation::{ValidationResult, ValidationStatus};
