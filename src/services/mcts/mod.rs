//! Adaptive search engine
//!
//! Monte-Carlo Tree Search with PUCT priors over the transform library.
//! Each step applies one focused transform through the applicator,
//! validates the result against the engine, and backpropagates the reward.

pub mod node;
pub mod priors;
pub mod ranker;
pub mod reward;
pub mod tree;

pub use node::{MctsNode, NodeArena, NodeId};
pub use priors::{PriorConfig, compute_contextual_priors, compute_weight_priors, ranking_to_priors};
pub use ranker::{AttemptSummary, rank_transforms, should_use_llm_ranking};
pub use reward::{RewardConfig, compute_reward};
pub use tree::{SearchOptions, SearchOutcome, SearchTree, TransformAttempt};
