//! Policy evaluation.
//!
//! Rules are explicit records (`class`, `predicate`, `effect`) interpreted by
//! a fixed evaluator. Classes compose in precedence order:
//!
//! 1. connection admission
//! 2. broadcast visibility (reads)
//! 3. change permission (session writes)
//! 4. scope regulation (remote queries)
//!
//! A later matching rule can narrow a decision but never widen it.
//!
//! # Example
//!
//! ```ignore
//! let config = PolicyConfig::new()
//!     .always_allow_connection()
//!     .regulate_all_broadcasts_send_all()
//!     .allow_change([ChangeOp::Create, ChangeOp::Update, ChangeOp::Destroy]);
//! let evaluator = PolicyEvaluator::new(&config)?;
//! assert_eq!(evaluator.admit(&identity), Decision::AllowFull);
//! ```

mod evaluator;
mod rules;

pub use evaluator::{CompiledPolicy, PolicyEvaluator};
pub use rules::{Decision, Operation, PolicyConfig, PolicyContext, Predicate, Rule, RuleClass};
