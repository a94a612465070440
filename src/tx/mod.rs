//! Transaction Module
//!
//! Coin selection and transaction building. Signing lives in `signing`.

pub mod builder;
pub mod coin_selection;

pub use builder::{
    burn_script, plan_transaction, prepare_plan, resolve_outputs, Burn, ChangeOutput, Payment, SpendFrom,
    TransactionPlan,
};
pub use coin_selection::{order_candidates, select_first_fit};
