pub(crate) mod async_state;
pub(crate) mod buffer;
pub mod call;
pub(crate) mod frame;
pub(crate) mod iterate;
pub(crate) mod lookup;
pub(crate) mod resolve;
pub(crate) mod sequence;

use crate::error::PoisonError;
use crate::value::Value;

/// Every runtime evaluation is a value or a poison bundle.
pub(crate) type EvalResult = Result<Value, PoisonError>;
