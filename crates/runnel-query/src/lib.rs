mod collation;
mod eval;
mod expression;
mod parse_filter;

pub use collation::Collation;
pub use eval::{lookup_path, matches, matches_with, values_equal};
pub use expression::Expression;
pub use parse_filter::{FilterParseError, parse_filter};
