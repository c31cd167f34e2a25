//! Type-specific value handling: normalization, precision widening and
//! match predicates over indexed metadata values.

pub mod date;
pub mod number;
pub mod reference;
pub mod string;
pub mod token;
pub mod uri;
