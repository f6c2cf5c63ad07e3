pub mod error;
pub mod model;
pub mod output;
pub mod solver;
pub mod sparse;
pub mod stats;
