pub mod frequency;
pub mod ids;
pub mod mode;

pub use frequency::*;
pub use ids::*;
pub use mode::*;
