pub mod mode;
pub mod transition;
