pub mod levels;
pub mod orders;
