pub mod caps;
pub mod generate;
pub mod inspect;
