//! Concrete file formats shipped with the crate.

pub mod sarc;

pub use sarc::Sarc;
