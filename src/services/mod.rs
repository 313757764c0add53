pub mod background;
pub mod book;
pub mod clarifier;
pub mod classifier;
pub mod cleaner;
pub mod context;
pub mod correction;
pub mod editor;
pub mod gender;
pub mod llm;
pub mod questions;
pub mod stt;
pub mod timeline;
pub mod workflow;

#[cfg(test)]
pub mod testing;
