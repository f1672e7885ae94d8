pub mod config;
pub mod frame;
pub mod geometry;
pub mod keyframe;
pub mod loop_closing;
pub mod registration;
pub mod system;

#[cfg(test)]
pub(crate) mod test_support;
