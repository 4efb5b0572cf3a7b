pub mod batch;
pub mod detect;
