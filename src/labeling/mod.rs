pub mod auto_labeler;
pub mod bottom;

pub use auto_labeler::AutoLabelerService;
