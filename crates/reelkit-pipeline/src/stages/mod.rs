//! Pipeline stages.
//!
//! Each stage consumes one context key and produces the next one in the
//! closed vocabulary (see [`crate::context::keys`]).

pub mod align;
pub mod concat;
pub mod download;
pub mod image_auto;
pub mod render;
pub mod upload;
pub mod validate;

pub use align::AlignTextStage;
pub use concat::ConcatenateStage;
pub use download::DownloadStage;
pub use image_auto::ImageAutoStage;
pub use render::RenderSegmentsStage;
pub use upload::UploadStage;
pub use validate::ValidateStage;
