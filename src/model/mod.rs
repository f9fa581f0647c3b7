pub(crate) mod alignment;
pub(crate) mod encoder;
pub(crate) mod feature_extractor;
pub(crate) mod feature_projection;
pub(crate) mod layers;
pub(crate) mod pooling;
pub mod speech;
pub(crate) mod video;

pub use alignment::AlignmentModel;
pub use speech::SpeechEncoder;
