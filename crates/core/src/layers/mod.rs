pub mod attention;
pub mod block;
pub mod mask;
pub mod mlp;
pub mod position;

pub use attention::{packed_attention, AttentionMetadata};
pub use block::{DecoderBlock, Gpt2Block};
pub use mask::causal_mask;
pub use mlp::GptMlp;
pub use position::{LearnedPositions, PositionEmbedding};
