pub mod gemini;
pub mod predict;

pub use gemini::{GeminiConfig, GeminiLabeler};
pub use predict::{PredictConfig, PredictLabeler};
