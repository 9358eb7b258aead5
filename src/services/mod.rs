pub mod recommendation;
pub mod training;

pub use recommendation::RecommendationService;
pub use training::TrainingService;
