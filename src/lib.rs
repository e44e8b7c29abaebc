pub mod config;
pub mod dataset;
pub mod acquirer;
pub mod video_processor;
pub mod scene_detector;
pub mod metadata;
pub mod sampler;
pub mod selector;
pub mod prompt;
pub mod model;
pub mod scoring;
pub mod evaluator;
pub mod montage;

pub use config::{ConfigLoader, ConfigOverrides, EvalConfig};
pub use dataset::{load_dataset, pick_index, EvaluationItem, VideoReference};
pub use acquirer::{ensure_local_video, AcquireOutcome, Downloader, VideoAcquirer, YtDlpDownloader};
pub use video_processor::{VideoInfo, VideoProcessor};
pub use scene_detector::{detect_scenes, Scene, SceneDetector};
pub use metadata::{FrameOrigin, FrameSetMetadata};
pub use sampler::{uniform_indices, FrameSet, SceneSampler};
pub use selector::select_frames;
pub use prompt::{build_prompt, format_question_and_options, PromptTemplate};
pub use model::{run_inference, HttpVideoModel, VideoLanguageModel};
pub use scoring::{parse_answer, score, summarize, AnswerStatus, CategoryTally, EvaluationReport, GeneratedAnswer};
pub use evaluator::{Evaluator, ResultsWriter};
