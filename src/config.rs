use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// 评测配置（取代 notebook 中的全局常量，构造各组件时显式传入）
#[derive(Debug, Clone)]
pub struct EvalConfig {
    /// 本地缓存根目录
    pub storage_root: PathBuf,
    /// 视频子目录名，帧目录为 `{video_folder}_frames`
    pub video_folder: String,
    /// 送入模型的最大帧数
    pub max_frames: usize,
    /// 场景检测阈值（HSV 内容差异，0-255 量纲）
    pub detection_threshold: f64,
    /// 最短场景长度（帧）
    pub min_scene_len: usize,
    /// 检测前的降采样倍数，0 表示自动
    pub downscale_factor: u32,
    /// 场景帧目录末尾丢弃的帧数
    pub trailing_trim: usize,
    /// 生成的最大 token 数
    pub max_generated_tokens: usize,
    /// 推理服务地址
    pub model_endpoint: Option<String>,
    /// 推理请求超时（秒）
    pub model_timeout_secs: u64,
    /// 数据集文件（JSON / JSONL）
    pub dataset_path: Option<PathBuf>,
    /// 结果输出目录
    pub results_dir: PathBuf,
    /// 日志级别（trace, debug, info, warn, error）
    pub log_level: String,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("./data"),
            video_folder: "videos".to_string(),
            max_frames: 8,
            detection_threshold: 30.0,
            min_scene_len: 15,
            downscale_factor: 0,
            trailing_trim: 2,
            max_generated_tokens: 16,
            model_endpoint: None,
            model_timeout_secs: 300,
            dataset_path: None,
            results_dir: PathBuf::from("./results"),
            log_level: "info".to_string(),
        }
    }
}

impl EvalConfig {
    /// 视频缓存目录 `{root}/{video_folder}`
    pub fn video_dir(&self) -> PathBuf {
        self.storage_root.join(&self.video_folder)
    }

    /// 帧缓存目录 `{root}/{video_folder}_frames`
    pub fn frames_root(&self) -> PathBuf {
        self.storage_root.join(format!("{}_frames", self.video_folder))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_frames == 0 {
            anyhow::bail!("max_frames 必须大于 0");
        }
        if !(self.detection_threshold >= 0.0) {
            anyhow::bail!("detection_threshold 必须为非负数: {}", self.detection_threshold);
        }
        if self.max_generated_tokens == 0 {
            anyhow::bail!("max_generated_tokens 必须大于 0");
        }
        if self.video_folder.is_empty() {
            anyhow::bail!("video_folder 不能为空");
        }
        Ok(())
    }
}

/// 命令行覆盖项，未设置的字段交给环境变量 / 配置文件 / 默认值
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub storage_root: Option<PathBuf>,
    pub max_frames: Option<usize>,
    pub detection_threshold: Option<f64>,
    pub max_generated_tokens: Option<usize>,
    pub model_endpoint: Option<String>,
    pub dataset_path: Option<PathBuf>,
    pub results_dir: Option<PathBuf>,
}

/// 配置文件中读到的原始值（全部可选）
#[derive(Debug, Clone, Default, PartialEq)]
struct PartialConfig {
    storage_root: Option<PathBuf>,
    video_folder: Option<String>,
    max_frames: Option<usize>,
    detection_threshold: Option<f64>,
    min_scene_len: Option<usize>,
    downscale_factor: Option<u32>,
    trailing_trim: Option<usize>,
    max_generated_tokens: Option<usize>,
    model_endpoint: Option<String>,
    model_timeout_secs: Option<u64>,
    dataset_path: Option<PathBuf>,
    results_dir: Option<PathBuf>,
    log_level: Option<String>,
}

impl PartialConfig {
    /// `self` 优先，缺失的字段从 `lower` 补齐
    fn or(self, lower: PartialConfig) -> PartialConfig {
        PartialConfig {
            storage_root: self.storage_root.or(lower.storage_root),
            video_folder: self.video_folder.or(lower.video_folder),
            max_frames: self.max_frames.or(lower.max_frames),
            detection_threshold: self.detection_threshold.or(lower.detection_threshold),
            min_scene_len: self.min_scene_len.or(lower.min_scene_len),
            downscale_factor: self.downscale_factor.or(lower.downscale_factor),
            trailing_trim: self.trailing_trim.or(lower.trailing_trim),
            max_generated_tokens: self.max_generated_tokens.or(lower.max_generated_tokens),
            model_endpoint: self.model_endpoint.or(lower.model_endpoint),
            model_timeout_secs: self.model_timeout_secs.or(lower.model_timeout_secs),
            dataset_path: self.dataset_path.or(lower.dataset_path),
            results_dir: self.results_dir.or(lower.results_dir),
            log_level: self.log_level.or(lower.log_level),
        }
    }

    fn into_config(self) -> EvalConfig {
        let d = EvalConfig::default();
        EvalConfig {
            storage_root: self.storage_root.unwrap_or(d.storage_root),
            video_folder: self.video_folder.unwrap_or(d.video_folder),
            max_frames: self.max_frames.unwrap_or(d.max_frames),
            detection_threshold: self.detection_threshold.unwrap_or(d.detection_threshold),
            min_scene_len: self.min_scene_len.unwrap_or(d.min_scene_len),
            downscale_factor: self.downscale_factor.unwrap_or(d.downscale_factor),
            trailing_trim: self.trailing_trim.unwrap_or(d.trailing_trim),
            max_generated_tokens: self.max_generated_tokens.unwrap_or(d.max_generated_tokens),
            model_endpoint: self.model_endpoint,
            model_timeout_secs: self.model_timeout_secs.unwrap_or(d.model_timeout_secs),
            dataset_path: self.dataset_path,
            results_dir: self.results_dir.unwrap_or(d.results_dir),
            log_level: self.log_level.unwrap_or(d.log_level),
        }
    }
}

impl From<ConfigOverrides> for PartialConfig {
    fn from(o: ConfigOverrides) -> Self {
        PartialConfig {
            storage_root: o.storage_root,
            max_frames: o.max_frames,
            detection_threshold: o.detection_threshold,
            max_generated_tokens: o.max_generated_tokens,
            model_endpoint: o.model_endpoint,
            dataset_path: o.dataset_path,
            results_dir: o.results_dir,
            ..Default::default()
        }
    }
}

/// 配置加载器
pub struct ConfigLoader;

/// 读取并解析一个环境变量，缺失或格式不对都视为未设置
fn parse_env<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

impl ConfigLoader {
    /// 从多个源加载配置，优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    pub fn load_config(config_file: Option<&Path>, overrides: ConfigOverrides) -> Result<EvalConfig> {
        // 1. 配置文件：显式指定的必须能读，默认位置找不到就算了
        let file_config = match config_file {
            Some(path) => Self::load_from_file(path)?,
            None => Self::load_from_default_locations().unwrap_or_default(),
        };

        // 2. 环境变量
        let env_config = Self::load_from_env(|key| env::var(key).ok());

        // 3. 合并
        let config = PartialConfig::from(overrides)
            .or(env_config)
            .or(file_config)
            .into_config();
        config.validate()?;
        Ok(config)
    }

    /// 从环境变量加载配置（`lookup` 便于测试时注入）
    fn load_from_env(lookup: impl Fn(&str) -> Option<String>) -> PartialConfig {
        PartialConfig {
            storage_root: lookup("VIDEO_QA_STORAGE_ROOT").map(PathBuf::from),
            video_folder: lookup("VIDEO_QA_VIDEO_FOLDER"),
            max_frames: parse_env(&lookup, "VIDEO_QA_MAX_FRAMES"),
            detection_threshold: parse_env(&lookup, "VIDEO_QA_THRESHOLD"),
            min_scene_len: parse_env(&lookup, "VIDEO_QA_MIN_SCENE_LEN"),
            downscale_factor: parse_env(&lookup, "VIDEO_QA_DOWNSCALE"),
            trailing_trim: parse_env(&lookup, "VIDEO_QA_TRAILING_TRIM"),
            max_generated_tokens: parse_env(&lookup, "VIDEO_QA_MAX_NEW_TOKENS"),
            model_endpoint: lookup("VIDEO_QA_MODEL_ENDPOINT").filter(|v| !v.is_empty()),
            model_timeout_secs: parse_env(&lookup, "VIDEO_QA_MODEL_TIMEOUT"),
            dataset_path: lookup("VIDEO_QA_DATASET").map(PathBuf::from),
            results_dir: lookup("VIDEO_QA_RESULTS_DIR").map(PathBuf::from),
            log_level: lookup("LOG_LEVEL"),
        }
    }

    /// 从INI配置文件加载配置
    fn load_from_file(config_path: &Path) -> Result<PartialConfig> {
        if !config_path.exists() {
            return Err(anyhow::anyhow!("配置文件不存在: {}", config_path.display()));
        }

        let mut ini = configparser::ini::Ini::new();
        ini.load(config_path)
            .map_err(|e| anyhow::anyhow!("读取配置文件失败: {}: {}", config_path.display(), e))?;

        // 先找指定节，再退回 [DEFAULT]
        let get = |section: &str, key: &str| {
            ini.get(section, key)
                .or_else(|| ini.get("DEFAULT", key))
                .filter(|v| !v.is_empty())
        };
        let parse_num = |section: &str, key: &str| -> Result<Option<f64>> {
            get(section, key)
                .map(|v| v.parse::<f64>().with_context(|| format!("配置项 {}.{} 不是数字: {}", section, key, v)))
                .transpose()
        };
        let parse_int = |section: &str, key: &str| -> Result<Option<u64>> {
            get(section, key)
                .map(|v| v.parse::<u64>().with_context(|| format!("配置项 {}.{} 不是整数: {}", section, key, v)))
                .transpose()
        };

        Ok(PartialConfig {
            storage_root: get("video_qa", "storage_root").map(PathBuf::from),
            video_folder: get("video_qa", "video_folder"),
            max_frames: parse_int("video_qa", "max_frames")?.map(|v| v as usize),
            detection_threshold: parse_num("video_qa", "detection_threshold")?,
            min_scene_len: parse_int("video_qa", "min_scene_len")?.map(|v| v as usize),
            downscale_factor: parse_int("video_qa", "downscale_factor")?.map(|v| v as u32),
            trailing_trim: parse_int("video_qa", "trailing_trim")?.map(|v| v as usize),
            max_generated_tokens: parse_int("model", "max_generated_tokens")?.map(|v| v as usize),
            model_endpoint: get("model", "endpoint"),
            model_timeout_secs: parse_int("model", "timeout_secs")?,
            dataset_path: get("video_qa", "dataset_path").map(PathBuf::from),
            results_dir: get("video_qa", "results_dir").map(PathBuf::from),
            log_level: ini.get("logging", "level").or_else(|| ini.get("DEFAULT", "log_level")),
        })
    }

    /// 从默认位置加载配置文件
    fn load_from_default_locations() -> Result<PartialConfig> {
        let mut candidates = vec![PathBuf::from("video-qa.ini"), PathBuf::from(".video-qa.ini")];
        if let Some(home) = env::var_os("HOME") {
            candidates.push(PathBuf::from(home).join(".video-qa.ini"));
        }
        candidates.push(PathBuf::from("/etc/video-qa.ini"));

        for candidate in candidates {
            if candidate.exists() {
                return Self::load_from_file(&candidate);
            }
        }
        Err(anyhow::anyhow!("未找到配置文件"))
    }

    /// 创建默认配置文件
    pub fn create_default_config(config_path: &Path) -> Result<()> {
        let d = EvalConfig::default();
        let mut ini = configparser::ini::Ini::new();
        ini.set("video_qa", "storage_root", Some(d.storage_root.to_string_lossy().to_string()));
        ini.set("video_qa", "video_folder", Some(d.video_folder));
        ini.set("video_qa", "max_frames", Some(d.max_frames.to_string()));
        ini.set("video_qa", "detection_threshold", Some(format!("{:.1}", d.detection_threshold)));
        ini.set("video_qa", "min_scene_len", Some(d.min_scene_len.to_string()));
        ini.set("video_qa", "downscale_factor", Some(d.downscale_factor.to_string()));
        ini.set("video_qa", "trailing_trim", Some(d.trailing_trim.to_string()));
        ini.set("video_qa", "dataset_path", Some("".to_string()));
        ini.set("video_qa", "results_dir", Some(d.results_dir.to_string_lossy().to_string()));
        ini.set("model", "endpoint", Some("".to_string()));
        ini.set("model", "max_generated_tokens", Some(d.max_generated_tokens.to_string()));
        ini.set("model", "timeout_secs", Some(d.model_timeout_secs.to_string()));
        ini.set("logging", "level", Some(d.log_level));

        ini.write(config_path)
            .map_err(|e| anyhow::anyhow!("写入配置文件失败: {}: {}", config_path.display(), e))?;

        Ok(())
    }
}
