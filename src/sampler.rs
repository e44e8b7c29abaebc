use anyhow::{Context, Result};
use image::DynamicImage;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::EvalConfig;
use crate::metadata::{FrameOrigin, FrameSetMetadata};
use crate::scene_detector::SceneDetector;
use crate::selector::trim_trailing;
use crate::video_processor::{VideoInfo, VideoProcessor};

/// 一个视频抽取出的有序帧集合
#[derive(Debug, Clone)]
pub struct FrameSet {
    pub dir: PathBuf,
    pub metadata: FrameSetMetadata,
}

impl FrameSet {
    pub fn origin(&self) -> FrameOrigin {
        self.metadata.origin
    }

    /// 可用帧的完整路径，按抽取顺序
    pub fn frame_paths(&self) -> Vec<PathBuf> {
        self.metadata.frame_paths(&self.dir)
    }

    pub fn len(&self) -> usize {
        self.metadata.frame_files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.frame_files.is_empty()
    }
}

/// 均匀采样的帧号：在 `[0, total_frames - 1]` 上取 `requested + 2` 个等距点（向下取整）
pub fn uniform_indices(total_frames: usize, requested: usize) -> Vec<usize> {
    if total_frames == 0 {
        return Vec::new();
    }
    let points = requested + 2;
    let last = (total_frames - 1) as f64;
    (0..points)
        .map(|i| (i as f64 * last / (points - 1) as f64) as usize)
        .collect()
}

/// 把解码结果展开回每个采样位置；帧数少于采样点时同一帧会出现多次
///
/// `decoded` 按帧号升序。未解码到的采样位置被跳过。
fn expand_samples<'a, T>(indices: &[usize], decoded: &'a [(usize, T)]) -> Vec<(usize, &'a T)> {
    indices
        .iter()
        .filter_map(|&index| {
            decoded
                .binary_search_by_key(&index, |(frame_num, _)| *frame_num)
                .ok()
                .map(|pos| (index, &decoded[pos].1))
        })
        .collect()
}

/// 均匀采样的首尾两帧不送入模型
fn usable_uniform<T>(saved: &[T]) -> &[T] {
    if saved.len() > 2 {
        &saved[1..saved.len() - 1]
    } else {
        saved
    }
}

/// 场景帧（已去尾）不够时改用均匀采样
fn needs_fallback(usable: usize, requested: usize) -> bool {
    usable < requested
}

/// 场景采样器：按场景抽帧，帧数不足时退回均匀采样
pub struct SceneSampler {
    frames_root: PathBuf,
    threshold: f64,
    min_scene_len: usize,
    downscale_factor: u32,
    trailing_trim: usize,
}

impl SceneSampler {
    pub fn new(frames_root: impl Into<PathBuf>, threshold: f64) -> Self {
        Self {
            frames_root: frames_root.into(),
            threshold,
            min_scene_len: crate::scene_detector::DEFAULT_MIN_SCENE_LEN,
            downscale_factor: 0,
            trailing_trim: 2,
        }
    }

    pub fn from_config(config: &EvalConfig) -> Self {
        Self {
            frames_root: config.frames_root(),
            threshold: config.detection_threshold,
            min_scene_len: config.min_scene_len,
            downscale_factor: config.downscale_factor,
            trailing_trim: config.trailing_trim,
        }
    }

    pub fn with_trailing_trim(mut self, trailing_trim: usize) -> Self {
        self.trailing_trim = trailing_trim;
        self
    }

    /// `{frames_root}/_{identifier}`
    pub fn frames_dir(&self, identifier: &str) -> PathBuf {
        self.frames_root.join(format!("_{}", identifier))
    }

    /// 读取已缓存的帧目录；不满足本次请求时返回 `None`
    pub fn cached(&self, identifier: &str, requested: usize) -> Option<FrameSet> {
        let dir = self.frames_dir(identifier);
        let metadata = FrameSetMetadata::load(&dir).ok()?;

        let usable = match metadata.origin {
            FrameOrigin::Scenes => metadata.frame_files.len() >= requested,
            FrameOrigin::Uniform => metadata.frame_files.len() == requested,
        };
        let complete = metadata.frame_paths(&dir).iter().all(|p| p.exists());
        if usable && complete {
            Some(FrameSet { dir, metadata })
        } else {
            None
        }
    }

    /// 为视频准备至少 `requested` 帧（命中缓存时不解码）
    pub fn prepare(&self, video_path: &Path, identifier: &str, requested: usize) -> Result<FrameSet> {
        if let Some(set) = self.cached(identifier, requested) {
            debug!("📦 [帧抽取] 命中帧缓存: {} ({} 帧)", set.dir.display(), set.len());
            return Ok(set);
        }

        if !video_path.exists() {
            anyhow::bail!("视频文件不存在，无法抽帧: {}", video_path.display());
        }

        let dir = self.frames_dir(identifier);
        reset_dir(&dir)?;

        let processor = VideoProcessor::new(video_path)?;
        let info = processor.get_video_info()?;

        let set = self.extract_scene_frames(&processor, &info, &dir)?;
        if !needs_fallback(set.len(), requested) {
            return Ok(set);
        }

        info!(
            "🔁 [帧抽取] 场景帧不足（{} < {}），改为均匀采样: {}",
            set.len(),
            requested,
            video_path.display()
        );
        reset_dir(&dir)?;
        self.extract_uniform_frames(&processor, &info, &dir, requested)
    }

    /// 每个场景保存第一帧（原始分辨率），文件名为场景序号
    fn extract_scene_frames(&self, processor: &VideoProcessor, info: &VideoInfo, dir: &Path) -> Result<FrameSet> {
        let start = Instant::now();
        let mut detector = SceneDetector::new(self.threshold, self.min_scene_len)
            .with_downscale(self.downscale_factor);

        let mut saved: Vec<(String, usize)> = Vec::new();
        let scenes = detector.scan(processor, info.fps, |scene_index, frame_num, image| {
            let name = save_frame(dir, scene_index, image)?;
            saved.push((name, frame_num));
            Ok(())
        })?;

        let usable = trim_trailing(&saved, self.trailing_trim);
        info!(
            "✅ [帧抽取] 场景检测完成，耗时: {:.2}秒，场景 {} 个，可用帧 {} 个",
            start.elapsed().as_secs_f64(),
            scenes.len(),
            usable.len()
        );

        let metadata = FrameSetMetadata {
            video_file: processor.input_path().to_string_lossy().to_string(),
            origin: FrameOrigin::Scenes,
            fps: info.fps,
            resolution: format!("{}x{}", info.width, info.height),
            total_frames: info.total_frames,
            detection_threshold: self.threshold,
            scenes,
            frame_files: usable.iter().map(|(name, _)| name.clone()).collect(),
            source_frame_indices: usable.iter().map(|(_, idx)| *idx).collect(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        metadata.save(dir)?;

        Ok(FrameSet {
            dir: dir.to_path_buf(),
            metadata,
        })
    }

    /// 均匀采样 `requested + 2` 帧并全部保存，去掉首尾后恰好 `requested` 帧可用
    fn extract_uniform_frames(
        &self,
        processor: &VideoProcessor,
        info: &VideoInfo,
        dir: &Path,
        requested: usize,
    ) -> Result<FrameSet> {
        let start = Instant::now();
        let indices = uniform_indices(info.total_frames, requested);
        if indices.is_empty() {
            anyhow::bail!("视频没有可解码的帧: {}", processor.input_path().display());
        }

        let decoded = processor.decode_frames_at(&indices)?;
        let samples = expand_samples(&indices, &decoded);
        if samples.len() < indices.len() {
            // 容器记录的帧数可能偏大
            warn!(
                "⚠️  [帧抽取] 只解码到 {}/{} 个采样帧: {}",
                samples.len(),
                indices.len(),
                processor.input_path().display()
            );
        }

        let mut saved: Vec<(String, usize)> = Vec::with_capacity(samples.len());
        for (position, (frame_num, image)) in samples.into_iter().enumerate() {
            saved.push((save_frame(dir, position, image)?, frame_num));
        }

        let usable = usable_uniform(&saved);
        info!(
            "✅ [帧抽取] 均匀采样完成，耗时: {:.2}秒，可用帧 {} 个",
            start.elapsed().as_secs_f64(),
            usable.len()
        );

        let metadata = FrameSetMetadata {
            video_file: processor.input_path().to_string_lossy().to_string(),
            origin: FrameOrigin::Uniform,
            fps: info.fps,
            resolution: format!("{}x{}", info.width, info.height),
            total_frames: info.total_frames,
            detection_threshold: self.threshold,
            scenes: Vec::new(),
            frame_files: usable.iter().map(|(name, _)| name.clone()).collect(),
            source_frame_indices: usable.iter().map(|(_, idx)| *idx).collect(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        metadata.save(dir)?;

        Ok(FrameSet {
            dir: dir.to_path_buf(),
            metadata,
        })
    }
}

/// 清空并重建帧目录
fn reset_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir).with_context(|| format!("删除帧目录失败: {}", dir.display()))?;
    }
    std::fs::create_dir_all(dir).with_context(|| format!("创建帧目录失败: {}", dir.display()))
}

/// 保存为 `{index}.jpg`，返回文件名
fn save_frame(dir: &Path, index: usize, image: &DynamicImage) -> Result<String> {
    let name = format!("{}.jpg", index);
    let path = dir.join(&name);
    image
        .to_rgb8()
        .save(&path)
        .with_context(|| format!("保存帧失败: {}", path.display()))?;
    Ok(name)
}
