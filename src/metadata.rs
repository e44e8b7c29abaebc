use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::scene_detector::Scene;

/// 帧目录中的元数据文件名
pub const METADATA_FILE: &str = "metadata.json";

/// 帧的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameOrigin {
    /// 每个场景取第一帧
    Scenes,
    /// 场景帧不足时按时间均匀采样
    Uniform,
}

/// 一个帧目录的元数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameSetMetadata {
    /// 源视频文件路径
    pub video_file: String,
    pub origin: FrameOrigin,
    /// 视频帧率
    pub fps: f64,
    /// 视频分辨率（宽x高）
    pub resolution: String,
    /// 视频总帧数
    pub total_frames: usize,
    /// 检测阈值（均匀采样时仍记录，便于复查）
    pub detection_threshold: f64,
    /// 检测到的场景（均匀采样时为空）
    #[serde(default)]
    pub scenes: Vec<Scene>,
    /// 可用帧文件名，按抽取顺序
    pub frame_files: Vec<String>,
    /// 可用帧在视频中的帧号，与 `frame_files` 一一对应
    pub source_frame_indices: Vec<usize>,
    /// 生成时间（RFC 3339）
    pub created_at: String,
}

impl FrameSetMetadata {
    pub fn frame_paths(&self, dir: &Path) -> Vec<PathBuf> {
        self.frame_files.iter().map(|f| dir.join(f)).collect()
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(METADATA_FILE);
        let json = serde_json::to_string_pretty(self).context("序列化帧元数据失败")?;
        std::fs::write(&path, json).with_context(|| format!("写入帧元数据失败: {}", path.display()))
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(METADATA_FILE);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("读取帧元数据失败: {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("解析帧元数据失败: {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let meta = FrameSetMetadata {
            video_file: "v.mp4".to_string(),
            origin: FrameOrigin::Uniform,
            fps: 25.0,
            resolution: "640x360".to_string(),
            total_frames: 250,
            detection_threshold: 30.0,
            scenes: Vec::new(),
            frame_files: vec!["1.jpg".to_string(), "2.jpg".to_string()],
            source_frame_indices: vec![83, 166],
            created_at: "2026-01-01T00:00:00Z".to_string(),
        };
        meta.save(dir.path()).unwrap();

        let raw = std::fs::read_to_string(dir.path().join(METADATA_FILE)).unwrap();
        assert!(raw.contains("\"origin\": \"uniform\""));
        assert_eq!(FrameSetMetadata::load(dir.path()).unwrap(), meta);
        assert_eq!(meta.frame_paths(dir.path())[1], dir.path().join("2.jpg"));
    }
}
