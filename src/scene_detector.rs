use anyhow::Result;
use image::{imageops::FilterType, DynamicImage};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::video_processor::VideoProcessor;

/// 默认检测阈值
pub const DEFAULT_THRESHOLD: f64 = 30.0;
/// 默认最短场景长度（帧）
pub const DEFAULT_MIN_SCENE_LEN: usize = 15;
/// 自动降采样时的目标宽度
const DOWNSCALE_TARGET_WIDTH: u32 = 256;

/// 一个场景的起止边界
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub start_frame: usize,
    /// 不含
    pub end_frame: usize,
    /// 场景开始时间（秒）
    pub start_time: f64,
    /// 场景结束时间（秒）
    pub end_time: f64,
}

/// 降采样后一帧的 HSV 三个平面
struct HsvPlanes {
    width: u32,
    height: u32,
    hue: Vec<f64>,
    sat: Vec<f64>,
    val: Vec<f64>,
}

/// 场景检测器，用于检测视频中的镜头切换点
///
/// 相邻帧在 HSV 空间的平均绝对差（H 取 0-180，S/V 取 0-255，三通道取平均）
/// 超过阈值、且距上一个切点不少于 `min_scene_len` 帧时记为切点。
pub struct SceneDetector {
    threshold: f64,
    min_scene_len: usize,
    /// 0 表示按宽度自动计算
    downscale_factor: u32,
    last_frame: Option<HsvPlanes>,
    last_cut: Option<usize>,
}

impl SceneDetector {
    pub fn new(threshold: f64, min_scene_len: usize) -> Self {
        Self {
            threshold,
            min_scene_len,
            downscale_factor: 0,
            last_frame: None,
            last_cut: None,
        }
    }

    pub fn with_downscale(mut self, factor: u32) -> Self {
        self.downscale_factor = factor;
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    fn effective_downscale(&self, width: u32) -> u32 {
        if self.downscale_factor > 0 {
            self.downscale_factor
        } else {
            (width / DOWNSCALE_TARGET_WIDTH).max(1)
        }
    }

    /// 降采样并转换到 HSV
    fn to_hsv_planes(&self, frame: &DynamicImage) -> HsvPlanes {
        let factor = self.effective_downscale(frame.width());
        let small = if factor > 1 {
            let w = (frame.width() / factor).max(1);
            let h = (frame.height() / factor).max(1);
            frame.resize_exact(w, h, FilterType::Nearest).to_rgb8()
        } else {
            frame.to_rgb8()
        };

        let len = (small.width() * small.height()) as usize;
        let mut planes = HsvPlanes {
            width: small.width(),
            height: small.height(),
            hue: Vec::with_capacity(len),
            sat: Vec::with_capacity(len),
            val: Vec::with_capacity(len),
        };
        for p in small.pixels() {
            let (h, s, v) = rgb_to_hsv(p[0], p[1], p[2]);
            planes.hue.push(h / 2.0);
            planes.sat.push(s * 255.0);
            planes.val.push(v * 255.0);
        }
        planes
    }

    /// 计算两帧之间的内容差异值
    pub fn calculate_frame_difference(&self, frame1: &DynamicImage, frame2: &DynamicImage) -> f64 {
        content_value(&self.to_hsv_planes(frame1), &self.to_hsv_planes(frame2))
    }

    /// 输入下一帧，若在该帧处切换场景则返回帧号
    pub fn process_frame(&mut self, frame_num: usize, frame: &DynamicImage) -> Option<usize> {
        let planes = self.to_hsv_planes(frame);
        if self.last_cut.is_none() {
            self.last_cut = Some(frame_num);
        }

        let mut cut = None;
        if let Some(prev) = &self.last_frame {
            let score = content_value(prev, &planes);
            let since_last = frame_num - self.last_cut.unwrap_or(frame_num);
            if score >= self.threshold && since_last >= self.min_scene_len {
                debug!("✂️  [场景检测] 帧 {} 切换，内容差异 {:.2}", frame_num, score);
                self.last_cut = Some(frame_num);
                cut = Some(frame_num);
            }
        }
        self.last_frame = Some(planes);
        cut
    }

    /// 扫描整段视频；每个场景的第一帧（原始分辨率）交给 `on_scene_start(场景序号, 帧号, 图像)`
    pub fn scan<F>(&mut self, processor: &VideoProcessor, fps: f64, mut on_scene_start: F) -> Result<Vec<Scene>>
    where
        F: FnMut(usize, usize, &DynamicImage) -> Result<()>,
    {
        let mut starts: Vec<usize> = Vec::new();
        let total = processor.for_each_frame(|frame_num, _, image| {
            let cut = self.process_frame(frame_num, &image);
            if frame_num == 0 || cut.is_some() {
                on_scene_start(starts.len(), frame_num, &image)?;
                starts.push(frame_num);
            }
            Ok(true)
        })?;

        Ok(scenes_from_starts(&starts, total, fps))
    }
}

/// 内容差异值：三个通道平均绝对差的均值
fn content_value(a: &HsvPlanes, b: &HsvPlanes) -> f64 {
    if a.width != b.width || a.height != b.height || a.hue.is_empty() {
        return 255.0;
    }
    let mean_abs = |x: &[f64], y: &[f64]| {
        x.iter().zip(y).map(|(p, q)| (p - q).abs()).sum::<f64>() / x.len() as f64
    };
    (mean_abs(&a.hue, &b.hue) + mean_abs(&a.sat, &b.sat) + mean_abs(&a.val, &b.val)) / 3.0
}

/// RGB转HSV：返回 (色调 0-360, 饱和度 0-1, 亮度 0-1)
fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (f64, f64, f64) {
    let r = r as f64 / 255.0;
    let g = g as f64 / 255.0;
    let b = b as f64 / 255.0;

    let max = r.max(g.max(b));
    let min = r.min(g.min(b));
    let delta = max - min;

    let h = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * (((g - b) / delta) % 6.0)
    } else if max == g {
        60.0 * (((b - r) / delta) + 2.0)
    } else {
        60.0 * (((r - g) / delta) + 4.0)
    };
    let h = if h < 0.0 { h + 360.0 } else { h };
    let s = if max == 0.0 { 0.0 } else { delta / max };

    (h, s, max)
}

/// 由场景起始帧号生成场景边界列表
pub fn scenes_from_starts(starts: &[usize], total_frames: usize, fps: f64) -> Vec<Scene> {
    let fps = if fps > 0.0 { fps } else { 30.0 };
    starts
        .iter()
        .enumerate()
        .map(|(i, &start)| {
            let end = starts.get(i + 1).copied().unwrap_or(total_frames.max(start + 1));
            Scene {
                start_frame: start,
                end_frame: end,
                start_time: start as f64 / fps,
                end_time: end as f64 / fps,
            }
        })
        .collect()
}

/// 检测视频的场景边界
pub fn detect_scenes(video_path: impl AsRef<Path>, sensitivity_threshold: f64) -> Result<Vec<Scene>> {
    let processor = VideoProcessor::new(video_path)?;
    let info = processor.get_video_info()?;
    let mut detector = SceneDetector::new(sensitivity_threshold, DEFAULT_MIN_SCENE_LEN);
    detector.scan(&processor, info.fps, |_, _, _| Ok(()))
}
