use anyhow::{Context, Result};
use ffmpeg_next as ffmpeg;
use image::{DynamicImage, RgbImage};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::debug;

/// 视频基本信息
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoInfo {
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    /// 总帧数（容器未记录时按时长估算）
    pub total_frames: usize,
    /// 时长（秒）
    pub duration: f64,
}

/// 视频处理器，负责解码视频并提取帧
pub struct VideoProcessor {
    input_path: PathBuf,
}

impl VideoProcessor {
    pub fn new(input_path: impl AsRef<Path>) -> Result<Self> {
        let input_path = input_path.as_ref();
        if !input_path.exists() {
            anyhow::bail!("视频文件不存在: {}", input_path.display());
        }

        ffmpeg::init().context("初始化 FFmpeg 失败")?;
        // 只保留错误级别日志
        ffmpeg::util::log::set_level(ffmpeg::util::log::Level::Error);

        Ok(Self {
            input_path: input_path.to_path_buf(),
        })
    }

    pub fn input_path(&self) -> &Path {
        &self.input_path
    }

    /// 获取视频信息
    pub fn get_video_info(&self) -> Result<VideoInfo> {
        let ictx = ffmpeg::format::input(&self.input_path).context("无法打开视频文件")?;

        let video_stream = ictx
            .streams()
            .best(ffmpeg::media::Type::Video)
            .context("未找到视频流")?;

        let decoder = ffmpeg::codec::context::Context::from_parameters(video_stream.parameters())
            .context("无法创建解码器上下文")?
            .decoder()
            .video()
            .context("无法创建视频解码器")?;

        let rate = video_stream.avg_frame_rate();
        let fps = if rate.denominator() > 0 && rate.numerator() > 0 {
            rate.numerator() as f64 / rate.denominator() as f64
        } else {
            30.0
        };

        let duration = if ictx.duration() > 0 {
            ictx.duration() as f64 / ffmpeg::ffi::AV_TIME_BASE as f64
        } else {
            0.0
        };

        let total_frames = if video_stream.frames() > 0 {
            video_stream.frames() as usize
        } else {
            (duration * fps).round() as usize
        };

        Ok(VideoInfo {
            fps,
            width: decoder.width(),
            height: decoder.height(),
            total_frames,
            duration,
        })
    }

    /// 顺序解码全部帧，对每一帧调用 `visit(帧序号, 时间戳秒, 图像)`
    ///
    /// `visit` 返回 `false` 时提前结束。
    pub fn for_each_frame<F>(&self, mut visit: F) -> Result<usize>
    where
        F: FnMut(usize, f64, DynamicImage) -> Result<bool>,
    {
        let mut ictx = ffmpeg::format::input(&self.input_path).context("无法打开视频文件")?;

        let stream = ictx
            .streams()
            .best(ffmpeg::media::Type::Video)
            .context("未找到视频流")?;
        let video_stream_index = stream.index();
        let time_base = stream.time_base();

        let mut decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .context("无法创建解码器上下文")?
            .decoder()
            .video()
            .context("无法创建视频解码器")?;

        let mut scaler = ffmpeg::software::scaling::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::format::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::Flags::BILINEAR,
        )
        .context("无法创建缩放器")?;

        let to_seconds = |ts: Option<i64>| {
            ts.map(|ts| ts as f64 * time_base.numerator() as f64 / time_base.denominator().max(1) as f64)
                .unwrap_or(0.0)
        };

        let mut index = 0usize;
        let mut keep_going = true;
        let mut drain = |decoder: &mut ffmpeg::codec::decoder::Video, index: &mut usize| -> Result<bool> {
            let mut decoded = ffmpeg::frame::Video::empty();
            while decoder.receive_frame(&mut decoded).is_ok() {
                let mut rgb_frame = ffmpeg::frame::Video::empty();
                scaler.run(&decoded, &mut rgb_frame).context("像素格式转换失败")?;
                let image = frame_to_image(&rgb_frame)?;
                let timestamp = to_seconds(decoded.timestamp());
                let current = *index;
                *index += 1;
                if !visit(current, timestamp, image)? {
                    return Ok(false);
                }
            }
            Ok(true)
        };

        for (stream, packet) in ictx.packets() {
            if stream.index() != video_stream_index {
                continue;
            }
            if decoder.send_packet(&packet).is_err() {
                // 损坏的数据包直接跳过
                continue;
            }
            keep_going = drain(&mut decoder, &mut index)?;
            if !keep_going {
                break;
            }
        }

        if keep_going {
            decoder.send_eof().context("刷新解码器失败")?;
            drain(&mut decoder, &mut index)?;
        }

        debug!("🎞️  [视频解码] 共解码 {} 帧: {}", index, self.input_path.display());
        Ok(index)
    }

    /// 按帧序号解码指定帧，返回顺序与序号升序一致
    pub fn decode_frames_at(&self, indices: &[usize]) -> Result<Vec<(usize, DynamicImage)>> {
        let wanted: BTreeSet<usize> = indices.iter().copied().collect();
        let Some(&last) = wanted.iter().next_back() else {
            return Ok(Vec::new());
        };

        let mut frames = Vec::with_capacity(wanted.len());
        self.for_each_frame(|index, _, image| {
            if wanted.contains(&index) {
                frames.push((index, image));
            }
            Ok(index < last)
        })?;
        Ok(frames)
    }
}

/// 将 RGB24 帧转换为 DynamicImage（按 stride 逐行拷贝）
fn frame_to_image(frame: &ffmpeg::frame::Video) -> Result<DynamicImage> {
    let width = frame.width() as usize;
    let height = frame.height() as usize;
    let stride = frame.stride(0);
    let data = frame.data(0);

    let mut buf = Vec::with_capacity(width * height * 3);
    for y in 0..height {
        let row_start = y * stride;
        let row = data
            .get(row_start..row_start + width * 3)
            .context("帧数据长度不足")?;
        buf.extend_from_slice(row);
    }

    let img = RgbImage::from_raw(width as u32, height as u32, buf).context("构建图像失败")?;
    Ok(DynamicImage::ImageRgb8(img))
}
