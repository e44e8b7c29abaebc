use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::dataset::VideoReference;

/// 下载输出的最大高度
pub const MAX_HEIGHT: u32 = 480;
/// 输出容器
pub const CONTAINER: &str = "mp4";
/// 输出音频编码
pub const AUDIO_CODEC: &str = "aac";

/// 下载能力：把远程视频落到指定路径
pub trait Downloader {
    fn download(&self, remote_url: &str, output_path: &Path) -> Result<()>;
}

/// 调用 yt-dlp 命令行下载并转码
pub struct YtDlpDownloader {
    program: String,
}

impl YtDlpDownloader {
    pub fn new() -> Self {
        Self::with_program("yt-dlp")
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self { program: program.into() }
    }

    fn build_command(&self, remote_url: &str, output_path: &Path) -> Command {
        let format = format!(
            "bestvideo[height<={h}]+bestaudio/best[height<={h}]",
            h = MAX_HEIGHT
        );
        let mut cmd = Command::new(&self.program);
        cmd.arg("--quiet")
            .arg("--no-warnings")
            .arg("-f")
            .arg(format)
            .arg("--merge-output-format")
            .arg(CONTAINER)
            .arg("--postprocessor-args")
            .arg(format!("ffmpeg:-c:v copy -c:a {}", AUDIO_CODEC))
            .arg("-o")
            .arg(output_path)
            .arg(remote_url);
        cmd
    }
}

impl Default for YtDlpDownloader {
    fn default() -> Self {
        Self::new()
    }
}

impl Downloader for YtDlpDownloader {
    fn download(&self, remote_url: &str, output_path: &Path) -> Result<()> {
        let status = self
            .build_command(remote_url, output_path)
            .status()
            .with_context(|| format!("执行 {} 失败", self.program))?;

        if !status.success() {
            anyhow::bail!("{} 退出码异常: {}", self.program, status);
        }
        Ok(())
    }
}

/// 确保本地存在视频文件；已存在则直接复用
///
/// 返回 `(remote_url, success)`，失败不会中断批处理，由调用方决定是否跳过。
pub fn ensure_local_video<D: Downloader + ?Sized>(
    downloader: &D,
    remote_url: &str,
    target_name: &str,
    storage_root: &Path,
) -> (String, bool) {
    let outcome = acquire(downloader, remote_url, &storage_root.join(format!("{}.mp4", target_name)));
    (outcome.remote_url, outcome.success)
}

/// 一次获取的结果
#[derive(Debug, Clone, PartialEq)]
pub struct AcquireOutcome {
    pub remote_url: String,
    pub path: PathBuf,
    pub success: bool,
    /// 命中本地缓存，没有触发下载
    pub cached: bool,
}

fn acquire<D: Downloader + ?Sized>(downloader: &D, remote_url: &str, path: &Path) -> AcquireOutcome {
    let outcome = |success, cached| AcquireOutcome {
        remote_url: remote_url.to_string(),
        path: path.to_path_buf(),
        success,
        cached,
    };

    if path.exists() {
        debug!("📦 [视频获取] 命中缓存: {}", path.display());
        return outcome(true, true);
    }

    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!("⚠️  [视频获取] 创建目录失败: {} - {}", parent.display(), e);
            return outcome(false, false);
        }
    }

    let start = Instant::now();
    info!("⏳ [视频获取] 正在下载: {}", remote_url);
    match downloader.download(remote_url, path) {
        Ok(()) if path.exists() => {
            info!(
                "✅ [视频获取] 下载完成，耗时: {:.2}秒 -> {}",
                start.elapsed().as_secs_f64(),
                path.display()
            );
            outcome(true, false)
        }
        Ok(()) => {
            warn!("⚠️  [视频获取] 下载器返回成功但文件不存在: {}", path.display());
            outcome(false, false)
        }
        Err(e) => {
            warn!("⚠️  [视频获取] 下载失败: {} - {:#}", remote_url, e);
            discard_partial(path);
            outcome(false, false)
        }
    }
}

/// 删除下载失败留下的半成品，否则下次会被当成缓存命中
///
/// 返回 `false` 表示文件仍在原处。
fn discard_partial(path: &Path) -> bool {
    if !path.exists() {
        return true;
    }
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(e) => {
            warn!("⚠️  [视频获取] 删除残留文件失败，下次可能误判为缓存: {} - {}", path.display(), e);
            false
        }
    }
}

/// 视频获取器，持有下载能力和视频缓存目录
pub struct VideoAcquirer<D> {
    downloader: D,
    video_dir: PathBuf,
}

impl<D: Downloader> VideoAcquirer<D> {
    pub fn new(downloader: D, video_dir: impl Into<PathBuf>) -> Self {
        Self {
            downloader,
            video_dir: video_dir.into(),
        }
    }

    pub fn video_dir(&self) -> &Path {
        &self.video_dir
    }

    pub fn downloader(&self) -> &D {
        &self.downloader
    }

    pub fn ensure_local_video(&self, reference: &VideoReference) -> AcquireOutcome {
        acquire(
            &self.downloader,
            &reference.remote_url,
            &reference.video_path(&self.video_dir),
        )
    }
}
