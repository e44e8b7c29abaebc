use anyhow::{Context, Result};
use base64::Engine;
use image::{imageops::FilterType, DynamicImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::prompt::VIDEO_TOKEN;

/// 视频语言模型能力：输入同尺寸 RGB 帧序列和提示词，返回生成文本
///
/// 返回文本包含回显的提示词以及续写部分。
#[allow(async_fn_in_trait)]
pub trait VideoLanguageModel {
    async fn generate(&self, frames: &[DynamicImage], prompt: &str, max_new_tokens: usize) -> Result<String>;
}

/// 推理请求体
#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    prompt: &'a str,
    /// base64 编码的 JPEG
    images: Vec<String>,
    max_new_tokens: usize,
}

/// 推理响应体
#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(alias = "generated_text", alias = "output")]
    text: String,
}

/// 通过 HTTP 调用外部推理服务
pub struct HttpVideoModel {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpVideoModel {
    pub fn new(endpoint: impl Into<String>, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("创建 HTTP 客户端失败")?;
        Ok(Self {
            endpoint: endpoint.into(),
            client,
        })
    }
}

impl VideoLanguageModel for HttpVideoModel {
    async fn generate(&self, frames: &[DynamicImage], prompt: &str, max_new_tokens: usize) -> Result<String> {
        let images = frames.iter().map(encode_jpeg_base64).collect::<Result<Vec<_>>>()?;
        let request = GenerateRequest {
            prompt,
            images,
            max_new_tokens,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("推理请求失败: {}", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("推理服务返回错误状态: {} - {}", status, error_text);
        }

        let body: GenerateResponse = response.json().await.context("解析推理响应失败")?;
        Ok(body.text)
    }
}

/// 帧编码为 base64 JPEG
fn encode_jpeg_base64(frame: &DynamicImage) -> Result<String> {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(frame.to_rgb8())
        .write_to(&mut Cursor::new(&mut bytes), image::ImageOutputFormat::Jpeg(90))
        .context("JPEG 编码失败")?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

/// 读取帧文件并统一为第一帧的尺寸（RGB8）
pub fn load_frames(paths: &[PathBuf]) -> Result<Vec<DynamicImage>> {
    let mut frames: Vec<DynamicImage> = Vec::with_capacity(paths.len());
    for path in paths {
        let img = image::open(path).with_context(|| format!("读取帧失败: {}", path.display()))?;
        let img = DynamicImage::ImageRgb8(img.to_rgb8());
        let img = match frames.first() {
            Some(first) if (first.width(), first.height()) != (img.width(), img.height()) => {
                img.resize_exact(first.width(), first.height(), FilterType::Triangle)
            }
            _ => img,
        };
        frames.push(img);
    }
    Ok(frames)
}

/// 对一组帧执行一次推理，返回原始生成文本
pub async fn run_inference<M: VideoLanguageModel + ?Sized>(
    model: &M,
    frames: &[PathBuf],
    prompt: &str,
    max_new_tokens: usize,
) -> Result<String> {
    let placeholders = prompt.matches(VIDEO_TOKEN).count();
    if placeholders != 1 {
        anyhow::bail!("提示词必须恰好包含一个视频占位符，实际 {} 个", placeholders);
    }
    if frames.is_empty() {
        anyhow::bail!("没有可用于推理的帧");
    }

    let images = load_frames(frames)?;
    let start = Instant::now();
    debug!("🧠 [推理] 输入 {} 帧，max_new_tokens={}", images.len(), max_new_tokens);
    let text = model.generate(&images, prompt, max_new_tokens).await?;
    info!("✅ [推理] 完成，耗时: {:.2}秒", start.elapsed().as_secs_f64());
    Ok(text)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use std::cell::RefCell;

    /// 测试替身：按顺序返回预设回复，并记录收到的帧尺寸
    pub(crate) struct ScriptedModel {
        pub replies: RefCell<Vec<Result<String>>>,
        pub seen_sizes: RefCell<Vec<Vec<(u32, u32)>>>,
    }

    impl ScriptedModel {
        pub(crate) fn new(replies: Vec<Result<String>>) -> Self {
            Self {
                replies: RefCell::new(replies.into_iter().rev().collect()),
                seen_sizes: RefCell::new(Vec::new()),
            }
        }
    }

    impl VideoLanguageModel for ScriptedModel {
        async fn generate(&self, frames: &[DynamicImage], prompt: &str, _max_new_tokens: usize) -> Result<String> {
            self.seen_sizes
                .borrow_mut()
                .push(frames.iter().map(|f| (f.width(), f.height())).collect());
            let reply = self.replies.borrow_mut().pop().unwrap_or_else(|| Ok(String::new()))?;
            Ok(format!("{} {}", prompt, reply))
        }
    }

    fn write_frame(dir: &std::path::Path, name: &str, w: u32, h: u32) -> PathBuf {
        let path = dir.join(name);
        ImageBuffer::from_fn(w, h, |_, _| Rgb([90u8, 120, 200])).save(&path).unwrap();
        path
    }

    #[tokio::test]
    async fn test_frames_resized_to_first() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![
            write_frame(dir.path(), "0.jpg", 32, 24),
            write_frame(dir.path(), "1.jpg", 64, 48),
        ];
        let model = ScriptedModel::new(vec![Ok("A".to_string())]);

        let text = run_inference(&model, &paths, "USER: <video>\nq ASSISTANT:", 4).await.unwrap();
        assert!(text.ends_with("ASSISTANT: A"));
        assert_eq!(model.seen_sizes.borrow()[0], vec![(32, 24), (32, 24)]);
    }

    #[tokio::test]
    async fn test_prompt_must_have_one_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![write_frame(dir.path(), "0.jpg", 8, 8)];
        let model = ScriptedModel::new(Vec::new());

        assert!(run_inference(&model, &paths, "USER: q ASSISTANT:", 4).await.is_err());
        assert!(run_inference(&model, &paths, "<video><video>", 4).await.is_err());
        assert!(model.seen_sizes.borrow().is_empty());
    }

    #[test]
    fn test_jpeg_payload_is_base64() {
        let img = DynamicImage::ImageRgb8(ImageBuffer::from_fn(4, 4, |_, _| Rgb([0u8, 0, 0])));
        let encoded = encode_jpeg_base64(&img).unwrap();
        let bytes = base64::engine::general_purpose::STANDARD.decode(encoded).unwrap();
        // JPEG SOI
        assert_eq!(&bytes[..2], &[0xFFu8, 0xD8]);
    }

    #[test]
    fn test_response_aliases() {
        let r: GenerateResponse = serde_json::from_str(r#"{"generated_text":"USER: x ASSISTANT: B"}"#).unwrap();
        assert_eq!(r.text, "USER: x ASSISTANT: B");
    }
}
