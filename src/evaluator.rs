use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info, warn};

use crate::acquirer::{Downloader, VideoAcquirer};
use crate::config::EvalConfig;
use crate::dataset::{EvaluationItem, VideoReference};
use crate::model::{run_inference, VideoLanguageModel};
use crate::prompt::{contains_control_tokens, PromptTemplate};
use crate::sampler::SceneSampler;
use crate::scoring::{expected_letter, summarize, AnswerStatus, EvaluationReport, GeneratedAnswer};
use crate::selector::select_frames;

/// 逐条追加写入 JSONL，每条写完立即 flush，中途退出也不丢已有结果
pub struct ResultsWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl ResultsWriter {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("创建结果目录失败: {}", parent.display()))?;
        }
        let file = File::create(&path).with_context(|| format!("创建结果文件失败: {}", path.display()))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, answer: &GeneratedAnswer) -> Result<()> {
        serde_json::to_writer(&mut self.writer, answer).context("序列化结果失败")?;
        self.writer.write_all(b"\n")?;
        self.writer.flush().context("写入结果失败")
    }
}

/// 本次运行的输出目录名：`{unix 秒}_{uuid}`
pub fn new_run_id() -> String {
    format!("{}_{}", chrono::Utc::now().timestamp(), uuid::Uuid::new_v4())
}

/// 准备帧时失败的阶段
#[derive(Debug)]
enum FrameError {
    /// 视频获取失败（下载失败不算异常，该题跳过）
    Acquire(String),
    /// 抽帧失败
    Extract(anyhow::Error),
}

/// 评测流水线：获取视频 → 抽帧 → 选帧 → 组装提示词 → 推理 → 解析打分
pub struct Evaluator<D, M> {
    config: EvalConfig,
    acquirer: VideoAcquirer<D>,
    sampler: SceneSampler,
    template: PromptTemplate,
    model: M,
}

impl<D: Downloader, M: VideoLanguageModel> Evaluator<D, M> {
    pub fn new(config: EvalConfig, downloader: D, model: M) -> Self {
        let acquirer = VideoAcquirer::new(downloader, config.video_dir());
        let sampler = SceneSampler::from_config(&config);
        Self {
            config,
            acquirer,
            sampler,
            template: PromptTemplate::default(),
            model,
        }
    }

    pub fn config(&self) -> &EvalConfig {
        &self.config
    }

    /// 获取视频并选出送入模型的帧
    pub fn selected_frames(&self, reference: &VideoReference) -> Result<Vec<PathBuf>> {
        self.prepare_frames(reference).map_err(|e| match e {
            FrameError::Acquire(url) => anyhow::anyhow!("视频获取失败: {}", url),
            FrameError::Extract(e) => e.context("抽帧失败"),
        })
    }

    fn prepare_frames(&self, reference: &VideoReference) -> Result<Vec<PathBuf>, FrameError> {
        let outcome = self.acquirer.ensure_local_video(reference);
        if !outcome.success {
            return Err(FrameError::Acquire(reference.remote_url.clone()));
        }
        let frame_set = self
            .sampler
            .prepare(&outcome.path, &reference.local_identifier, self.config.max_frames)
            .map_err(FrameError::Extract)?;
        Ok(select_frames(&frame_set.frame_paths(), self.config.max_frames))
    }

    /// 针对视频提一个自由问题，返回原始生成文本
    pub async fn ask(&self, reference: &VideoReference, subtitles: &str, question: &str) -> Result<String> {
        let frames = self.selected_frames(reference)?;
        let prompt = self.template.build(subtitles, question, None);
        run_inference(&self.model, &frames, &prompt, self.config.max_generated_tokens).await
    }

    /// 处理单道题；任何失败都记录在结果状态里，不向上传播
    pub async fn evaluate_item(&self, index: usize, item: &EvaluationItem) -> GeneratedAnswer {
        let expected = expected_letter(item.answer);
        let failed = |status| {
            GeneratedAnswer::without_generation(index, &item.category, item.visually_reliant, expected, status)
        };

        let frames = match self.prepare_frames(&item.video_reference()) {
            Ok(frames) => frames,
            Err(FrameError::Acquire(url)) => {
                warn!("⚠️  [评测] 第 {} 题视频获取失败，跳过: {}", index, url);
                return failed(AnswerStatus::Skipped(format!("视频获取失败: {}", url)));
            }
            Err(FrameError::Extract(e)) => {
                error!("❌ [评测] 第 {} 题抽帧失败: {:#}", index, e);
                return failed(AnswerStatus::Errored(format!("抽帧失败: {:#}", e)));
            }
        };

        if contains_control_tokens(&item.subtitles) {
            warn!("⚠️  [评测] 第 {} 题字幕包含控制标记，答案解析可能出错", index);
        }
        let prompt = self.template.build(&item.subtitles, &item.question, Some(item.options.as_slice()));

        match run_inference(&self.model, &frames, &prompt, self.config.max_generated_tokens).await {
            Ok(raw_text) => GeneratedAnswer::from_generation(
                index,
                &item.category,
                item.visually_reliant,
                expected,
                raw_text,
            ),
            Err(e) => {
                error!("❌ [评测] 第 {} 题推理失败: {:#}", index, e);
                failed(AnswerStatus::Errored(format!("推理失败: {:#}", e)))
            }
        }
    }

    /// 按数据集顺序逐题评测，结果逐条写入 `results`（如果提供）
    pub async fn run(
        &self,
        items: &[EvaluationItem],
        mut results: Option<&mut ResultsWriter>,
    ) -> Result<(Vec<GeneratedAnswer>, EvaluationReport)> {
        let total_start = Instant::now();
        info!("🎬 [评测] 开始评测，共 {} 题", items.len());
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        let mut answers = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let item_start = Instant::now();
            let answer = self.evaluate_item(index, item).await;
            info!(
                "📝 [评测] {}/{} 期望 {} 解析 {} -> {:?}，耗时: {:.2}秒",
                index + 1,
                items.len(),
                answer.expected,
                answer.parsed.map(String::from).unwrap_or_else(|| "-".to_string()),
                answer.status,
                item_start.elapsed().as_secs_f64()
            );
            if let Some(writer) = results.as_deref_mut() {
                writer.append(&answer)?;
            }
            answers.push(answer);
        }

        let report = summarize(&answers);
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        info!(
            "🎉 [评测] 完成！总耗时: {:.2}秒",
            total_start.elapsed().as_secs_f64()
        );
        info!(
            "📊 [评测] 总体准确率: {:.2}% ({}/{})",
            report.overall_accuracy, report.overall.correct, report.overall.total
        );
        for (category, tally) in &report.category_counts.categories {
            info!(
                "   • {}: {:.2}% ({}/{})",
                category,
                tally.accuracy(),
                tally.correct,
                tally.total
            );
        }
        if report.visual_subset.total > 0 {
            info!(
                "   • 依赖画面子集: {:.2}% ({}/{})",
                report.visual_accuracy, report.visual_subset.correct, report.visual_subset.total
            );
        }
        info!(
            "   • 跳过 {} / 出错 {} / 无法解析 {}",
            report.skipped, report.errored, report.unparsed
        );

        Ok((answers, report))
    }
}

/// 写出汇总报告
pub fn write_report(report: &EvaluationReport, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("序列化报告失败")?;
    std::fs::write(path, json).with_context(|| format!("写入报告失败: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquirer::tests::FakeDownloader;
    use crate::metadata::{FrameOrigin, FrameSetMetadata};
    use crate::model::tests::ScriptedModel;
    use image::{ImageBuffer, Rgb};

    fn item(id: &str, category: &str, answer: usize, visual: bool) -> EvaluationItem {
        EvaluationItem {
            question: format!("Question about {}?", id),
            options: vec!["one".into(), "two".into(), "three".into()],
            answer,
            subtitles: "line one\nline two".to_string(),
            category: category.to_string(),
            visually_reliant: visual,
            video_title: id.to_string(),
            video_link: format!("https://youtu.be/{}", id),
        }
    }

    /// 预置视频文件和帧缓存，避免解码
    fn seed_cache(config: &EvalConfig, id: &str, frames: usize) {
        let video_dir = config.video_dir();
        std::fs::create_dir_all(&video_dir).unwrap();
        std::fs::write(video_dir.join(format!("{}.mp4", id)), b"video").unwrap();

        let dir = config.frames_root().join(format!("_{}", id));
        std::fs::create_dir_all(&dir).unwrap();
        let names: Vec<String> = (0..frames)
            .map(|i| {
                let name = format!("{}.jpg", i);
                ImageBuffer::from_fn(16, 12, |_, _| Rgb([i as u8, 0, 0]))
                    .save(dir.join(&name))
                    .unwrap();
                name
            })
            .collect();
        FrameSetMetadata {
            video_file: format!("{}.mp4", id),
            origin: FrameOrigin::Scenes,
            fps: 30.0,
            resolution: "16x12".to_string(),
            total_frames: 900,
            detection_threshold: 30.0,
            scenes: Vec::new(),
            frame_files: names,
            source_frame_indices: (0..frames).collect(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
        }
        .save(&dir)
        .unwrap();
    }

    fn config_in(root: &Path) -> EvalConfig {
        EvalConfig {
            storage_root: root.to_path_buf(),
            max_frames: 4,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_end_to_end_accuracy() {
        let root = tempfile::tempdir().unwrap();
        let config = config_in(root.path());
        for id in ["v0", "v1", "v2"] {
            seed_cache(&config, id, 10);
        }
        let items = vec![
            item("v0", "visual", 0, true),
            item("v1", "dialogue", 1, false),
            item("v2", "visual", 2, true),
        ];
        let model = ScriptedModel::new(vec![Ok("A".into()), Ok("C".into()), Ok("C".into())]);
        let evaluator = Evaluator::new(config, FakeDownloader::ok(), model);

        let mut writer = ResultsWriter::create(root.path().join("out").join("results.jsonl")).unwrap();
        let (answers, report) = evaluator.run(&items, Some(&mut writer)).await.unwrap();

        let correctness: Vec<bool> = answers.iter().map(|a| a.is_correct()).collect();
        assert_eq!(correctness, vec![true, false, true]);
        assert!((report.overall_accuracy - 66.67).abs() < 0.01);
        assert_eq!(report.per_category["visual"], 100.0);
        assert_eq!(report.per_category["dialogue"], 0.0);

        // 缓存命中，不触发下载；每次推理收到 4 帧
        assert!(evaluator.acquirer.ensure_local_video(&items[0].video_reference()).cached);
        assert!(evaluator.model.seen_sizes.borrow().iter().all(|s| s.len() == 4));

        let lines = std::fs::read_to_string(writer.path()).unwrap();
        assert_eq!(lines.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_failures_are_isolated_per_item() {
        let root = tempfile::tempdir().unwrap();
        let config = config_in(root.path());
        seed_cache(&config, "ok1", 6);
        seed_cache(&config, "ok2", 6);
        let items = vec![
            item("ok1", "a", 0, false),
            item("missing", "a", 0, false),
            item("ok2", "b", 1, false),
        ];
        let model = ScriptedModel::new(vec![
            Err(anyhow::anyhow!("CUDA out of memory")),
            Ok("B".into()),
        ]);
        let evaluator = Evaluator::new(config, FakeDownloader::failing(), model);

        let (answers, report) = evaluator.run(&items, None).await.unwrap();

        assert!(matches!(answers[0].status, AnswerStatus::Errored(_)));
        assert!(matches!(answers[1].status, AnswerStatus::Skipped(_)));
        assert!(answers[2].is_correct());
        assert_eq!(answers.iter().map(|a| a.index).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!((report.errored, report.skipped), (1, 1));
        assert_eq!(report.overall.total, 3);
    }

    #[tokio::test]
    async fn test_ask_returns_raw_text() {
        let root = tempfile::tempdir().unwrap();
        let config = config_in(root.path());
        seed_cache(&config, "v9", 4);
        let evaluator = Evaluator::new(
            config,
            FakeDownloader::ok(),
            ScriptedModel::new(vec![Ok("A person waves.".into())]),
        );

        let reference = VideoReference::new("https://youtu.be/v9", "v9");
        let text = evaluator.ask(&reference, "", "What happens?").await.unwrap();
        assert!(text.ends_with("ASSISTANT: A person waves."));
        assert_eq!(evaluator.model.seen_sizes.borrow()[0].len(), 4);
    }

    #[tokio::test]
    async fn test_unreadable_video_is_errored_not_skipped() {
        let root = tempfile::tempdir().unwrap();
        let config = config_in(root.path());
        // 视频文件在缓存里，但没有帧缓存且内容无法解码
        let video_dir = config.video_dir();
        std::fs::create_dir_all(&video_dir).unwrap();
        std::fs::write(video_dir.join("bad.mp4"), b"not a video").unwrap();

        let evaluator = Evaluator::new(config, FakeDownloader::ok(), ScriptedModel::new(vec![]));
        let answer = evaluator.evaluate_item(0, &item("bad", "a", 0, false)).await;

        match &answer.status {
            AnswerStatus::Errored(detail) => assert!(detail.starts_with("抽帧失败")),
            other => panic!("unexpected status: {:?}", other),
        }
        assert_eq!(evaluator.acquirer.downloader().calls.get(), 0);
        assert!(evaluator.model.seen_sizes.borrow().is_empty());
    }

    #[test]
    fn test_selected_frames_reports_acquire_failure() {
        let root = tempfile::tempdir().unwrap();
        let evaluator = Evaluator::new(
            config_in(root.path()),
            FakeDownloader::failing(),
            ScriptedModel::new(vec![]),
        );
        let err = evaluator
            .selected_frames(&VideoReference::new("https://youtu.be/gone", "gone"))
            .unwrap_err();
        assert!(err.to_string().contains("视频获取失败"));
    }

    #[test]
    fn test_selected_frames_from_cache() {
        let root = tempfile::tempdir().unwrap();
        let config = config_in(root.path());
        seed_cache(&config, "v5", 9);
        let evaluator = Evaluator::new(config, FakeDownloader::ok(), ScriptedModel::new(vec![]));

        let frames = evaluator
            .selected_frames(&VideoReference::new("https://youtu.be/v5", "v5"))
            .unwrap();
        let names: Vec<String> = frames
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["0.jpg", "3.jpg", "5.jpg", "8.jpg"]);
    }

    #[test]
    fn test_run_id_shape() {
        let id = new_run_id();
        let (secs, uuid) = id.split_once('_').unwrap();
        assert!(secs.parse::<i64>().is_ok());
        assert_eq!(uuid.len(), 36);
    }
}
