use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use video_qa_eval::{
    config::{ConfigLoader, ConfigOverrides, EvalConfig},
    dataset::{load_dataset, pick_index, VideoReference},
    evaluator::{new_run_id, write_report, Evaluator, ResultsWriter},
    montage::save_contact_sheet,
    sampler::SceneSampler,
    scene_detector::detect_scenes,
    scoring::summarize,
    selector::select_frames,
    HttpVideoModel, VideoAcquirer, YtDlpDownloader,
};

/// 视频问答评测工具 - 下载视频、按场景抽帧、调用视频语言模型并统计选择题准确率
#[derive(Parser, Debug)]
#[command(name = "video-qa-eval")]
#[command(about = "视频问答评测：场景抽帧、提示词组装、模型推理与准确率统计", long_about = None)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Commands,
}

/// 所有子命令共享的配置覆盖项
/// 优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
#[derive(ClapArgs, Debug)]
struct CommonArgs {
    /// 配置文件路径（可选，支持 .ini 格式）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// 本地缓存根目录（VIDEO_QA_STORAGE_ROOT）
    #[arg(long, global = true)]
    storage_root: Option<PathBuf>,

    /// 送入模型的最大帧数（VIDEO_QA_MAX_FRAMES）
    #[arg(long, global = true)]
    max_frames: Option<usize>,

    /// 场景检测阈值（VIDEO_QA_THRESHOLD）
    #[arg(long, global = true)]
    threshold: Option<f64>,

    /// 最大生成 token 数（VIDEO_QA_MAX_NEW_TOKENS）
    #[arg(long, global = true)]
    max_new_tokens: Option<usize>,

    /// 推理服务地址（VIDEO_QA_MODEL_ENDPOINT）
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// 结果输出目录（VIDEO_QA_RESULTS_DIR）
    #[arg(long, global = true)]
    results_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 下载视频到本地缓存（已存在则跳过）
    Acquire {
        /// 视频链接
        #[arg(short, long)]
        url: String,
        /// 本地文件名（默认从链接推导）
        #[arg(short, long)]
        name: Option<String>,
    },
    /// 检测本地视频的场景边界
    Scenes {
        /// 本地视频文件
        #[arg(short, long)]
        input: PathBuf,
    },
    /// 抽取并选出送入模型的帧
    Frames {
        #[arg(short, long)]
        url: String,
        /// 链接无法识别时用于生成本地标识
        #[arg(long, default_value = "")]
        title: String,
        /// 同时输出网格预览图
        #[arg(long)]
        montage: Option<PathBuf>,
    },
    /// 针对单个视频提问
    Ask {
        #[arg(short, long)]
        url: String,
        #[arg(short, long)]
        question: String,
        /// 字幕文本文件
        #[arg(long)]
        subtitles: Option<PathBuf>,
        #[arg(long, default_value = "")]
        title: String,
    },
    /// 在数据集上评测
    Evaluate {
        /// 数据集文件（VIDEO_QA_DATASET）
        #[arg(short, long)]
        dataset: Option<PathBuf>,
        /// 只评测前 N 题
        #[arg(long)]
        limit: Option<usize>,
        /// 只评测指定下标的一题
        #[arg(long, conflicts_with = "seed")]
        index: Option<usize>,
        /// 用种子随机抽取一题
        #[arg(long)]
        seed: Option<u64>,
    },
    /// 生成默认配置文件
    InitConfig {
        #[arg(short, long, default_value = "video-qa.ini")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Commands::InitConfig { path } = &args.command {
        ConfigLoader::create_default_config(path)?;
        println!("已生成配置文件: {}", path.display());
        return Ok(());
    }

    let dataset_override = match &args.command {
        Commands::Evaluate { dataset, .. } => dataset.clone(),
        _ => None,
    };
    let overrides = ConfigOverrides {
        storage_root: args.common.storage_root.clone(),
        max_frames: args.common.max_frames,
        detection_threshold: args.common.threshold,
        max_generated_tokens: args.common.max_new_tokens,
        model_endpoint: args.common.endpoint.clone(),
        dataset_path: dataset_override,
        results_dir: args.common.results_dir.clone(),
    };
    let config = ConfigLoader::load_config(args.common.config.as_deref(), overrides).context("加载配置失败")?;

    // 初始化日志：RUST_LOG 优先，其次配置中的级别
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .init();

    tracing::info!(
        "使用配置: root={}, max_frames={}, threshold={:.1}, max_new_tokens={}",
        config.storage_root.display(),
        config.max_frames,
        config.detection_threshold,
        config.max_generated_tokens
    );

    match args.command {
        Commands::Acquire { url, name } => {
            let name = name.unwrap_or_else(|| VideoReference::new(&url, &url).local_identifier);
            let (url, ok) = video_qa_eval::ensure_local_video(&YtDlpDownloader::new(), &url, &name, &config.video_dir());
            if !ok {
                anyhow::bail!("视频获取失败: {}", url);
            }
            println!("{}", config.video_dir().join(format!("{}.mp4", name)).display());
        }
        Commands::Scenes { input } => {
            let scenes = detect_scenes(&input, config.detection_threshold)?;
            for (i, scene) in scenes.iter().enumerate() {
                println!(
                    "{:>4}  帧 {:>6} - {:>6}  |  {:>8.2}s - {:>8.2}s",
                    i, scene.start_frame, scene.end_frame, scene.start_time, scene.end_time
                );
            }
        }
        Commands::Frames { url, title, montage } => {
            let reference = VideoReference::new(&url, &title);
            let outcome = VideoAcquirer::new(YtDlpDownloader::new(), config.video_dir()).ensure_local_video(&reference);
            if !outcome.success {
                anyhow::bail!("视频获取失败: {}", url);
            }
            let frame_set = SceneSampler::from_config(&config).prepare(
                &outcome.path,
                &reference.local_identifier,
                config.max_frames,
            )?;
            tracing::info!("📸 帧来源: {:?}，可用 {} 帧", frame_set.origin(), frame_set.len());
            let frames = select_frames(&frame_set.frame_paths(), config.max_frames);
            for frame in &frames {
                println!("{}", frame.display());
            }
            if let Some(output) = montage {
                save_contact_sheet(&frames, 256, &output)?;
                tracing::info!("🖼️  预览图已保存: {}", output.display());
            }
        }
        Commands::Ask { url, question, subtitles, title } => {
            let subtitles = match subtitles {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("读取字幕失败: {}", path.display()))?,
                None => String::new(),
            };
            let evaluator = build_evaluator(&config)?;
            let text = evaluator
                .ask(&VideoReference::new(&url, &title), &subtitles, &question)
                .await?;
            println!("{}", text);
        }
        Commands::Evaluate { limit, index, seed, .. } => {
            run_evaluation(&config, limit, index, seed).await?;
        }
        Commands::InitConfig { .. } => unreachable!("handled above"),
    }

    Ok(())
}

fn build_evaluator(config: &EvalConfig) -> Result<Evaluator<YtDlpDownloader, HttpVideoModel>> {
    let endpoint = config
        .model_endpoint
        .clone()
        .context("未配置推理服务地址（--endpoint 或 VIDEO_QA_MODEL_ENDPOINT）")?;
    let model = HttpVideoModel::new(endpoint, config.model_timeout_secs)?;
    Ok(Evaluator::new(config.clone(), YtDlpDownloader::new(), model))
}

async fn run_evaluation(config: &EvalConfig, limit: Option<usize>, index: Option<usize>, seed: Option<u64>) -> Result<()> {
    let dataset_path = config
        .dataset_path
        .as_ref()
        .context("未指定数据集（--dataset 或 VIDEO_QA_DATASET）")?;
    let mut items = load_dataset(dataset_path)?;
    if let Some(limit) = limit {
        items.truncate(limit);
    }

    let evaluator = build_evaluator(config)?;
    let run_dir = config.results_dir.join(new_run_id());
    let mut writer = ResultsWriter::create(run_dir.join("results.jsonl"))?;

    let single = match (index, seed) {
        (Some(i), _) => Some(i),
        (None, Some(seed)) => Some(pick_index(items.len(), seed).context("数据集为空")?),
        (None, None) => None,
    };

    let report = match single {
        Some(i) => {
            let item = items
                .get(i)
                .with_context(|| format!("下标越界: {} (共 {} 题)", i, items.len()))?;
            let answer = evaluator.evaluate_item(i, item).await;
            writer.append(&answer)?;
            if let Some(text) = &answer.raw_text {
                println!("{}", text);
            }
            summarize(std::slice::from_ref(&answer))
        }
        None => evaluator.run(&items, Some(&mut writer)).await?.1,
    };

    let report_path = run_dir.join("report.json");
    write_report(&report, &report_path)?;
    println!(
        "总体准确率: {:.2}% ({}/{})，报告: {}",
        report.overall_accuracy,
        report.overall.correct,
        report.overall.total,
        report_path.display()
    );
    Ok(())
}
