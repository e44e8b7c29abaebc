use anyhow::{Context, Result};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 远程视频引用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoReference {
    pub remote_url: String,
    /// 本地标识，决定缓存路径
    pub local_identifier: String,
}

impl VideoReference {
    /// 根据链接（或退回标题）生成确定性的本地标识
    pub fn new(remote_url: &str, title: &str) -> Self {
        let local_identifier = youtube_id(remote_url)
            .map(sanitize_identifier)
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| sanitize_identifier(title));
        Self {
            remote_url: remote_url.to_string(),
            local_identifier,
        }
    }

    /// `{video_dir}/{identifier}.mp4`
    pub fn video_path(&self, video_dir: &Path) -> PathBuf {
        video_dir.join(format!("{}.mp4", self.local_identifier))
    }

    /// `{frames_root}/_{identifier}`
    pub fn frames_dir(&self, frames_root: &Path) -> PathBuf {
        frames_root.join(format!("_{}", self.local_identifier))
    }
}

/// 从 YouTube 链接中取视频 ID
fn youtube_id(url: &str) -> Option<&str> {
    let url = url.trim();
    // 只认独立的 `v` 参数，`dev=` 之类不算
    let query_id = ["?v=", "&v="].iter().filter_map(|p| url.find(*p)).min();
    let id = if let Some(pos) = query_id {
        &url[pos + 3..]
    } else if let Some(pos) = url.find("youtu.be/") {
        &url[pos + "youtu.be/".len()..]
    } else if let Some(pos) = url.find("/shorts/") {
        &url[pos + "/shorts/".len()..]
    } else {
        return None;
    };
    let end = id.find(|c: char| matches!(c, '&' | '?' | '#' | '/')).unwrap_or(id.len());
    Some(&id[..end])
}

/// 只保留文件名安全的字符
fn sanitize_identifier(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// 评测题目（来自基准数据集，只读）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationItem {
    pub question: String,
    #[serde(alias = "candidates", alias = "choices")]
    pub options: Vec<String>,
    /// 正确选项的下标（从 0 开始）
    #[serde(alias = "answer_key_position", alias = "answer_idx")]
    pub answer: usize,
    #[serde(default)]
    pub subtitles: String,
    #[serde(alias = "question_category", alias = "type")]
    pub category: String,
    #[serde(default, alias = "requires_visual", alias = "visual_reliance")]
    pub visually_reliant: bool,
    #[serde(default, alias = "title", alias = "yt_clip_title")]
    pub video_title: String,
    #[serde(alias = "link", alias = "url", alias = "yt_clip_link")]
    pub video_link: String,
}

impl EvaluationItem {
    pub fn video_reference(&self) -> VideoReference {
        VideoReference::new(&self.video_link, &self.video_title)
    }
}

/// 加载数据集：JSON 数组或 JSON Lines
pub fn load_dataset(path: impl AsRef<Path>) -> Result<Vec<EvaluationItem>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("读取数据集失败: {}", path.display()))?;
    parse_dataset(&content).with_context(|| format!("解析数据集失败: {}", path.display()))
}

pub fn parse_dataset(content: &str) -> Result<Vec<EvaluationItem>> {
    let trimmed = content.trim_start();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).context("JSON 数组格式错误");
    }

    trimmed
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).with_context(|| format!("第 {} 行格式错误", i + 1))
        })
        .collect()
}

/// 用显式种子选一道题，保证可复现
pub fn pick_index(len: usize, seed: u64) -> Option<usize> {
    if len == 0 {
        return None;
    }
    let mut rng = StdRng::seed_from_u64(seed);
    Some(rng.gen_range(0..len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_youtube_identifiers() {
        let r = VideoReference::new("https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=10", "x");
        assert_eq!(r.local_identifier, "dQw4w9WgXcQ");
        let r = VideoReference::new("https://youtu.be/abc123XYZ?si=foo", "x");
        assert_eq!(r.local_identifier, "abc123XYZ");
        let r = VideoReference::new("https://www.youtube.com/shorts/short_01", "x");
        assert_eq!(r.local_identifier, "short_01");
        let r = VideoReference::new("https://www.youtube.com/watch?dev=1&v=Zx9_abc&list=L", "x");
        assert_eq!(r.local_identifier, "Zx9_abc");
        let r = VideoReference::new("https://www.youtube.com/watch?dev=1", "fallback title");
        assert_eq!(r.local_identifier, "fallback_title");
    }

    #[test]
    fn test_identifier_falls_back_to_title() {
        let r = VideoReference::new("https://example.com/video", "Episode 3: The Plan");
        assert_eq!(r.local_identifier, "Episode_3__The_Plan");
    }

    #[test]
    fn test_cache_paths() {
        let r = VideoReference::new("https://youtu.be/abc", "t");
        assert_eq!(
            r.video_path(Path::new("/data/videos")),
            PathBuf::from("/data/videos/abc.mp4")
        );
        assert_eq!(
            r.frames_dir(Path::new("/data/videos_frames")),
            PathBuf::from("/data/videos_frames/_abc")
        );
    }

    #[test]
    fn test_parse_json_lines_with_aliases() {
        let content = r#"
{"question":"Who enters first?","candidates":["Ann","Bob"],"answer":1,"subtitles":"hi","question_category":"visual","requires_visual":true,"title":"ep1","link":"https://youtu.be/a1"}

{"question":"What is said?","options":["yes","no"],"answer":0,"category":"dialogue","video_link":"https://youtu.be/b2"}
"#;
        let items = parse_dataset(content).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].options, vec!["Ann", "Bob"]);
        assert!(items[0].visually_reliant);
        assert_eq!(items[1].category, "dialogue");
        assert!(!items[1].visually_reliant);
        assert_eq!(items[1].subtitles, "");
    }

    #[test]
    fn test_parse_cinepile_columns() {
        let content = r#"{"question":"What colour is the car?","choices":["red","blue","green","white","black"],"answer_key_position":2,"subtitles":"Nice ride.","question_category":"Setting and Technical Analysis","visual_reliance":true,"yt_clip_title":"Heat (1995) - Car Scene","yt_clip_link":"https://www.youtube.com/watch?v=Q1w2E3r4T5y"}"#;
        let items = parse_dataset(content).unwrap();
        assert_eq!(items[0].answer, 2);
        assert_eq!(items[0].video_title, "Heat (1995) - Car Scene");
        assert_eq!(items[0].video_reference().local_identifier, "Q1w2E3r4T5y");
    }

    #[test]
    fn test_parse_json_array() {
        let content = r#"[{"question":"q","options":["a"],"answer":0,"category":"c","video_link":"u"}]"#;
        assert_eq!(parse_dataset(content).unwrap().len(), 1);
    }

    #[test]
    fn test_bad_line_reports_line_number() {
        let err = parse_dataset("{\"question\":1}\n").unwrap_err();
        assert!(format!("{:#}", err).contains("第 1 行"));
    }

    #[test]
    fn test_pick_index_is_seeded() {
        assert_eq!(pick_index(0, 7), None);
        let a = pick_index(100, 42).unwrap();
        let b = pick_index(100, 42).unwrap();
        assert_eq!(a, b);
        assert!(a < 100);
    }
}
