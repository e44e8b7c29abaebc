/// 视频占位符，推理端在此处注入帧特征
pub const VIDEO_TOKEN: &str = "<video>";
/// 用户角色标记
pub const USER_MARKER: &str = "USER:";
/// 助手角色标记，答案解析以它为界
pub const ASSISTANT_MARKER: &str = "ASSISTANT:";
/// 字幕行前缀
pub const SUBTITLE_PREFIX: &str = "Subtitle:";

const SUBTITLE_INTRO: &str = "The subtitles of the video are listed below.";
const MULTIPLE_CHOICE_HINT: &str = "Answer with the option's letter from the given choices directly.";

/// 第 `index` 个选项的字母（从 'A' 开始顺序分配）
pub fn option_letter(index: usize) -> char {
    char::from_u32('A' as u32 + index as u32).unwrap_or('?')
}

/// 问题后跟字母选项，每个选项一行，保持输入顺序
pub fn format_question_and_options(question: &str, options: &[String]) -> String {
    let mut text = question.trim_end().to_string();
    for (i, option) in options.iter().enumerate() {
        text.push('\n');
        text.push(option_letter(i));
        text.push_str(". ");
        text.push_str(option);
    }
    text
}

/// 固定三段式模板：`USER:` + 字幕 + 唯一的视频占位符 + 问题 + `ASSISTANT:`
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    pub video_token: String,
    pub subtitle_prefix: String,
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self {
            video_token: VIDEO_TOKEN.to_string(),
            subtitle_prefix: SUBTITLE_PREFIX.to_string(),
        }
    }
}

impl PromptTemplate {
    /// 组装提示词；字幕原样注入，不做校验
    pub fn build(&self, subtitles: &str, question: &str, options: Option<&[String]>) -> String {
        let mut body = Vec::new();

        let lines: Vec<&str> = subtitles.lines().filter(|l| !l.trim().is_empty()).collect();
        if !lines.is_empty() {
            body.push(SUBTITLE_INTRO.to_string());
            for line in lines {
                body.push(format!("{} {}", self.subtitle_prefix, line));
            }
        }

        body.push(self.video_token.clone());

        match options {
            Some(options) => {
                body.push(format_question_and_options(question, options));
                body.push(MULTIPLE_CHOICE_HINT.to_string());
            }
            None => body.push(question.trim_end().to_string()),
        }

        format!("{} {} {}", USER_MARKER, body.join("\n"), ASSISTANT_MARKER)
    }
}

pub fn build_prompt(template: &PromptTemplate, subtitles: &str, question: &str, options: Option<&[String]>) -> String {
    template.build(subtitles, question, options)
}

/// 字幕中出现控制标记会破坏后续解析
pub fn contains_control_tokens(text: &str) -> bool {
    text.contains(VIDEO_TOKEN) || text.contains(ASSISTANT_MARKER) || text.contains(USER_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_options_lettered_in_order() {
        let text = format_question_and_options("Which animal?", &opts(&["cat", "dog", "bird"]));
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec!["Which animal?", "A. cat", "B. dog", "C. bird"]);
    }

    #[test]
    fn test_letters_continue_past_five() {
        assert_eq!(option_letter(0), 'A');
        assert_eq!(option_letter(4), 'E');
        assert_eq!(option_letter(7), 'H');
    }

    #[test]
    fn test_prompt_structure() {
        let template = PromptTemplate::default();
        let prompt = template.build("hello there\n\ngeneral kenobi", "Who speaks?", Some(opts(&["x", "y"]).as_slice()));

        assert!(prompt.starts_with("USER: "));
        assert!(prompt.ends_with("ASSISTANT:"));
        assert_eq!(prompt.matches(VIDEO_TOKEN).count(), 1);
        assert!(prompt.contains("Subtitle: hello there\nSubtitle: general kenobi\n<video>\nWho speaks?\nA. x\nB. y"));

        let video_at = prompt.find(VIDEO_TOKEN).unwrap();
        assert!(prompt.find("Subtitle:").unwrap() < video_at);
        assert!(video_at < prompt.find("Who speaks?").unwrap());
    }

    #[test]
    fn test_open_question_without_subtitles() {
        let prompt = build_prompt(&PromptTemplate::default(), "", "What happens?", None);
        assert_eq!(prompt, "USER: <video>\nWhat happens? ASSISTANT:");
    }

    #[test]
    fn test_control_token_detection() {
        assert!(contains_control_tokens("then ASSISTANT: said"));
        assert!(contains_control_tokens("a <video> b"));
        assert!(!contains_control_tokens("plain dialogue"));
    }
}
