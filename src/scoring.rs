use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::prompt::{option_letter, ASSISTANT_MARKER};

/// 从生成文本中取答案字母：第一个 `ASSISTANT:` 之后的首个非空白字符
///
/// 找不到标记或标记后没有内容时返回 `None`。
pub fn parse_answer(raw_text: &str) -> Option<char> {
    let (_, rest) = raw_text.split_once(ASSISTANT_MARKER)?;
    rest.trim_start().chars().next()
}

/// 答案下标对应的字母（0 -> 'A'，1 -> 'B' ...）
pub fn expected_letter(answer_key_position: usize) -> char {
    option_letter(answer_key_position)
}

pub fn score(parsed: char, expected: char) -> bool {
    parsed == expected
}

/// 单题的处理状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum AnswerStatus {
    Correct,
    Incorrect,
    /// 生成文本里找不到答案
    Unparsed,
    /// 视频获取失败，未推理
    Skipped(String),
    /// 抽帧或推理出错
    Errored(String),
}

/// 单题结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedAnswer {
    /// 数据集中的下标
    pub index: usize,
    pub category: String,
    pub visually_reliant: bool,
    pub expected: char,
    pub raw_text: Option<String>,
    pub parsed: Option<char>,
    #[serde(flatten)]
    pub status: AnswerStatus,
}

impl GeneratedAnswer {
    /// 由生成文本得到结果
    pub fn from_generation(
        index: usize,
        category: &str,
        visually_reliant: bool,
        expected: char,
        raw_text: String,
    ) -> Self {
        let parsed = parse_answer(&raw_text);
        let status = match parsed {
            Some(letter) if score(letter, expected) => AnswerStatus::Correct,
            Some(_) => AnswerStatus::Incorrect,
            None => AnswerStatus::Unparsed,
        };
        Self {
            index,
            category: category.to_string(),
            visually_reliant,
            expected,
            raw_text: Some(raw_text),
            parsed,
            status,
        }
    }

    /// 未产生生成文本的结果（跳过或出错）
    pub fn without_generation(
        index: usize,
        category: &str,
        visually_reliant: bool,
        expected: char,
        status: AnswerStatus,
    ) -> Self {
        Self {
            index,
            category: category.to_string(),
            visually_reliant,
            expected,
            raw_text: None,
            parsed: None,
            status,
        }
    }

    pub fn is_correct(&self) -> bool {
        self.status == AnswerStatus::Correct
    }
}

/// 计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Tally {
    pub total: usize,
    pub correct: usize,
}

impl Tally {
    pub fn record(&mut self, correct: bool) {
        self.total += 1;
        if correct {
            self.correct += 1;
        }
    }

    /// 百分比；没有样本时为 0
    pub fn accuracy(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            100.0 * self.correct as f64 / self.total as f64
        }
    }
}

/// 按类别累计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryTally {
    pub categories: BTreeMap<String, Tally>,
}

impl CategoryTally {
    pub fn record(&mut self, category: &str, correct: bool) {
        self.categories.entry(category.to_string()).or_default().record(correct);
    }

    pub fn accuracies(&self) -> BTreeMap<String, f64> {
        self.categories
            .iter()
            .map(|(name, tally)| (name.clone(), tally.accuracy()))
            .collect()
    }
}

/// 汇总报告
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub overall: Tally,
    pub overall_accuracy: f64,
    pub per_category: BTreeMap<String, f64>,
    pub category_counts: CategoryTally,
    /// 只统计依赖画面的题目
    pub visual_subset: Tally,
    pub visual_accuracy: f64,
    pub skipped: usize,
    pub errored: usize,
    pub unparsed: usize,
    pub generated_at: String,
}

/// 按数据集顺序汇总；跳过和出错的题目计入分母、不计正确
pub fn summarize(answers: &[GeneratedAnswer]) -> EvaluationReport {
    let mut overall = Tally::default();
    let mut categories = CategoryTally::default();
    let mut visual = Tally::default();
    let (mut skipped, mut errored, mut unparsed) = (0, 0, 0);

    for answer in answers {
        let correct = answer.is_correct();
        overall.record(correct);
        categories.record(&answer.category, correct);
        if answer.visually_reliant {
            visual.record(correct);
        }
        match answer.status {
            AnswerStatus::Skipped(_) => skipped += 1,
            AnswerStatus::Errored(_) => errored += 1,
            AnswerStatus::Unparsed => unparsed += 1,
            AnswerStatus::Correct | AnswerStatus::Incorrect => {}
        }
    }

    EvaluationReport {
        overall,
        overall_accuracy: overall.accuracy(),
        per_category: categories.accuracies(),
        category_counts: categories,
        visual_subset: visual,
        visual_accuracy: visual.accuracy(),
        skipped,
        errored,
        unparsed,
        generated_at: chrono::Utc::now().to_rfc3339(),
    }
}
