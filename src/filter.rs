//! Rejects transcriptions that are artifacts of silence or background noise.
//!
//! Speech-to-text models fed near-silence tend to produce the same handful of
//! stock phrases (video sign-offs, subscribe prompts, bare acknowledgements).
//! Anything matching those, or with too little real content, never reaches
//! the conversation log. Dropping an occasional genuine "はい" is acceptable.

use regex::Regex;
use std::sync::OnceLock;

/// Fewer meaningful characters than this is treated as noise.
const MIN_MEANINGFUL_CHARS: usize = 2;

/// Whole-utterance matches, compared after [`normalize`].
const EXACT_NOISE: &[&str] = &[
    // ja
    "ご視聴ありがとうございました",
    "ご視聴ありがとうございます",
    "最後までご視聴ありがとうございました",
    "チャンネル登録よろしくお願いします",
    "チャンネル登録お願いします",
    "おやすみなさい",
    "お疲れ様でした",
    "ありがとうございました",
    "はい",
    "うん",
    "えー",
    "えっと",
    "あー",
    "んー",
    // en
    "thank you",
    "thank you very much",
    "thanks",
    "thanks for watching",
    "thank you for watching",
    "please subscribe",
    "bye",
    "bye bye",
    "you",
    "ok",
    "okay",
    "so",
    // zh/ko sign-offs the multilingual models also emit
    "谢谢观看",
    "시청해주셔서 감사합니다",
];

fn noise_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"ご視聴.*ありがとう",
            r"チャンネル登録",
            r"高評価.*(お願い|よろしく)",
            r"(?i)thanks? (you )?for watching",
            r"(?i)(like and )?subscribe to (my|the|our) channel",
            r"(?i)subtitles? (by|provided by)",
            r"^字幕|字幕(提供|作成|制作|by)",
            r"^[\[(（【]?\s*(音楽|拍手|笑|music|applause|silence)\s*[\])）】]?$",
            r"^[♪♫♬🎵🎶\s]+$",
        ]
        .iter()
        .filter_map(|p| match Regex::new(p) {
            Ok(re) => Some(re),
            Err(e) => {
                log::error!("[filter] bad noise pattern {:?}: {}", p, e);
                None
            }
        })
        .collect()
    })
}

/// Lowercases and strips surrounding whitespace and punctuation.
fn normalize(text: &str) -> String {
    text.trim()
        .trim_matches(|c: char| c.is_whitespace() || is_punctuation(c))
        .to_lowercase()
}

fn is_punctuation(c: char) -> bool {
    c.is_ascii_punctuation()
        || matches!(
            c,
            '。' | '、' | '！' | '？' | '…' | '・' | '「' | '」' | '『' | '』' | '〜' | '～'
        )
}

fn meaningful_chars(text: &str) -> usize {
    text.chars().filter(|c| c.is_alphanumeric()).count()
}

/// True when `text` looks like real speech worth keeping.
pub fn is_valid(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return false;
    }
    // Punctuation, whitespace, symbols only.
    if meaningful_chars(trimmed) < MIN_MEANINGFUL_CHARS {
        return false;
    }
    let normalized = normalize(trimmed);
    if EXACT_NOISE.iter().any(|noise| *noise == normalized) {
        return false;
    }
    !noise_patterns()
        .iter()
        .any(|re| re.is_match(trimmed) || re.is_match(&normalized))
}
