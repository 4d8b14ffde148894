//! Compiled pattern tables used by the security validator.

use regex::Regex;

/// A named regex.
#[derive(Debug, Clone)]
pub struct NamedPattern {
    /// Threat name reported to callers.
    pub name: &'static str,
    /// Compiled expression.
    pub regex: Regex,
}

/// A named regex with an injection weight.
#[derive(Debug, Clone)]
pub struct WeightedPattern {
    /// Pattern name reported in detection results.
    pub name: &'static str,
    /// Compiled expression.
    pub regex: Regex,
    /// Contribution to the injection confidence.
    pub weight: f64,
}

/// A redaction rule.
#[derive(Debug, Clone)]
pub struct MaskPattern {
    /// Compiled expression.
    pub regex: Regex,
    /// Replacement text.
    pub replacement: &'static str,
}

const BLOCKLIST: &[(&str, &str)] = &[
    ("script_tag", r"(?i)<\s*/?\s*script\b"),
    ("embedded_frame", r"(?i)<\s*(iframe|object|embed)\b"),
    ("javascript_uri", r"(?i)javascript\s*:"),
    ("data_html_uri", r"(?i)data\s*:\s*text/html"),
    ("event_handler", r#"(?i)<[^>]*\bon[a-z]+\s*="#),
    ("code_execution", r"(?i)\b(eval|exec|system)\s*\("),
    ("sql_union_select", r"(?i)\bunion\s+(all\s+)?select\b"),
    ("sql_drop", r"(?i)\bdrop\s+(table|database)\b"),
    ("sql_tautology", r"(?i)'\s*or\s*'?1'?\s*=\s*'?1"),
    ("path_traversal", r"\.\./|\.\.\\"),
];

const SUSPICIOUS: &[(&str, &str)] = &[
    ("email_address", r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}"),
    ("url", r"(?i)\bhttps?://\S+"),
    ("ip_address", r"\b(?:\d{1,3}\.){3}\d{1,3}\b"),
    ("api_key", r"\bsk-[A-Za-z0-9_-]{16,}"),
    (
        "credential_assignment",
        r"(?i)\b(api[_-]?key|secret|password|access[_-]?token)\s*[:=]\s*\S+",
    ),
    ("bearer_token", r"(?i)\bbearer\s+[A-Za-z0-9._~+/-]{16,}=*"),
];

const INJECTION: &[(&str, &str, f64)] = &[
    (
        "instruction_override",
        r"(?i)\b(ignore|disregard|forget|override)\b.{0,40}\b(previous|prior|above|earlier|all)\b.{0,40}\b(instructions?|prompts?|rules?|directions?)\b",
        0.6,
    ),
    (
        "system_prompt_extraction",
        r"(?i)\b(reveal|show|print|repeat|output)\b.{0,40}\b(system\s+prompt|your\s+instructions|hidden\s+prompt)\b",
        0.5,
    ),
    (
        "role_reassignment",
        r"(?i)\byou\s+are\s+now\b|\bact\s+as\s+(an?\s+)?(unrestricted|different|new)\b|\bpretend\s+(to\s+be|you\s+are)\b",
        0.4,
    ),
    ("jailbreak_phrase", r"(?i)\b(jailbreak|dan\s+mode|developer\s+mode)\b", 0.5),
    ("role_marker", r"(?im)^\s*(system|assistant)\s*:", 0.3),
    (
        "special_token",
        r"(?i)<\|(im_start|im_end|system|endoftext)\|>|\[/?INST\]|<<\s*/?SYS\s*>>",
        0.7,
    ),
    ("code_fence", r"```", 0.1),
];

const MASKS: &[(&str, &str)] = &[
    (r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}", "[EMAIL]"),
    (r"\b\d{3}-\d{2}-\d{4}\b", "[SSN]"),
    (r"\b(?:\d[ -]?){12,15}\d\b", "[CARD]"),
    (
        r"(?:\+\d{1,3}[\s.-]?)?\(?\b\d{3}\)?[\s.-]?\d{3}[\s.-]?\d{4}\b",
        "[PHONE]",
    ),
    (r"\bsk-[A-Za-z0-9_-]{16,}", "[TOKEN]"),
    (r"\b[A-Za-z0-9_-]{32,}\b", "[TOKEN]"),
];

fn named(table: &[(&'static str, &str)]) -> Result<Vec<NamedPattern>, regex::Error> {
    table
        .iter()
        .map(|(name, re)| {
            Ok(NamedPattern {
                name: *name,
                regex: Regex::new(re)?,
            })
        })
        .collect()
}

/// Every pattern table, compiled once per validator.
#[derive(Debug, Clone)]
pub struct Patterns {
    /// Immediate-block patterns.
    pub blocklist: Vec<NamedPattern>,
    /// Risk-raising patterns.
    pub suspicious: Vec<NamedPattern>,
    /// Weighted prompt-injection patterns.
    pub injection: Vec<WeightedPattern>,
    /// Redaction rules, applied in order.
    pub masks: Vec<MaskPattern>,
    /// Tag-like markup stripped from sanitized content.
    pub html_tag: Regex,
    /// Accepted session-id format.
    pub session_id: Regex,
    /// Accepted `provider/model[:variant]` format.
    pub model_name: Regex,
}

impl Patterns {
    /// Compile every table.
    ///
    /// # Errors
    ///
    /// Returns the first [`regex::Error`] encountered.
    pub fn compile() -> Result<Self, regex::Error> {
        let injection = INJECTION
            .iter()
            .map(|(name, re, weight)| {
                Ok(WeightedPattern {
                    name: *name,
                    regex: Regex::new(re)?,
                    weight: *weight,
                })
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;

        let masks = MASKS
            .iter()
            .map(|(re, replacement)| {
                Ok(MaskPattern {
                    regex: Regex::new(re)?,
                    replacement: *replacement,
                })
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;

        Ok(Self {
            blocklist: named(BLOCKLIST)?,
            suspicious: named(SUSPICIOUS)?,
            injection,
            masks,
            html_tag: Regex::new(r"</?[A-Za-z][^>]*>")?,
            session_id: Regex::new(r"^[A-Za-z0-9_-]{8,128}$")?,
            model_name: Regex::new(
                r"^[A-Za-z0-9][A-Za-z0-9._-]*/[A-Za-z0-9][A-Za-z0-9._-]*(?::[A-Za-z0-9_-]+)?$",
            )?,
        })
    }
}
