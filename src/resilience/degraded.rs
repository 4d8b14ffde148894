//! Canned placeholder content returned when every upstream path has failed.

use crate::{OperationKind, SectionType};

/// Prefix that marks every degraded payload.
pub const DEGRADED_MARKER: &str = "[Degraded response]";

/// Static, clearly labelled fallback text for `op`.
pub fn degraded_content(op: OperationKind, section: Option<SectionType>) -> String {
    let body = match op {
        OperationKind::Analyze => {
            "The analysis service is temporarily unavailable. Check that the document \
             lists measurable achievements, mirrors keywords from the target role and \
             uses standard section headings."
                .to_string()
        }
        OperationKind::GenerateSection => {
            let name = section.map(|s| s.as_str()).unwrap_or("section");
            format!(
                "Content generation for the {name} section is temporarily unavailable. \
                 Please write this section manually or try again in a few minutes."
            )
        }
        OperationKind::Optimize => {
            "Optimization is temporarily unavailable. Your original content was left \
             unchanged; please try again later."
                .to_string()
        }
    };
    format!("{DEGRADED_MARKER} {body}")
}

/// Whether `content` was produced by [`degraded_content`].
pub fn is_degraded(content: &str) -> bool {
    content.starts_with(DEGRADED_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_operation_is_labelled() {
        for op in [
            OperationKind::Analyze,
            OperationKind::GenerateSection,
            OperationKind::Optimize,
        ] {
            assert!(is_degraded(&degraded_content(op, None)));
        }
    }

    #[test]
    fn test_section_name_appears() {
        let text = degraded_content(OperationKind::GenerateSection, Some(SectionType::CoverLetter));
        assert!(text.contains("cover_letter"));
    }

    #[test]
    fn test_normal_text_is_not_degraded() {
        assert!(!is_degraded("A strong summary."));
    }
}
