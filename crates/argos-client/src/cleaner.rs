use std::sync::Arc;

use argos_core::error::AppError;
use argos_core::traits::Cleaner;
use htmd::HtmlToMarkdown;

/// HTML-to-Markdown cleaner using htmd.
///
/// Drops page chrome and scripts so the AI fallback pays only for content.
#[derive(Clone)]
pub struct HtmdCleaner {
    converter: Arc<HtmlToMarkdown>,
}

impl HtmdCleaner {
    pub fn new() -> Self {
        let converter = HtmlToMarkdown::builder()
            .skip_tags(vec![
                "script", "style", "nav", "footer", "header", "aside", "noscript", "iframe", "svg",
                "form", "button",
            ])
            .build();

        Self {
            converter: Arc::new(converter),
        }
    }
}

impl Default for HtmdCleaner {
    fn default() -> Self {
        Self::new()
    }
}

impl Cleaner for HtmdCleaner {
    fn clean(&self, html: &str) -> Result<String, AppError> {
        // JSON documents are already text.
        let trimmed = html.trim_start();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            return Ok(html.to_string());
        }
        self.converter
            .convert(html)
            .map(|md| md.trim().to_string())
            .map_err(|e| AppError::CleanerError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_headings_and_paragraphs() {
        let md = HtmdCleaner::new()
            .clean("<h1>WO2016012345</h1><p>Crystalline form of a kinase inhibitor</p>")
            .unwrap();
        assert!(md.contains("WO2016012345"));
        assert!(md.contains("Crystalline form"));
    }

    #[test]
    fn strips_scripts_and_navigation() {
        let md = HtmdCleaner::new()
            .clean("<nav>Home | About</nav><p>Abstract</p><script>track()</script>")
            .unwrap();
        assert!(md.contains("Abstract"));
        assert!(!md.contains("track"));
        assert!(!md.contains("About"));
    }

    #[test]
    fn json_passes_through() {
        let json = r#"{"Record":{"RecordTitle":"x"}}"#;
        assert_eq!(HtmdCleaner::new().clean(json).unwrap(), json);
    }
}
