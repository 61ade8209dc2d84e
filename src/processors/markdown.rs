//! Markdown and plain-text documents as a source of translatable text units

use pulldown_cmark::{Event, Options, Parser, Tag, TagEnd};
use std::ops::Range;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::core::errors::{Result, TranslationError};
use crate::orchestrator::{Orchestrator, Progress, RunStats, TranslationRun};

/// How a document is split into text units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Markdown,
    PlainText,
}

impl DocumentFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_string_lossy().to_lowercase();
        match ext.as_str() {
            "md" | "markdown" => Some(DocumentFormat::Markdown),
            "txt" => Some(DocumentFormat::PlainText),
            _ => None,
        }
    }
}

fn has_letters(text: &str) -> bool {
    text.chars().any(char::is_alphabetic)
}

/// Byte ranges of translatable text in a Markdown document.
///
/// Code blocks, inline code, HTML and front matter are skipped. Adjacent
/// text events (including soft breaks) merge into one unit; any other markup
/// ends the unit.
pub fn markdown_units(content: &str) -> Vec<Range<usize>> {
    let options = Options::ENABLE_YAML_STYLE_METADATA_BLOCKS
        | Options::ENABLE_TABLES
        | Options::ENABLE_STRIKETHROUGH;

    let mut units = Vec::new();
    let mut current: Option<Range<usize>> = None;
    let mut skip_depth = 0usize;

    let mut flush = |current: &mut Option<Range<usize>>| {
        if let Some(range) = current.take() {
            if has_letters(&content[range.clone()]) {
                units.push(range);
            }
        }
    };

    for (event, range) in Parser::new_ext(content, options).into_offset_iter() {
        match event {
            Event::Start(Tag::CodeBlock(_) | Tag::HtmlBlock | Tag::MetadataBlock(_)) => {
                flush(&mut current);
                skip_depth += 1;
            }
            Event::End(TagEnd::CodeBlock | TagEnd::HtmlBlock | TagEnd::MetadataBlock(_)) => {
                skip_depth = skip_depth.saturating_sub(1);
            }
            Event::Text(_) | Event::SoftBreak if skip_depth == 0 => match current.as_mut() {
                Some(open) if open.end == range.start => open.end = range.end,
                _ => {
                    flush(&mut current);
                    current = Some(range);
                }
            },
            _ => flush(&mut current),
        }
    }
    flush(&mut current);
    units
}

/// Paragraphs separated by blank lines
pub fn plain_text_units(content: &str) -> Vec<Range<usize>> {
    let mut units = Vec::new();
    let mut start: Option<usize> = None;
    let mut offset = 0;

    for line in content.split_inclusive('\n') {
        let blank = line.trim().is_empty();
        match (start, blank) {
            (None, false) => start = Some(offset),
            (Some(s), true) => {
                units.push(s..offset);
                start = None;
            }
            _ => {}
        }
        offset += line.len();
    }
    if let Some(s) = start {
        units.push(s..content.len());
    }
    units.retain(|range| has_letters(&content[range.clone()]));
    units
}

/// Replace every unit with its translation, keeping surrounding whitespace
pub fn splice<'a>(
    content: &str,
    units: &[Range<usize>],
    translation: impl Fn(usize) -> Option<&'a str>,
) -> String {
    let mut out = String::with_capacity(content.len());
    let mut cursor = 0;

    for (index, range) in units.iter().enumerate() {
        let Some(text) = translation(index) else {
            continue;
        };
        let original = &content[range.clone()];
        let lead = original.len() - original.trim_start().len();
        let trail = original.len() - original.trim_end().len();

        out.push_str(&content[cursor..range.start + lead]);
        out.push_str(text);
        cursor = range.end - trail;
    }
    out.push_str(&content[cursor..]);
    out
}

/// A document whose units are registered in a run but not yet translated
#[derive(Debug)]
pub struct PreparedDocument<'a> {
    content: &'a str,
    units: Vec<Range<usize>>,
    run: TranslationRun,
    created: Vec<String>,
}

impl PreparedDocument<'_> {
    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    /// Progress of the translation once driven
    pub fn progress(&self) -> watch::Receiver<Progress> {
        self.run.subscribe()
    }

    pub fn total(&self) -> usize {
        self.run.progress().total
    }
}

/// Translates Markdown and plain-text files through the orchestrator
#[derive(Debug)]
pub struct MarkdownProcessor {
    orchestrator: Orchestrator,
}

impl MarkdownProcessor {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }

    /// Find supported files in directory
    pub fn find_files(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        if !dir.is_dir() {
            return Err(TranslationError::FileError {
                path: dir.display().to_string(),
                message: "Not a directory".to_string(),
            });
        }

        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && Self::is_supported_file(&path) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Find supported files recursively
    pub fn find_files_recursive(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        if !dir.is_dir() {
            return Err(TranslationError::FileError {
                path: dir.display().to_string(),
                message: "Not a directory".to_string(),
            });
        }

        let files = walkdir::WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|entry| entry.into_path())
            .filter(|path| path.is_file() && Self::is_supported_file(path))
            .collect();
        Ok(files)
    }

    pub fn is_supported_file(path: &Path) -> bool {
        DocumentFormat::from_path(path).is_some()
    }

    /// Discover units and register them in a fresh run
    pub fn prepare<'a>(&self, content: &'a str, target_lang: &str, format: DocumentFormat) -> PreparedDocument<'a> {
        let units = match format {
            DocumentFormat::Markdown => markdown_units(content),
            DocumentFormat::PlainText => plain_text_units(content),
        };
        let mut run = TranslationRun::new(target_lang);
        let created = run.ingest(
            units
                .iter()
                .enumerate()
                .map(|(owner, range)| (owner, &content[range.clone()])),
        );
        debug!(units = units.len(), items = created.len(), "Document prepared");
        PreparedDocument {
            content,
            units,
            run,
            created,
        }
    }

    /// Drive a prepared document and splice the translations back
    pub async fn complete(&self, prepared: PreparedDocument<'_>) -> (String, RunStats) {
        let PreparedDocument {
            content,
            units,
            mut run,
            created,
        } = prepared;
        let stats = self.orchestrator.drive(&mut run, created).await;
        let output = splice(content, &units, |owner| run.translation_for(owner));
        (output, stats)
    }

    pub async fn translate_content(
        &self,
        content: &str,
        target_lang: &str,
        format: DocumentFormat,
    ) -> (String, RunStats) {
        let prepared = self.prepare(content, target_lang, format);
        self.complete(prepared).await
    }

    /// Translate a single file
    pub async fn translate_file(&self, input: &Path, output: &Path, target_lang: &str) -> Result<RunStats> {
        let format = DocumentFormat::from_path(input).unwrap_or(DocumentFormat::PlainText);
        let content = read_document(input).await?;
        let (translated, stats) = self.translate_content(&content, target_lang, format).await;
        write_document(output, &translated).await?;
        info!("Translated: {} -> {}", input.display(), output.display());
        Ok(stats)
    }
}

/// Read a document, mapping failures to `FileError`
pub async fn read_document(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| TranslationError::FileError {
            path: path.display().to_string(),
            message: e.to_string(),
        })
}

/// Write a document, creating parent directories
pub async fn write_document(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !parent.exists() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TranslationError::FileError {
                    path: parent.display().to_string(),
                    message: e.to_string(),
                })?;
        }
    }
    tokio::fs::write(path, content)
        .await
        .map_err(|e| TranslationError::FileError {
            path: path.display().to_string(),
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::BatchSettings;
    use crate::core::dispatch::BatchTranslate;
    use crate::core::models::{BatchItem, BatchTranslateRequest, BatchTranslation};
    use async_trait::async_trait;
    use std::sync::Arc;

    const DOC: &str = r#"---
title: "Test"
---

# Hello World

This is a `code` span and a [useful link](https://example.com).

```rust
fn main() {
    println!("Hello");
}
```

<div>raw html</div>

- 42
- Second item
"#;

    fn texts(content: &str, units: &[Range<usize>]) -> Vec<String> {
        units.iter().map(|r| content[r.clone()].to_string()).collect()
    }

    struct Upper;

    #[async_trait]
    impl BatchTranslate for Upper {
        async fn translate_batch(&self, request: BatchTranslateRequest) -> crate::core::errors::Result<BatchTranslation> {
            Ok(BatchTranslation {
                translations: request
                    .items
                    .iter()
                    .map(|item| BatchItem::new(item.id.clone(), item.text.to_uppercase()))
                    .collect(),
                channel: "t".to_string(),
                model: "t".to_string(),
            })
        }
    }

    #[test]
    fn test_markdown_units_skip_code_html_and_front_matter() {
        let units = texts(DOC, &markdown_units(DOC));
        assert_eq!(
            units,
            vec![
                "Hello World",
                "This is a ",
                " span and a ",
                "useful link",
                ".",
                "Second item",
            ]
            .into_iter()
            .filter(|t| has_letters(t))
            .map(String::from)
            .collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_soft_breaks_merge() {
        let content = "First line\nsecond line\n\nNext paragraph\n";
        let units = texts(content, &markdown_units(content));
        assert_eq!(units, vec!["First line\nsecond line", "Next paragraph"]);
    }

    #[test]
    fn test_plain_text_paragraphs() {
        let content = "One\ntwo\n\n\n123\n\nThree";
        let units = texts(content, &plain_text_units(content));
        assert_eq!(units, vec!["One\ntwo\n", "Three"]);
    }

    #[test]
    fn test_splice_preserves_whitespace() {
        let content = "a  Hello  b";
        let units = vec![1..10];
        let out = splice(content, &units, |_| Some("Bonjour"));
        assert_eq!(out, "a  Bonjour  b");

        let skipped = splice(content, &units, |_| None);
        assert_eq!(skipped, content);
    }

    #[tokio::test]
    async fn test_translate_markdown_document() {
        let orchestrator = Orchestrator::new(Arc::new(Upper), None, BatchSettings::default());
        let processor = MarkdownProcessor::new(orchestrator);

        let (out, stats) = processor
            .translate_content(DOC, "fr", DocumentFormat::Markdown)
            .await;

        assert!(out.contains("# HELLO WORLD"));
        assert!(out.contains("This is a".to_uppercase().as_str()));
        assert!(out.contains("`code`"));
        assert!(out.contains("[USEFUL LINK](https://example.com)"));
        assert!(out.contains("println!(\"Hello\");"));
        assert!(out.contains("<div>raw html</div>"));
        assert!(out.contains("title: \"Test\""));
        assert!(out.contains("- 42\n- SECOND ITEM"));
        assert_eq!(stats.translated, 5);
    }

    #[tokio::test]
    async fn test_translate_file_and_find_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.md"), "# Title\n").unwrap();
        std::fs::write(dir.path().join("b.txt"), "plain words\n").unwrap();
        std::fs::write(dir.path().join("c.rs"), "fn x() {}").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("d.markdown"), "Deep").unwrap();

        let orchestrator = Orchestrator::new(Arc::new(Upper), None, BatchSettings::default());
        let processor = MarkdownProcessor::new(orchestrator);
        assert_eq!(processor.find_files(dir.path()).unwrap().len(), 2);
        assert_eq!(processor.find_files_recursive(dir.path()).unwrap().len(), 3);
        assert!(processor.find_files(&dir.path().join("a.md")).is_err());

        let output = dir.path().join("out").join("b.fr.txt");
        processor
            .translate_file(&dir.path().join("b.txt"), &output, "fr")
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(output).unwrap(), "PLAIN WORDS\n");
    }

    #[test]
    fn test_document_format() {
        assert_eq!(DocumentFormat::from_path(Path::new("x.MD")), Some(DocumentFormat::Markdown));
        assert_eq!(DocumentFormat::from_path(Path::new("x.markdown")), Some(DocumentFormat::Markdown));
        assert_eq!(DocumentFormat::from_path(Path::new("x.txt")), Some(DocumentFormat::PlainText));
        assert_eq!(DocumentFormat::from_path(Path::new("x.html")), None);
    }
}
