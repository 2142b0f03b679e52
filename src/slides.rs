use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};
use serde::{Deserialize, Serialize};
use serde_json::ser::PrettyFormatter;

use crate::atomic::write_atomic;
use crate::report::BatchReport;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slide {
    pub name: String,
    pub english: String,
    pub translation: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SlidesFile {
    slides: Vec<Slide>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SlideField {
    #[default]
    Translation,
    English,
}

impl SlideField {
    pub fn text<'a>(&self, slide: &'a Slide) -> &'a str {
        match self {
            Self::Translation => &slide.translation,
            Self::English => &slide.english,
        }
    }
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|error| anyhow!("invalid selector '{css}': {error}"))
}

fn cell_text(cell: ElementRef<'_>) -> String {
    cell.text().collect::<String>().trim().to_owned()
}

/// Rows of the first `<table>` after its header row. Rows with fewer than three cells
/// are ignored.
pub fn parse_slides_table(html: &str) -> Result<Vec<Slide>> {
    let document = Html::parse_document(html);
    let table = document
        .select(&selector("table")?)
        .next()
        .ok_or_else(|| anyhow!("document has no <table>"))?;
    let rows = selector("tr")?;
    let cells = selector("td, th")?;

    let mut slides = Vec::new();
    for row in table.select(&rows).skip(1) {
        let values = row.select(&cells).map(cell_text).collect::<Vec<_>>();
        let [name, english, translation, ..] = values.as_slice() else {
            tracing::debug!(cells = values.len(), "skipping short table row");
            continue;
        };
        slides.push(Slide {
            name: name.clone(),
            english: english.clone(),
            translation: translation.clone(),
        });
    }
    Ok(slides)
}

/// Pretty JSON with a 4-space indent; non-ASCII text is written as-is.
pub fn slides_json(slides: &[Slide]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut serializer =
        serde_json::Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b"    "));
    SlidesFile {
        slides: slides.to_vec(),
    }
    .serialize(&mut serializer)
    .context("failed to serialize slides")?;
    out.push(b'\n');
    Ok(out)
}

pub fn extract(html_path: &Path, output: &Path) -> Result<usize> {
    let html = fs::read_to_string(html_path)
        .with_context(|| format!("failed to read {}", html_path.display()))?;
    let slides = parse_slides_table(&html)
        .with_context(|| format!("failed to extract slides from {}", html_path.display()))?;
    write_atomic(output, &slides_json(&slides)?)?;
    Ok(slides.len())
}

pub fn load_slides(path: &Path) -> Result<Vec<Slide>> {
    let raw =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let file: SlidesFile = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse slides file {}", path.display()))?;
    Ok(file.slides)
}

/// `1.2 Intro!` -> `1_2 Intro`.
pub fn clean_filename(name: &str) -> String {
    let kept = name
        .replace('.', "_")
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-' || c.is_whitespace())
        .collect::<String>();
    kept.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Writes each slide's translation to `<json dir>/output/<clean name>.txt`.
pub fn write_texts(slides_path: &Path) -> Result<BatchReport> {
    let slides = load_slides(slides_path)?;
    let output_dir = slides_output_dir(slides_path);
    fs::create_dir_all(&output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;

    let mut report = BatchReport::new("slides text");
    for slide in &slides {
        let output = output_dir.join(format!("{}.txt", clean_filename(&slide.name)));
        let text = slide.translation.replace("\\n", "");
        match write_atomic(&output, text.as_bytes()) {
            Ok(()) => report.ok(&output, slide.name.clone()),
            Err(error) => report.failed(&output, &error),
        }
    }
    Ok(report)
}

pub fn slides_output_dir(slides_path: &Path) -> PathBuf {
    slides_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("output")
}

fn mp4_regex() -> &'static Regex {
    static MP4_RE: OnceLock<Regex> = OnceLock::new();
    MP4_RE.get_or_init(|| Regex::new(r"(?i)[\w\-.]+\.MP4").expect("mp4 regex should compile"))
}

/// Unique, sorted `.mp4` names mentioned in text or attribute values.
pub fn scan_mp4_names(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let regex = mp4_regex();
    let mut names = BTreeSet::new();
    let mut collect = |haystack: &str| {
        names.extend(regex.find_iter(haystack).map(|found| found.as_str().to_owned()));
    };

    for node in document.tree.nodes() {
        match node.value() {
            Node::Text(text) => collect(&**text),
            Node::Element(element) => {
                for (_, value) in element.attrs() {
                    collect(value);
                }
            }
            _ => {}
        }
    }
    names.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::{
        clean_filename, load_slides, parse_slides_table, scan_mp4_names, slides_json, write_texts,
        Slide,
    };

    const TABLE: &str = r#"
        <html><body>
        <table>
            <tr><th>Name</th><th>English</th><th>Translation</th></tr>
            <tr><td>00</td><td>Welcome to Conveyor System Essentials!</td><td>コンベヤシステムの基礎コースへようこそ！</td></tr>
            <tr><td>1.1</td><td>First line</td><td>Erste\nZeile</td></tr>
            <tr><td>only one cell</td></tr>
        </table>
        <table><tr><td>x</td><td>y</td><td>z</td></tr></table>
        </body></html>"#;

    #[test]
    fn extracts_rows_after_header_from_first_table() {
        let slides = parse_slides_table(TABLE).expect("table should parse");
        assert_eq!(slides.len(), 2);
        assert_eq!(slides[0].name, "00");
        assert_eq!(slides[0].translation, "コンベヤシステムの基礎コースへようこそ！");
        assert_eq!(slides[1].english, "First line");
    }

    #[test]
    fn json_uses_four_spaces_and_keeps_non_ascii() {
        let slides = vec![Slide {
            name: "00".to_owned(),
            english: "Hi".to_owned(),
            translation: "ようこそ".to_owned(),
        }];
        let json = String::from_utf8(slides_json(&slides).expect("json should serialize"))
            .expect("json should be utf-8");
        assert!(json.contains("\n    \"slides\": [\n        {\n            \"name\": \"00\""));
        assert!(json.contains("ようこそ"));
    }

    #[test]
    fn cleans_file_names() {
        assert_eq!(clean_filename("1.1"), "1_1");
        assert_eq!(clean_filename("  Intro: part  two! "), "Intro part two");
        assert_eq!(clean_filename("a-b.c"), "a-b_c");
    }

    #[test]
    fn writes_translation_texts_without_literal_newlines() {
        let dir = tempdir().expect("tempdir should be created");
        let json_path = dir.path().join("slides.json");
        let slides = parse_slides_table(TABLE).expect("table should parse");
        fs::write(&json_path, slides_json(&slides).expect("json should serialize"))
            .expect("slides file should be written");
        assert_eq!(load_slides(&json_path).expect("slides should load"), slides);

        let report = write_texts(&json_path).expect("texts should be written");
        assert!(!report.has_failures());
        let text = fs::read_to_string(dir.path().join("output/1_1.txt"))
            .expect("slide text should exist");
        assert_eq!(text, "ErsteZeile");
    }

    #[test]
    fn scans_mp4_names_in_text_and_attributes() {
        let html = r#"<div data-src="clips/A_0001_D.MP4">See intro.mp4 and B-2.MP4</div>
            <a href="intro.mp4">again</a>"#;
        assert_eq!(scan_mp4_names(html), ["A_0001_D.MP4", "B-2.MP4", "intro.mp4"]);
    }
}
