//! Text recognition via the `tesseract` CLI (TSV output).

use super::CaptureError;
use crate::vla::perception::{BoundingBox, OcrBlock, PerceptualState};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Recognized text for one image
#[derive(Debug, Clone, PartialEq)]
pub struct OcrPage {
    pub width: u32,
    pub height: u32,
    pub blocks: Vec<OcrBlock>,
}

impl OcrPage {
    pub fn into_state(self) -> Result<PerceptualState, CaptureError> {
        PerceptualState::new(self.blocks, self.width, self.height)
            .map_err(|e| CaptureError::Ocr(e.to_string()))
    }
}

#[async_trait]
pub trait TextRecognizer: Send + Sync {
    /// May return a page with no blocks
    async fn recognize(&self, image: &[u8]) -> Result<OcrPage, CaptureError>;
}

pub struct TesseractOcr {
    binary: String,
    language: String,
}

impl Default for TesseractOcr {
    fn default() -> Self {
        Self::new("tesseract", "eng")
    }
}

impl TesseractOcr {
    pub fn new(binary: &str, language: &str) -> Self {
        Self {
            binary: binary.into(),
            language: language.into(),
        }
    }
}

#[async_trait]
impl TextRecognizer for TesseractOcr {
    async fn recognize(&self, image: &[u8]) -> Result<OcrPage, CaptureError> {
        let mut child = Command::new(&self.binary)
            .args(["stdin", "stdout", "-l", &self.language, "tsv"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CaptureError::Ocr(format!("cannot start {}: {}", self.binary, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(image).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(CaptureError::Ocr(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let page = parse_tsv(&String::from_utf8_lossy(&output.stdout))?;
        debug!(blocks = page.blocks.len(), width = page.width, height = page.height, "ocr done");
        Ok(page)
    }
}

#[derive(Default)]
struct LineAcc {
    words: Vec<String>,
    bbox: Option<BoundingBox>,
    conf_sum: f32,
    conf_count: u32,
}

/// Parse tesseract TSV into line-level blocks.
///
/// Words (level 5) are grouped by (page, block, paragraph, line); each line
/// becomes one block covering all its words. Page size comes from the level 1 row.
pub fn parse_tsv(tsv: &str) -> Result<OcrPage, CaptureError> {
    let mut lines = tsv.lines();
    let header = lines
        .next()
        .ok_or_else(|| CaptureError::Ocr("empty TSV output".into()))?;
    let columns: Vec<&str> = header.split('\t').collect();
    let col = |name: &str| {
        columns
            .iter()
            .position(|c| c.trim() == name)
            .ok_or_else(|| CaptureError::Ocr(format!("TSV missing column {}", name)))
    };
    let (level, page, block, par, line, left, top, width, height, conf, text) = (
        col("level")?,
        col("page_num")?,
        col("block_num")?,
        col("par_num")?,
        col("line_num")?,
        col("left")?,
        col("top")?,
        col("width")?,
        col("height")?,
        col("conf")?,
        col("text")?,
    );

    let mut page_size = None;
    let mut acc: BTreeMap<(u32, u32, u32, u32), LineAcc> = BTreeMap::new();

    for row in lines {
        let fields: Vec<&str> = row.split('\t').collect();
        let int = |idx: usize| fields.get(idx).and_then(|f| f.trim().parse::<i64>().ok());
        let Some(row_level) = int(level) else { continue };

        if row_level == 1 && page_size.is_none() {
            if let (Some(w), Some(h)) = (int(width), int(height)) {
                page_size = Some((w.max(0) as u32, h.max(0) as u32));
            }
            continue;
        }
        if row_level != 5 {
            continue;
        }

        let word = fields.get(text).map(|t| t.trim()).unwrap_or_default();
        if word.is_empty() {
            continue;
        }
        let (Some(l), Some(t), Some(w), Some(h)) = (int(left), int(top), int(width), int(height)) else {
            continue;
        };
        let key = (
            int(page).unwrap_or(0) as u32,
            int(block).unwrap_or(0) as u32,
            int(par).unwrap_or(0) as u32,
            int(line).unwrap_or(0) as u32,
        );
        let bbox = BoundingBox::new(l as f64, t as f64, (l + w) as f64, (t + h) as f64);

        let entry = acc.entry(key).or_default();
        entry.words.push(word.to_string());
        entry.bbox = Some(entry.bbox.map_or(bbox, |b| b.union(&bbox)));
        if let Some(c) = fields.get(conf).and_then(|f| f.trim().parse::<f32>().ok()) {
            if c >= 0.0 {
                entry.conf_sum += c;
                entry.conf_count += 1;
            }
        }
    }

    let (width, height) =
        page_size.ok_or_else(|| CaptureError::Ocr("TSV has no page row".into()))?;

    let blocks = acc
        .into_values()
        .filter_map(|line| {
            let bbox = line.bbox?;
            let block = OcrBlock::new(line.words.join(" "), bbox);
            Some(if line.conf_count > 0 {
                block.with_confidence(line.conf_sum / line.conf_count as f32 / 100.0)
            } else {
                block
            })
        })
        .collect();

    Ok(OcrPage { width, height, blocks })
}
