//! Perceptual State
//!
//! Immutable snapshot of one screen: OCR blocks, image size, and the flags
//! derived from them. A new capture always produces a new snapshot.

use super::heuristics::{derive_flags, normalize_text};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PerceptionError {
    #[error("image dimensions must be positive, got {0}x{1}")]
    InvalidDimensions(u32, u32),
}

/// Box in image pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
}

impl BoundingBox {
    pub fn new(left: f64, top: f64, right: f64, bottom: f64) -> Self {
        Self { left, top, right, bottom }
    }

    pub fn width(&self) -> f64 {
        (self.right - self.left).abs()
    }

    pub fn height(&self) -> f64 {
        (self.bottom - self.top).abs()
    }

    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.left + self.right) / 2.0,
            (self.top + self.bottom) / 2.0,
        )
    }

    /// Smallest box covering both
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            left: self.left.min(other.left),
            top: self.top.min(other.top),
            right: self.right.max(other.right),
            bottom: self.bottom.max(other.bottom),
        }
    }
}

/// One unit of recognized text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrBlock {
    pub text: String,
    pub bounding_box: BoundingBox,
    /// Recognizer confidence in [0, 1], when the recognizer reports one
    pub confidence: Option<f32>,
}

impl OcrBlock {
    pub fn new(text: impl Into<String>, bounding_box: BoundingBox) -> Self {
        Self {
            text: text.into(),
            bounding_box,
            confidence: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }

    pub fn normalized_text(&self) -> String {
        normalize_text(&self.text)
    }
}

/// Heuristic signals; a pure function of the blocks and image size
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedFlags {
    pub has_modal_candidate: bool,
    pub has_error_candidate: bool,
    pub modal_keywords: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerceptualState {
    blocks: Vec<OcrBlock>,
    image_width: u32,
    image_height: u32,
    derived: DerivedFlags,
    captured_at: DateTime<Utc>,
}

impl PerceptualState {
    pub fn new(blocks: Vec<OcrBlock>, image_width: u32, image_height: u32) -> Result<Self, PerceptionError> {
        Self::captured(blocks, image_width, image_height, Utc::now())
    }

    pub fn captured(
        blocks: Vec<OcrBlock>,
        image_width: u32,
        image_height: u32,
        captured_at: DateTime<Utc>,
    ) -> Result<Self, PerceptionError> {
        if image_width == 0 || image_height == 0 {
            return Err(PerceptionError::InvalidDimensions(image_width, image_height));
        }
        let derived = derive_flags(&blocks, image_width, image_height);
        Ok(Self {
            blocks,
            image_width,
            image_height,
            derived,
            captured_at,
        })
    }

    pub fn blocks(&self) -> &[OcrBlock] {
        &self.blocks
    }

    pub fn image_width(&self) -> u32 {
        self.image_width
    }

    pub fn image_height(&self) -> u32 {
        self.image_height
    }

    pub fn derived(&self) -> &DerivedFlags {
        &self.derived
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Up to `limit` blocks, largest area first. Ties keep OCR order.
    pub fn largest_blocks(&self, limit: usize) -> Vec<&OcrBlock> {
        let mut sorted: Vec<&OcrBlock> = self.blocks.iter().collect();
        sorted.sort_by(|a, b| b.bounding_box.area().total_cmp(&a.bounding_box.area()));
        sorted.truncate(limit);
        sorted
    }

    /// Short textual description, used as memory context
    pub fn describe(&self, limit: usize) -> String {
        let texts: Vec<&str> = self
            .largest_blocks(limit)
            .into_iter()
            .map(|b| b.text.trim())
            .filter(|t| !t.is_empty())
            .collect();
        let mut description = if texts.is_empty() {
            "Empty screen".to_string()
        } else {
            format!("Visible text: {}", texts.join(", "))
        };
        if self.derived.has_modal_candidate {
            description.push_str(". Modal dialog likely");
        }
        if self.derived.has_error_candidate {
            description.push_str(". Error likely");
        }
        description
    }
}
