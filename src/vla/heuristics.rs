//! Heuristic Classifier
//!
//! Cheap modal/error detection from OCR text and layout, computed once per
//! perceptual state. Pure and total.

use super::perception::{DerivedFlags, OcrBlock};

/// Words that usually label dialog buttons
pub const MODAL_KEYWORDS: &[&str] = &[
    "ok", "cancel", "close", "retry", "dismiss", "allow", "deny", "later", "update", "yes", "no",
];

/// Words that usually appear in failure messages
pub const ERROR_KEYWORDS: &[&str] = &[
    "error", "failed", "failure", "unable", "exception", "denied", "warning",
];

/// Blocks needed inside the central region before layout alone flags a modal
pub const CENTRAL_CLUSTER_MIN: usize = 3;

const CENTRAL_LOW: f64 = 0.25;
const CENTRAL_HIGH: f64 = 0.75;

/// Lowercase and collapse runs of whitespace
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whole-word tokens of normalized text
fn words(normalized: &str) -> impl Iterator<Item = &str> {
    normalized
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
}

/// `phrase` occurs in `text` as a run of whole words
pub(crate) fn contains_words(text: &str, phrase: &str) -> bool {
    let needle: Vec<&str> = words(phrase).collect();
    if needle.is_empty() {
        return false;
    }
    let haystack: Vec<&str> = words(text).collect();
    haystack.windows(needle.len()).any(|w| w == needle.as_slice())
}

pub fn derive_flags(blocks: &[OcrBlock], image_width: u32, image_height: u32) -> DerivedFlags {
    let mut flags = DerivedFlags::default();

    for block in blocks {
        let normalized = block.normalized_text();
        for word in words(&normalized) {
            if MODAL_KEYWORDS.contains(&word) {
                flags.has_modal_candidate = true;
                flags.modal_keywords.insert(word.to_string());
            }
            if ERROR_KEYWORDS.contains(&word) {
                flags.has_error_candidate = true;
            }
        }
    }

    let keyword_hit = flags.has_modal_candidate || flags.has_error_candidate;
    if !keyword_hit && central_cluster(blocks, image_width, image_height) >= CENTRAL_CLUSTER_MIN {
        flags.has_modal_candidate = true;
    }

    flags
}

/// Number of blocks whose centre falls in the middle 50%x50% of the image
fn central_cluster(blocks: &[OcrBlock], image_width: u32, image_height: u32) -> usize {
    if image_width == 0 || image_height == 0 {
        return 0;
    }
    let (w, h) = (image_width as f64, image_height as f64);
    blocks
        .iter()
        .filter(|block| {
            let (cx, cy) = block.bounding_box.center();
            let (nx, ny) = (cx / w, cy / h);
            (CENTRAL_LOW..=CENTRAL_HIGH).contains(&nx) && (CENTRAL_LOW..=CENTRAL_HIGH).contains(&ny)
        })
        .count()
}
