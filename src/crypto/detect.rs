// LibriVault - Secure Reading for Mobile
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Content type detection
//!
//! The byte signature of the decrypted plaintext is the source of truth for
//! what a title actually is; the server's filename hint is advisory and can
//! only disambiguate within the ZIP container family, never override a
//! signature.
//!
//! # Detection strategy
//! 1. `%PDF` → PDF
//! 2. `PK\x03\x04` → ZIP container family:
//!    - a leading stored `mimetype` entry carrying the EPUB media type → EPUB
//!    - a `word/document.xml` entry name in the leading window → DOCX
//!    - otherwise the filename hint may pick an in-family type
//! 3. anything else → `UnsupportedContentType`

use crate::error::{DrmError, Result};
use std::fmt;
use std::path::Path;

const PDF_MAGIC: &[u8] = b"%PDF";
const ZIP_MAGIC: &[u8] = &[0x50, 0x4B, 0x03, 0x04];
const EPUB_MIMETYPE: &[u8] = b"application/epub+zip";
const DOCX_MARKER: &[u8] = b"word/document.xml";

/// How far into a ZIP container to look for entry-name markers
const ZIP_SCAN_WINDOW: usize = 8192;

/// Document formats the viewer can display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Pdf,
    Epub,
    Docx,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Epub => "epub",
            Self::Docx => "docx",
        }
    }

    /// File extension without the dot
    pub fn extension(&self) -> &'static str {
        self.as_str()
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Pdf => "application/pdf",
            Self::Epub => "application/epub+zip",
            Self::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
        }
    }

    /// Parse from a file extension (case-insensitive)
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Some(Self::Pdf),
            "epub" => Some(Self::Epub),
            "docx" => Some(Self::Docx),
            _ => None,
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detect the content type from plaintext bytes
///
/// # Arguments
/// * `bytes` - Decrypted plaintext
/// * `filename_hint` - Server-declared filename; consulted only for ZIP
///   containers whose signature alone does not identify the family member
///
/// # Errors
/// Returns `UnsupportedContentType` when no supported signature matches.
pub fn detect_content_type(bytes: &[u8], filename_hint: Option<&str>) -> Result<ContentType> {
    if bytes.len() < ZIP_MAGIC.len() {
        return Err(unsupported("content too short to carry a signature"));
    }

    if bytes.starts_with(PDF_MAGIC) {
        return Ok(ContentType::Pdf);
    }

    if bytes.starts_with(ZIP_MAGIC) {
        return detect_zip_container(bytes, filename_hint);
    }

    Err(unsupported("no supported format signature"))
}

fn detect_zip_container(bytes: &[u8], filename_hint: Option<&str>) -> Result<ContentType> {
    if has_epub_mimetype_entry(bytes) {
        return Ok(ContentType::Epub);
    }

    let window = &bytes[..bytes.len().min(ZIP_SCAN_WINDOW)];
    if contains(window, DOCX_MARKER) {
        return Ok(ContentType::Docx);
    }

    // Ambiguous ZIP; the hint may pick an in-family type
    if let Some(hinted) = filename_hint.and_then(hint_zip_type) {
        return Ok(hinted);
    }

    Err(unsupported("unrecognized ZIP container"))
}

/// An EPUB leads with a stored `mimetype` entry whose body is the EPUB
/// media type. Local file header: name length at offset 26, extra length at
/// 28, name at 30, body after name and extra field.
fn has_epub_mimetype_entry(bytes: &[u8]) -> bool {
    if bytes.len() < 30 {
        return false;
    }

    let name_len = u16::from_le_bytes([bytes[26], bytes[27]]) as usize;
    let extra_len = u16::from_le_bytes([bytes[28], bytes[29]]) as usize;
    if name_len != b"mimetype".len() {
        return false;
    }

    let name_end = 30 + name_len;
    let body_start = name_end + extra_len;
    let body_end = body_start + EPUB_MIMETYPE.len();
    if bytes.len() < body_end {
        return false;
    }

    &bytes[30..name_end] == b"mimetype" && &bytes[body_start..body_end] == EPUB_MIMETYPE
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// A hint can only name a ZIP-family type; anything else is ignored
fn hint_zip_type(hint: &str) -> Option<ContentType> {
    let ext = Path::new(hint).extension()?.to_str()?;
    match ContentType::from_extension(ext) {
        Some(ContentType::Epub) => Some(ContentType::Epub),
        Some(ContentType::Docx) => Some(ContentType::Docx),
        _ => None,
    }
}

fn unsupported(reason: &str) -> DrmError {
    DrmError::UnsupportedContentType {
        reason: reason.to_string(),
    }
}

// ===== TESTS =====
