//! Document loading: decode PDF bytes into ordered pages.
//!
//! Two libraries split the work: `lopdf` reads the document structure
//! (page count, encryption, embedded image XObjects) and `pdf-extract`
//! pulls the native text layer. Native text is split back into pages on the
//! form-feed boundaries `pdf-extract` emits; when that split disagrees with
//! the real page count the text is distributed by line ranges instead, so a
//! page never silently swallows its neighbour's rows.
//!
//! Only document-level unreadability is fatal here (not a PDF, corrupt
//! xref, wrong password). A missing text layer is normal — that is what
//! scanned invoices look like — and is handled downstream by the extractor.

use crate::error::TariffPipelineError;
use image::DynamicImage;
use lopdf::{Object, ObjectId};
use tracing::{debug, warn};

/// A parsed invoice document: ordered pages, immutable once loaded.
#[derive(Debug)]
pub struct Document {
    /// Caller-supplied identifier (usually the file stem).
    pub id: String,
    /// Pages in original document order.
    pub pages: Vec<Page>,
}

/// One page: whatever native text the PDF carries plus any embedded raster
/// images (scanned pages are typically a single full-page image).
#[derive(Debug)]
pub struct Page {
    /// 0-based index in document order.
    pub index: usize,
    /// Native text layer for this page (may be empty for scans).
    pub text: String,
    /// Embedded images, in object order.
    pub images: Vec<DynamicImage>,
}

/// Loader-only document overview, available without any collaborator.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DocumentSummary {
    pub id: String,
    pub page_count: usize,
    pub pages: Vec<PageSummary>,
}

/// Per-page counts for [`DocumentSummary`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct PageSummary {
    pub index: usize,
    pub native_chars: usize,
    pub image_count: usize,
}

impl Document {
    /// Summarise the loaded document.
    pub fn summary(&self) -> DocumentSummary {
        DocumentSummary {
            id: self.id.clone(),
            page_count: self.pages.len(),
            pages: self
                .pages
                .iter()
                .map(|p| PageSummary {
                    index: p.index,
                    native_chars: p.text.chars().count(),
                    image_count: p.images.len(),
                })
                .collect(),
        }
    }
}

/// Decode PDF bytes into a [`Document`].
///
/// # Errors
/// Fatal only: [`TariffPipelineError::NotAPdf`], `CorruptPdf`,
/// `PasswordRequired`, `WrongPassword`, `EmptyDocument`.
pub fn load_document(
    bytes: &[u8],
    password: Option<&str>,
    id: &str,
) -> Result<Document, TariffPipelineError> {
    if bytes.len() < 4 || &bytes[..4] != b"%PDF" {
        let mut magic = [0u8; 4];
        let n = bytes.len().min(4);
        magic[..n].copy_from_slice(&bytes[..n]);
        return Err(TariffPipelineError::NotAPdf { magic });
    }

    let mut doc = lopdf::Document::load_mem(bytes)
        .map_err(|e| TariffPipelineError::CorruptPdf {
            detail: e.to_string(),
        })?;

    // pdf-extract needs raw bytes; if the document is encrypted we decrypt
    // via lopdf and re-serialise so both libraries see the same content.
    let raw = if doc.is_encrypted() {
        match password {
            Some(pwd) => {
                if doc.decrypt(pwd).is_err() {
                    return Err(TariffPipelineError::WrongPassword);
                }
            }
            None => {
                // Many "encrypted" PDFs use an empty user password.
                if doc.decrypt("").is_err() {
                    return Err(TariffPipelineError::PasswordRequired);
                }
                debug!("decrypted PDF with empty password");
            }
        }
        let mut decrypted = Vec::new();
        doc.save_to(&mut decrypted)
            .map_err(|e| TariffPipelineError::CorruptPdf {
                detail: format!("failed to re-serialise decrypted PDF: {e}"),
            })?;
        decrypted
    } else {
        bytes.to_vec()
    };

    let page_ids: Vec<ObjectId> = doc.get_pages().values().copied().collect();
    if page_ids.is_empty() {
        return Err(TariffPipelineError::EmptyDocument);
    }
    debug!("PDF loaded: {} pages", page_ids.len());

    // A failed text layer is not fatal: scanned invoices flow through OCR.
    let full_text = match pdf_extract::extract_text_from_mem(&raw) {
        Ok(t) => t,
        Err(e) => {
            warn!("native text extraction failed ({e}), continuing without text layer");
            String::new()
        }
    };
    let page_texts = split_page_texts(&full_text, page_ids.len());

    let pages = page_ids
        .iter()
        .zip(page_texts)
        .enumerate()
        .map(|(index, (&page_id, text))| {
            let images = page_images(&doc, page_id);
            debug!(
                "page {}: {} native chars, {} embedded images",
                index + 1,
                text.chars().count(),
                images.len()
            );
            Page { index, text, images }
        })
        .collect();

    Ok(Document {
        id: id.to_string(),
        pages,
    })
}

/// Split the whole-document text layer into per-page strings.
///
/// `pdf-extract` separates pages with form feeds; when the split count
/// matches the real page count it is used directly. Otherwise lines are
/// distributed across pages in equal ranges — coarse, but it preserves
/// document order and never drops text.
fn split_page_texts(full_text: &str, page_count: usize) -> Vec<String> {
    let segments: Vec<&str> = full_text.split('\u{c}').collect();
    if segments.len() == page_count {
        return segments.iter().map(|s| s.trim().to_string()).collect();
    }
    if page_count == 1 {
        return vec![full_text.trim().to_string()];
    }

    let lines: Vec<&str> = full_text.lines().collect();
    let per_page = lines.len().div_ceil(page_count).max(1);
    (0..page_count)
        .map(|i| {
            let start = (i * per_page).min(lines.len());
            let end = ((i + 1) * per_page).min(lines.len());
            lines[start..end].join("\n").trim().to_string()
        })
        .collect()
}

/// Extract raster images referenced by a page's XObject resources.
fn page_images(doc: &lopdf::Document, page_id: ObjectId) -> Vec<DynamicImage> {
    let mut images = Vec::new();

    let Some(resources) = page_resources(doc, page_id) else {
        return images;
    };
    let Ok(xobjects) = resources.get(b"XObject") else {
        return images;
    };
    let Ok((_, Object::Dictionary(xobj_dict))) = doc.dereference(xobjects) else {
        return images;
    };

    for (_name, obj_ref) in xobj_dict.iter() {
        if let Ok((_, obj)) = doc.dereference(obj_ref) {
            if let Some(img) = decode_image_object(obj) {
                images.push(img);
            }
        }
    }
    images
}

/// Resolve a page's Resources dictionary, walking up the page tree for
/// inherited resources when the page has none of its own.
fn page_resources(doc: &lopdf::Document, node_id: ObjectId) -> Option<lopdf::Dictionary> {
    let Ok(Object::Dictionary(dict)) = doc.get_object(node_id) else {
        return None;
    };
    if let Ok(resources) = dict.get(b"Resources") {
        if let Ok((_, Object::Dictionary(res))) = doc.dereference(resources) {
            return Some(res.clone());
        }
    }
    if let Ok(Object::Reference(parent_id)) = dict.get(b"Parent") {
        return page_resources(doc, *parent_id);
    }
    None
}

/// Decode an image XObject stream into a `DynamicImage`.
///
/// Handles the two encodings that cover scanned invoices in practice:
/// DCTDecode (JPEG) and raw 8-bit DeviceRGB/DeviceGray. Exotic filters
/// (JPX, CCITT fax, JBIG2) are skipped with a trace.
fn decode_image_object(obj: &Object) -> Option<DynamicImage> {
    let Object::Stream(stream) = obj else {
        return None;
    };
    let dict = &stream.dict;

    if dict.get(b"Subtype").ok()?.as_name().ok()? != b"Image" {
        return None;
    }

    let width = dict.get(b"Width").ok()?.as_i64().ok()? as u32;
    let height = dict.get(b"Height").ok()?.as_i64().ok()? as u32;

    if let Ok(filter) = dict.get(b"Filter") {
        let filter_name = match filter {
            Object::Name(name) => Some(name.as_slice()),
            Object::Array(arr) => arr.first().and_then(|o| o.as_name().ok()),
            _ => None,
        };
        match filter_name {
            Some(b"DCTDecode") => {
                return image::load_from_memory_with_format(
                    &stream.content,
                    image::ImageFormat::Jpeg,
                )
                .ok();
            }
            Some(b"JPXDecode") | Some(b"CCITTFaxDecode") | Some(b"JBIG2Decode") => {
                tracing::trace!("skipping image with unsupported filter");
                return None;
            }
            _ => {}
        }
    }

    let data = stream
        .decompressed_content()
        .unwrap_or_else(|_| stream.content.clone());

    let bits = dict
        .get(b"BitsPerComponent")
        .ok()
        .and_then(|o| o.as_i64().ok())
        .unwrap_or(8);
    if bits != 8 {
        return None;
    }

    let color_space = dict
        .get(b"ColorSpace")
        .ok()
        .and_then(|o| match o {
            Object::Name(name) => Some(name.as_slice()),
            Object::Array(arr) => arr.first().and_then(|o| o.as_name().ok()),
            _ => None,
        })
        .unwrap_or(b"DeviceRGB");

    match color_space {
        b"DeviceRGB" | b"RGB" => {
            let expected = (width * height * 3) as usize;
            if data.len() < expected {
                return None;
            }
            image::RgbImage::from_raw(width, height, data[..expected].to_vec())
                .map(DynamicImage::ImageRgb8)
        }
        b"DeviceGray" | b"G" => {
            let expected = (width * height) as usize;
            if data.len() < expected {
                return None;
            }
            image::GrayImage::from_raw(width, height, data[..expected].to_vec())
                .map(DynamicImage::ImageLuma8)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_pdf_bytes() {
        match load_document(b"PK\x03\x04zipfile", None, "doc") {
            Err(TariffPipelineError::NotAPdf { magic }) => {
                assert_eq!(&magic, b"PK\x03\x04");
            }
            other => panic!("expected NotAPdf, got {other:?}"),
        }
    }

    #[test]
    fn rejects_truncated_input() {
        assert!(matches!(
            load_document(b"%P", None, "doc"),
            Err(TariffPipelineError::NotAPdf { .. })
        ));
    }

    #[test]
    fn rejects_corrupt_pdf() {
        assert!(matches!(
            load_document(b"%PDF-1.7 garbage with no xref", None, "doc"),
            Err(TariffPipelineError::CorruptPdf { .. })
        ));
    }

    #[test]
    fn split_matching_form_feeds() {
        let text = "page one\u{c}page two\u{c}page three";
        let pages = split_page_texts(text, 3);
        assert_eq!(pages, vec!["page one", "page two", "page three"]);
    }

    #[test]
    fn split_mismatch_distributes_lines() {
        let text = "a\nb\nc\nd";
        let pages = split_page_texts(text, 2);
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0], "a\nb");
        assert_eq!(pages[1], "c\nd");
    }

    #[test]
    fn split_single_page_keeps_everything() {
        let text = "line\u{c}with stray form feed";
        let pages = split_page_texts(text, 1);
        assert_eq!(pages.len(), 1);
        assert!(pages[0].contains("stray"));
    }
}
