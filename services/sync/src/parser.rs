//! services/sync/src/parser.rs
//!
//! Opens a compressed book archive, walks its content manifest in reading
//! order, and reconstructs paragraph-preserving plain text plus a
//! per-chapter annotated-HTML form with inlined assets.
//!
//! Everything here is synchronous and allocation-only; the orchestrator
//! runs it on a blocking thread. Paragraph boundaries in the plain text are
//! exactly the blank-line positions, and chapter offsets index into the
//! growing plain-text buffer.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::OnceLock;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use regex::Regex;
use scraper::{Html, Selector};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use zip::ZipArchive;

use audiosync_core::domain::{AnnotatedChapter, Chapter, ParsedBook};

use crate::error::{SyncError, SyncResult};
use crate::text::count_words;

/// Chapters shorter than this after extraction are discarded.
const MIN_CHAPTER_CHARS: usize = 50;

/// Hex SHA-256 of the original archive bytes, used for upload dedupe.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Parses a compressed book archive into plain text, chapter bounds, and
/// annotated HTML chapters.
pub fn parse_epub(bytes: &[u8]) -> SyncResult<ParsedBook> {
    let mut archive = BookArchive::open(bytes)?;

    let opf_path = archive
        .find_opf()
        .ok_or_else(|| SyncError::InvalidArchive("no .opf manifest found".to_string()))?;
    let opf = archive.read_string(&opf_path).map_err(|e| {
        SyncError::InvalidArchive(format!("manifest {opf_path} is unreadable: {e}"))
    })?;
    let opf_dir = parent_dir(&opf_path);

    let manifest = parse_manifest(&opf, &opf_dir);
    if manifest.spine.is_empty() {
        return Err(SyncError::InvalidArchive(
            "manifest has no spine entries".to_string(),
        ));
    }

    let title = opf_meta(&opf, "title").unwrap_or_else(|| "Untitled".to_string());
    let author = opf_meta(&opf, "creator");

    let mut plain_text = String::new();
    let mut chapters: Vec<Chapter> = Vec::new();
    let mut annotated: Vec<AnnotatedChapter> = Vec::new();

    for idref in &manifest.spine {
        let Some(item) = manifest.items.get(idref) else {
            debug!(idref, "spine entry missing from manifest, skipping");
            continue;
        };
        if !is_html_document(&item.path) {
            continue;
        }
        let html = match archive.read_string(&item.path) {
            Ok(html) => html,
            Err(e) => {
                warn!(path = %item.path, error = %e, "spine document unreadable, skipping");
                continue;
            }
        };

        let chapter_number = chapters.len() + 1;
        let (chapter_title, plain) = extract_chapter_text(&html, chapter_number);
        if plain.len() < MIN_CHAPTER_CHARS {
            debug!(
                title = %chapter_title,
                chars = plain.len(),
                "discarding short chapter"
            );
            continue;
        }

        let doc_dir = parent_dir(&item.path);
        let body = annotate_chapter(&html, &doc_dir, &mut archive, &manifest.mime_by_path);

        if !plain_text.is_empty() {
            plain_text.push_str("\n\n");
        }
        let start_char = plain_text.len();
        plain_text.push_str(&plain);
        let end_char = plain_text.len();

        chapters.push(Chapter {
            title: chapter_title.clone(),
            start_char,
            end_char,
            word_count: count_words(&plain),
        });
        annotated.push(AnnotatedChapter {
            title: chapter_title,
            html: body,
        });
    }

    Ok(ParsedBook {
        title,
        author,
        plain_text,
        chapters,
        annotated_chapters: annotated,
    })
}

//=========================================================================================
// Archive access
//=========================================================================================

struct BookArchive {
    zip: ZipArchive<Cursor<Vec<u8>>>,
    names: Vec<String>,
}

impl BookArchive {
    fn open(bytes: &[u8]) -> SyncResult<Self> {
        let zip = ZipArchive::new(Cursor::new(bytes.to_vec()))
            .map_err(|e| SyncError::InvalidArchive(format!("not a readable archive: {e}")))?;
        let names = zip.file_names().map(str::to_owned).collect();
        Ok(Self { zip, names })
    }

    fn find_opf(&self) -> Option<String> {
        self.names
            .iter()
            .find(|name| name.to_ascii_lowercase().ends_with(".opf"))
            .cloned()
    }

    /// Looks an entry up by exact path first, then case-insensitively:
    /// archives produced by sloppy tooling routinely disagree with their own
    /// manifest about case.
    fn resolve_name(&self, path: &str) -> Option<String> {
        if self.names.iter().any(|n| n == path) {
            return Some(path.to_string());
        }
        let lowered = path.to_ascii_lowercase();
        self.names
            .iter()
            .find(|n| n.to_ascii_lowercase() == lowered)
            .cloned()
    }

    fn read(&mut self, path: &str) -> SyncResult<Vec<u8>> {
        let name = self
            .resolve_name(path)
            .ok_or_else(|| SyncError::AssetMissing(path.to_string()))?;
        let mut file = self
            .zip
            .by_name(&name)
            .map_err(|e| SyncError::InvalidArchive(format!("cannot open {name}: {e}")))?;
        let mut buf = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn read_string(&mut self, path: &str) -> SyncResult<String> {
        let bytes = self.read(path)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

//=========================================================================================
// Manifest
//=========================================================================================

struct ManifestItem {
    /// Archive path, already resolved against the OPF directory.
    path: String,
}

struct Manifest {
    items: HashMap<String, ManifestItem>,
    /// Spine idrefs in reading order.
    spine: Vec<String>,
    /// Resolved asset path → declared media type.
    mime_by_path: HashMap<String, String>,
}

fn parse_manifest(opf: &str, opf_dir: &str) -> Manifest {
    let doc = Html::parse_document(opf);

    let mut items = HashMap::new();
    let mut mime_by_path = HashMap::new();
    if let Ok(item_sel) = Selector::parse("manifest item") {
        for el in doc.select(&item_sel) {
            let (Some(id), Some(href)) = (el.value().attr("id"), el.value().attr("href")) else {
                continue;
            };
            let path = resolve_path(opf_dir, href);
            if let Some(media_type) = el.value().attr("media-type") {
                mime_by_path.insert(path.clone(), media_type.to_string());
            }
            items.insert(id.to_string(), ManifestItem { path });
        }
    }

    let mut spine = Vec::new();
    if let Ok(itemref_sel) = Selector::parse("spine itemref") {
        for el in doc.select(&itemref_sel) {
            if let Some(idref) = el.value().attr("idref") {
                spine.push(idref.to_string());
            }
        }
    }

    Manifest {
        items,
        spine,
        mime_by_path,
    }
}

/// Dublin Core metadata values are simple enough to pull with a regex; the
/// OPF has already been located, so a missing tag just means "absent".
fn opf_meta(opf: &str, field: &str) -> Option<String> {
    let pattern = format!(r"(?is)<dc:{field}[^>]*>(.*?)</dc:{field}>");
    let re = Regex::new(&pattern).ok()?;
    let captured = re.captures(opf)?.get(1)?.as_str();
    let value = collapse_whitespace(&unescape_entities(captured));
    (!value.is_empty()).then_some(value)
}

fn is_html_document(path: &str) -> bool {
    let lowered = path.to_ascii_lowercase();
    lowered.ends_with(".xhtml") || lowered.ends_with(".html") || lowered.ends_with(".htm")
}

//=========================================================================================
// Plain-text extraction
//=========================================================================================

/// Extracts a chapter title and paragraph-preserving plain text from one
/// spine document.
fn extract_chapter_text(html: &str, chapter_number: usize) -> (String, String) {
    let doc = Html::parse_document(html);

    let title = heading_title(&doc).unwrap_or_else(|| format!("Chapter {chapter_number}"));

    let mut paragraphs: Vec<String> = Vec::new();
    if let Ok(block_sel) = Selector::parse("p, h1, h2, h3, h4, h5, h6") {
        for el in doc.select(&block_sel) {
            let text = collapse_whitespace(&el.text().collect::<Vec<_>>().join(" "));
            if !text.is_empty() {
                paragraphs.push(text);
            }
        }
    }

    let plain = if paragraphs.is_empty() {
        fallback_plain_text(html)
    } else {
        paragraphs.join("\n\n")
    };

    (title, plain)
}

fn heading_title(doc: &Html) -> Option<String> {
    for selector in ["h1", "h2", "h3"] {
        let sel = Selector::parse(selector).ok()?;
        for el in doc.select(&sel) {
            let text = collapse_whitespace(&el.text().collect::<Vec<_>>().join(" "));
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    None
}

/// Tag-stripping fallback for documents without paragraph-like blocks:
/// closing block tags become blank lines, remaining tags are dropped, and
/// each paragraph's whitespace collapses while blank-line separators stay.
fn fallback_plain_text(html: &str) -> String {
    static SCRIPT_RE: OnceLock<Regex> = OnceLock::new();
    static BLOCK_CLOSE_RE: OnceLock<Regex> = OnceLock::new();
    static TAG_RE: OnceLock<Regex> = OnceLock::new();

    let script_re = SCRIPT_RE.get_or_init(|| {
        Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>").expect("static regex")
    });
    let block_close_re = BLOCK_CLOSE_RE.get_or_init(|| {
        Regex::new(r"(?i)</(p|div|h[1-6]|li|blockquote|section|article|tr|table)>|<br\s*/?>")
            .expect("static regex")
    });
    let tag_re = TAG_RE.get_or_init(|| Regex::new(r"<[^>]*>").expect("static regex"));

    let without_scripts = script_re.replace_all(html, " ");
    let with_breaks = block_close_re.replace_all(&without_scripts, "\n\n");
    let stripped = tag_re.replace_all(&with_breaks, "");
    let unescaped = unescape_entities(&stripped);

    unescaped
        .split("\n\n")
        .map(collapse_whitespace)
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn unescape_entities(text: &str) -> String {
    static ENTITY_RE: OnceLock<Regex> = OnceLock::new();
    let re = ENTITY_RE.get_or_init(|| Regex::new(r"&(#x?[0-9a-fA-F]+|[a-zA-Z]+);").expect("static regex"));

    re.replace_all(text, |caps: &regex::Captures<'_>| {
        let entity = &caps[1];
        match entity {
            "amp" => "&".to_string(),
            "lt" => "<".to_string(),
            "gt" => ">".to_string(),
            "quot" => "\"".to_string(),
            "apos" => "'".to_string(),
            "nbsp" => " ".to_string(),
            _ => {
                let parsed = if let Some(hex) = entity.strip_prefix("#x").or(entity.strip_prefix("#X")) {
                    u32::from_str_radix(hex, 16).ok()
                } else if let Some(dec) = entity.strip_prefix('#') {
                    dec.parse::<u32>().ok()
                } else {
                    None
                };
                parsed
                    .and_then(char::from_u32)
                    .map(String::from)
                    .unwrap_or_else(|| caps[0].to_string())
            }
        }
    })
    .into_owned()
}

//=========================================================================================
// Annotated chapters
//=========================================================================================

/// Builds the display form of one chapter: the body HTML with scripts
/// removed, linked stylesheets inlined, and every asset reference rewritten
/// to a base64 data URL. Missing assets are logged and left untouched.
fn annotate_chapter(
    html: &str,
    doc_dir: &str,
    archive: &mut BookArchive,
    mime_by_path: &HashMap<String, String>,
) -> String {
    static BODY_RE: OnceLock<Regex> = OnceLock::new();
    static SCRIPT_RE: OnceLock<Regex> = OnceLock::new();
    static LINK_RE: OnceLock<Regex> = OnceLock::new();
    static HREF_RE: OnceLock<Regex> = OnceLock::new();
    static IMG_SRC_RE: OnceLock<Regex> = OnceLock::new();

    let body_re =
        BODY_RE.get_or_init(|| Regex::new(r"(?is)<body[^>]*>(.*)</body>").expect("static regex"));
    let script_re = SCRIPT_RE
        .get_or_init(|| Regex::new(r"(?is)<script[^>]*>.*?</script>").expect("static regex"));
    let link_re = LINK_RE.get_or_init(|| Regex::new(r"(?is)<link[^>]*>").expect("static regex"));
    let href_re = HREF_RE
        .get_or_init(|| Regex::new(r#"(?i)href\s*=\s*["']([^"']+)["']"#).expect("static regex"));
    let img_src_re = IMG_SRC_RE.get_or_init(|| {
        Regex::new(r#"(?is)(<img[^>]*?\ssrc\s*=\s*["'])([^"']+)(["'])"#).expect("static regex")
    });

    // Linked stylesheets are document-level; resolve them before narrowing
    // to the body so <head> links are not lost.
    let with_styles = link_re.replace_all(html, |caps: &regex::Captures<'_>| {
        let tag = &caps[0];
        if !tag.to_ascii_lowercase().contains("stylesheet") {
            return tag.to_string();
        }
        let Some(href) = href_re.captures(tag).and_then(|c| c.get(1)) else {
            return tag.to_string();
        };
        let css_path = resolve_path(doc_dir, href.as_str());
        match archive.read_string(&css_path) {
            Ok(css) => {
                let css_dir = parent_dir(&css_path);
                let inlined = inline_css_urls(&css, &css_dir, archive, mime_by_path);
                format!("<style>\n{inlined}\n</style>")
            }
            Err(e) => {
                warn!(href = href.as_str(), error = %e, "stylesheet missing, keeping link");
                tag.to_string()
            }
        }
    });

    let mut body = match body_re.captures(&with_styles) {
        Some(caps) => {
            // Keep inlined <style> blocks that were hoisted from <head>.
            let head_styles =
                extract_style_blocks(&with_styles, caps.get(1).map_or(0, |m| m.start()));
            format!("{head_styles}{}", &caps[1])
        }
        None => with_styles.to_string(),
    };
    body = script_re.replace_all(&body, "").into_owned();

    // Inline <style> url(...) references resolve against the document dir.
    body = inline_css_urls(&body, doc_dir, archive, mime_by_path);

    img_src_re
        .replace_all(&body, |caps: &regex::Captures<'_>| {
            let src = &caps[2];
            match asset_data_url(src, doc_dir, archive, mime_by_path) {
                Some(url) => format!("{}{}{}", &caps[1], url, &caps[3]),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// `<style>` blocks before the body start, so they survive the body cut.
fn extract_style_blocks(html: &str, body_start: usize) -> String {
    static STYLE_RE: OnceLock<Regex> = OnceLock::new();
    let style_re = STYLE_RE
        .get_or_init(|| Regex::new(r"(?is)<style[^>]*>.*?</style>").expect("static regex"));
    style_re
        .find_iter(html)
        .filter(|m| m.end() <= body_start)
        .map(|m| m.as_str())
        .collect()
}

/// Rewrites every `url(...)` in a CSS body to a data URL, resolved against
/// the CSS file's own directory.
fn inline_css_urls(
    css: &str,
    base_dir: &str,
    archive: &mut BookArchive,
    mime_by_path: &HashMap<String, String>,
) -> String {
    static URL_RE: OnceLock<Regex> = OnceLock::new();
    let url_re = URL_RE
        .get_or_init(|| Regex::new(r#"url\(\s*["']?([^"')]+)["']?\s*\)"#).expect("static regex"));

    url_re
        .replace_all(css, |caps: &regex::Captures<'_>| {
            let reference = caps[1].trim();
            match asset_data_url(reference, base_dir, archive, mime_by_path) {
                Some(url) => format!("url({url})"),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Loads an asset and encodes it as a `data:` URL. Returns `None` (after
/// logging) for external references and missing entries.
fn asset_data_url(
    reference: &str,
    base_dir: &str,
    archive: &mut BookArchive,
    mime_by_path: &HashMap<String, String>,
) -> Option<String> {
    if reference.starts_with("data:")
        || reference.starts_with("http:")
        || reference.starts_with("https:")
        || reference.starts_with('#')
    {
        return None;
    }
    let path = resolve_path(base_dir, reference);
    let bytes = match archive.read(&path) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(reference, error = %e, "asset missing, keeping original reference");
            return None;
        }
    };
    let mime = mime_by_path
        .get(&path)
        .cloned()
        .unwrap_or_else(|| extension_mime(&path).to_string());
    Some(format!("data:{mime};base64,{}", BASE64.encode(bytes)))
}

fn extension_mime(path: &str) -> &'static str {
    let ext = path.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "css" => "text/css",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        _ => "application/octet-stream",
    }
}

//=========================================================================================
// Path handling
//=========================================================================================

fn parent_dir(path: &str) -> String {
    match path.rfind('/') {
        Some(idx) => path[..idx].to_string(),
        None => String::new(),
    }
}

/// Resolves a relative reference against a base directory inside the
/// archive, handling `./`, `../`, and fragment suffixes.
fn resolve_path(base_dir: &str, reference: &str) -> String {
    let reference = reference.split(['#', '?']).next().unwrap_or(reference);
    let mut parts: Vec<&str> = if base_dir.is_empty() {
        Vec::new()
    } else {
        base_dir.split('/').collect()
    };
    for segment in reference.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

//=========================================================================================
// Tests
//=========================================================================================
