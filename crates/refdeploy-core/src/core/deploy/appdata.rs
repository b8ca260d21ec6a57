//! Display fields from a deployment's appstream data.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use refdeploy_domain::deploy_data::{
    ContentRating, KEY_APPDATA_LICENSE, KEY_APPDATA_NAME, KEY_APPDATA_SUMMARY,
    KEY_APPDATA_VERSION,
};
use refdeploy_domain::DeployData;
use regex::Regex;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Appdata {
    /// `(language, text)`; `None` is the untranslated value.
    pub names: Vec<(Option<String>, String)>,
    pub summaries: Vec<(Option<String>, String)>,
    pub version: Option<String>,
    pub license: Option<String>,
    pub content_rating: Option<ContentRating>,
}

fn pattern(cell: &'static OnceLock<Option<Regex>>, source: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(source).ok()).as_ref()
}

fn component_re() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    pattern(&CELL, r"(?s)<component\b[^>]*>(.*?)</component>")
}

fn id_re() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    pattern(&CELL, r"<id>\s*([^<]*?)\s*</id>")
}

fn translated_re(tag: &'static str) -> Option<&'static Regex> {
    static NAME: OnceLock<Option<Regex>> = OnceLock::new();
    static SUMMARY: OnceLock<Option<Regex>> = OnceLock::new();
    let cell = if tag == "name" { &NAME } else { &SUMMARY };
    pattern(
        cell,
        &format!(r#"<{tag}(?:\s+xml:lang="([^"]*)")?\s*>([^<]*)</{tag}>"#),
    )
}

fn release_re() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    pattern(&CELL, r#"<release\b[^>]*\bversion="([^"]*)""#)
}

fn license_re() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    pattern(&CELL, r"<project_license>\s*([^<]*?)\s*</project_license>")
}

fn rating_re() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    pattern(
        &CELL,
        r#"(?s)<content_rating\b([^>]*?)(?:/>|>(.*?)</content_rating>)"#,
    )
}

fn rating_type_re() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    pattern(&CELL, r#"\btype="([^"]*)""#)
}

fn attribute_re() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    pattern(
        &CELL,
        r#"<content_attribute\s+id="([^"]*)"\s*>\s*([^<]*?)\s*</content_attribute>"#,
    )
}

fn unescape(text: &str) -> String {
    text.trim()
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Candidate appstream files below a deployment's `files` directory.
pub fn appdata_paths(files: &Path, id: &str) -> Vec<PathBuf> {
    vec![
        files.join(format!("share/app-info/xmls/{id}.xml.gz")),
        files.join(format!("share/metainfo/{id}.metainfo.xml")),
        files.join(format!("share/appdata/{id}.appdata.xml")),
    ]
}

pub fn load_appdata(files: &Path, id: &str) -> Result<Option<Appdata>> {
    for path in appdata_paths(files, id) {
        if !path.is_file() {
            continue;
        }
        let raw = fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        let text = if path.extension().is_some_and(|ext| ext == "gz") {
            let mut text = String::new();
            GzDecoder::new(raw.as_slice())
                .read_to_string(&mut text)
                .with_context(|| format!("failed to decompress {}", path.display()))?;
            text
        } else {
            String::from_utf8_lossy(&raw).into_owned()
        };
        if let Some(appdata) = parse_appdata(&text, id) {
            return Ok(Some(appdata));
        }
    }
    Ok(None)
}

/// Fields of the component describing `id` (with or without `.desktop`).
pub fn parse_appdata(xml: &str, id: &str) -> Option<Appdata> {
    let desktop_id = format!("{id}.desktop");
    let body = component_re()?
        .captures_iter(xml)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str())
        .find(|body| {
            id_re()
                .and_then(|re| re.captures(body))
                .and_then(|caps| caps.get(1))
                .is_some_and(|found| found.as_str() == id || found.as_str() == desktop_id)
        })?;

    let mut appdata = Appdata {
        names: translated(body, "name"),
        summaries: translated(body, "summary"),
        ..Appdata::default()
    };
    appdata.version = release_re()
        .and_then(|re| re.captures(body))
        .and_then(|caps| caps.get(1))
        .map(|m| unescape(m.as_str()));
    appdata.license = license_re()
        .and_then(|re| re.captures(body))
        .and_then(|caps| caps.get(1))
        .map(|m| unescape(m.as_str()))
        .filter(|license| !license.is_empty());
    appdata.content_rating = rating_re().and_then(|re| re.captures(body)).map(|caps| {
        let rating_type = caps
            .get(1)
            .and_then(|attrs| rating_type_re()?.captures(attrs.as_str()))
            .and_then(|caps| caps.get(1))
            .map_or_else(|| "oars-1.0".to_string(), |m| m.as_str().to_string());
        let values = caps
            .get(2)
            .and_then(|inner| {
                attribute_re().map(|re| {
                    re.captures_iter(inner.as_str())
                        .map(|attr| (attr[1].to_string(), attr[2].to_string()))
                        .collect()
                })
            })
            .unwrap_or_default();
        ContentRating {
            rating_type,
            values,
        }
    });
    Some(appdata)
}

fn translated(body: &str, tag: &'static str) -> Vec<(Option<String>, String)> {
    let Some(re) = translated_re(tag) else {
        return Vec::new();
    };
    let mut seen: Vec<(Option<String>, String)> = Vec::new();
    for caps in re.captures_iter(body) {
        let lang = caps.get(1).map(|m| m.as_str().to_string()).filter(|l| !l.is_empty());
        if seen.iter().any(|(existing, _)| *existing == lang) {
            continue;
        }
        if let Some(text) = caps.get(2) {
            seen.push((lang, unescape(text.as_str())));
        }
    }
    seen
}

impl Appdata {
    pub fn apply(&self, data: &mut DeployData) {
        for (lang, name) in &self.names {
            data.set_string(&localized_key(KEY_APPDATA_NAME, lang.as_deref()), name);
        }
        for (lang, summary) in &self.summaries {
            data.set_string(&localized_key(KEY_APPDATA_SUMMARY, lang.as_deref()), summary);
        }
        if let Some(version) = &self.version {
            data.set_string(KEY_APPDATA_VERSION, version);
        }
        if let Some(license) = &self.license {
            data.set_string(KEY_APPDATA_LICENSE, license);
        }
        if let Some(rating) = &self.content_rating {
            data.set_content_rating(rating);
        }
    }
}

fn localized_key(key: &str, lang: Option<&str>) -> String {
    match lang {
        Some(lang) => format!("{key}@{lang}"),
        None => key.to_string(),
    }
}
