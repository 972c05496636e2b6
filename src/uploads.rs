//! Naming and storage of uploaded target images.

use std::path::{Path, PathBuf};

use chrono::{NaiveDateTime, Utc};

/// URL prefix under which the upload directory is served
pub const UPLOAD_URL_PREFIX: &str = "/static/uploads";

const FALLBACK_NAME: &str = "upload";

/// Reduce a client-supplied filename to a safe single path component.
///
/// Path separators become spaces, only ASCII letters, digits, `_`, `.` and `-`
/// survive, whitespace runs collapse to `_`, and leading/trailing `.`/`_` are
/// stripped so the result can never be `..` or a hidden file.
pub fn sanitize_filename(original: &str) -> String {
    let flattened: String = original
        .chars()
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();

    let joined = flattened.split_whitespace().collect::<Vec<_>>().join("_");
    let kept: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect();

    let trimmed = kept.trim_matches(|c| c == '.' || c == '_');
    if trimmed.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}

/// `{YYYYmmddHHMMSSffffff}_{name}`: the microsecond prefix keeps names unique
/// across uploads of the same file.
pub fn stored_filename(safe_name: &str, at: NaiveDateTime) -> String {
    format!("{}_{}", at.format("%Y%m%d%H%M%S%6f"), safe_name)
}

pub fn upload_url(stored_name: &str) -> String {
    format!("{}/{}", UPLOAD_URL_PREFIX, stored_name)
}

/// Write an uploaded file into `dir` and return `(stored_name, url)`.
pub async fn save_upload(
    dir: &Path,
    original_name: &str,
    data: &[u8],
) -> std::io::Result<(String, String)> {
    tokio::fs::create_dir_all(dir).await?;

    let safe_name = sanitize_filename(original_name);
    let stored_name = stored_filename(&safe_name, Utc::now().naive_utc());
    let path: PathBuf = dir.join(&stored_name);
    tokio::fs::write(&path, data).await?;

    log::info!("Saved upload {} ({} bytes)", path.display(), data.len());
    let url = upload_url(&stored_name);
    Ok((stored_name, url))
}
