//! Persisting synthesized audio.

use std::path::{Path, PathBuf};

use tracing::info;

use voxbridge_core::error::Result;
use voxbridge_core::token::CorrelationToken;
use voxbridge_endpoints::audio::sniff_extension;

/// Write `audio` to `<dir>/<token>_output.<ext>`. The extension comes from
/// the audio header, falling back to `default_ext`.
pub async fn save_synthesis(
    dir: &Path,
    token: &CorrelationToken,
    audio: &[u8],
    default_ext: &str,
) -> Result<PathBuf> {
    let ext = sniff_extension(audio).unwrap_or(default_ext);
    tokio::fs::create_dir_all(dir).await?;

    let path = dir.join(format!("{token}_output.{ext}"));
    tokio::fs::write(&path, audio).await?;
    info!(path = %path.display(), bytes = audio.len(), "Saved synthesized audio");

    Ok(path)
}
