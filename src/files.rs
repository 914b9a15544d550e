// src/files.rs
// Blob store behind /api/upload and /downloads. Opaque bytes, no auth.

use std::io;
use std::path::{Path, PathBuf};

use tracing::info;
use uuid::Uuid;

/// Upload bodies above this are refused at the HTTP layer.
pub const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

const MAX_NAME_LEN: usize = 80;

pub struct FileStore {
    dir: PathBuf,
    public_addr: String,
}

impl FileStore {
    pub fn open(dir: &Path, public_addr: &str) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            public_addr: public_addr.to_string(),
        })
    }

    /// Persist a blob under a minted name and return its download URL. The
    /// minted name keeps the caller's filename readable but prefixes a
    /// random tag so two uploads never collide.
    pub async fn store(&self, suggested: Option<&str>, bytes: &[u8]) -> io::Result<String> {
        let base = sanitize(suggested.unwrap_or("upload.bin"));
        let tag = Uuid::new_v4().simple().to_string();
        let name = format!("{}-{}", &tag[..8], base);
        tokio::fs::write(self.dir.join(&name), bytes).await?;
        info!(name = %name, size = bytes.len(), "stored upload");
        Ok(format!("http://{}/downloads/{}", self.public_addr, name))
    }

    /// Read a stored blob back. Returns None for unknown or unsafe names.
    pub async fn read(&self, name: &str) -> Option<Vec<u8>> {
        if !valid_name(name) {
            return None;
        }
        tokio::fs::read(self.dir.join(name)).await.ok()
    }
}

/// Keep only filesystem-safe characters and bound the length.
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_start_matches('.');
    let mut out: String = trimmed.chars().take(MAX_NAME_LEN).collect();
    if out.is_empty() {
        out = "upload.bin".into();
    }
    out
}

// Leading-dot names cover "." and ".." as well; separators are never minted.
fn valid_name(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('.') && !name.contains('/') && !name.contains('\\')
}
