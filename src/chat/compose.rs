// Compose state for the conversation window: free text plus staged attachments.

use log::{debug, warn};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{ChatError, Result};
use crate::models::AttachmentKind;

pub const DEFAULT_ATTACHMENT_CAP: usize = 5;

/// A file picked for sending, previewed locally until the server copy comes back
#[derive(Debug, Clone, PartialEq)]
pub struct StagedAttachment {
    pub local_id: String,
    pub path: PathBuf,
    pub filename: String,
    pub mime: String,
    pub kind: AttachmentKind,
    pub size: u64,
    pub preview_url: String,
}

impl StagedAttachment {
    pub fn from_path(path: &Path) -> Result<Self> {
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(ChatError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            )));
        }
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "attachment".to_string());
        let mime = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        Ok(Self::from_parts(path, &filename, &mime, metadata.len()))
    }

    pub fn from_parts(path: &Path, filename: &str, mime: &str, size: u64) -> Self {
        let preview_url = std::fs::canonicalize(path)
            .ok()
            .and_then(|abs| url::Url::from_file_path(abs).ok())
            .map(|u| u.to_string())
            .unwrap_or_else(|| path.display().to_string());
        StagedAttachment {
            local_id: Uuid::new_v4().to_string(),
            path: path.to_path_buf(),
            filename: filename.to_string(),
            mime: mime.to_string(),
            kind: AttachmentKind::from_mime(mime),
            size,
            preview_url,
        }
    }
}

/// What actually goes out when the user hits send
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub text: String,
    pub attachments: Vec<StagedAttachment>,
}

#[derive(Debug)]
pub struct Composer {
    text: String,
    attachments: Vec<StagedAttachment>,
    cap: usize,
    sending: bool,
}

impl Composer {
    pub fn new(cap: usize) -> Self {
        Composer {
            text: String::new(),
            attachments: Vec::new(),
            cap,
            sending: false,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn set_text(&mut self, text: &str) {
        self.text = text.to_string();
    }

    pub fn attachments(&self) -> &[StagedAttachment] {
        &self.attachments
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Stage another file. Over the cap the new file is refused and the staged ones stay as they are.
    pub fn stage(&mut self, attachment: StagedAttachment) -> Result<()> {
        if self.attachments.len() >= self.cap {
            warn!(
                "Refusing to stage {}: {} attachments already staged",
                attachment.filename,
                self.attachments.len()
            );
            return Err(ChatError::AttachmentLimit(self.cap));
        }
        debug!("Staged attachment {} ({} bytes)", attachment.filename, attachment.size);
        self.attachments.push(attachment);
        Ok(())
    }

    pub fn unstage(&mut self, local_id: &str) -> Option<StagedAttachment> {
        let index = self.attachments.iter().position(|a| a.local_id == local_id)?;
        Some(self.attachments.remove(index))
    }

    pub fn unstage_last(&mut self) -> Option<StagedAttachment> {
        self.attachments.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.attachments.is_empty()
    }

    pub fn is_sending(&self) -> bool {
        self.sending
    }

    /// Snapshot the compose state for sending and raise the `sending` flag.
    /// Nothing is cleared here; that waits for `finish(true)`.
    pub fn begin(&mut self) -> Result<Submission> {
        if self.sending {
            return Err(ChatError::SendInProgress);
        }
        if self.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        self.sending = true;
        Ok(Submission {
            text: self.text.trim().to_string(),
            attachments: self.attachments.clone(),
        })
    }

    /// Lower the `sending` flag. A confirmed send takes out what it carried;
    /// text or files staged while it was in flight stay.
    pub fn finish(&mut self, submission: &Submission, delivered: bool) {
        self.sending = false;
        if !delivered {
            return;
        }
        if self.text.trim() == submission.text {
            self.text.clear();
        }
        self.attachments
            .retain(|a| !submission.attachments.iter().any(|sent| sent.local_id == a.local_id));
    }
}

impl Default for Composer {
    fn default() -> Self {
        Composer::new(DEFAULT_ATTACHMENT_CAP)
    }
}
