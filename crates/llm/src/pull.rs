//! Progress reporting for `POST /api/pull`, which answers with one JSON object
//! per line until it reports `success` or an `error`.

use serde::Deserialize;
use snafu::ResultExt;

use super::error::{PayloadParseSnafu, ProviderResult};
use super::model::format_size;

const SUCCESS_STATUS: &str = "success";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullProgress {
    pub status: String,
    pub digest: Option<String>,
    pub total: Option<u64>,
    pub completed: Option<u64>,
}

impl PullProgress {
    /// Whole percent of the current layer, when the server reports sizes.
    pub fn percent(&self) -> Option<u8> {
        match (self.completed, self.total) {
            (Some(completed), Some(total)) if total > 0 => {
                let percent = completed.min(total).saturating_mul(100) / total;
                u8::try_from(percent).ok()
            }
            _ => None,
        }
    }

    /// One-line status such as `pulling 6a0746a1ec1a 45% (1.2 GB / 2.0 GB)`.
    pub fn summary(&self) -> String {
        let mut line = self.status.clone();
        if let (Some(percent), Some(completed), Some(total)) =
            (self.percent(), self.completed, self.total)
        {
            line.push_str(&format!(
                " {percent}% ({} / {})",
                format_size(completed),
                format_size(total)
            ));
        }
        line
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullEvent {
    Progress(PullProgress),
    Done,
    Error(String),
}

#[derive(Debug, Deserialize)]
struct PullLine {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    digest: Option<String>,
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    completed: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

pub fn parse_pull_line(line: &[u8]) -> ProviderResult<PullEvent> {
    let line: PullLine = serde_json::from_slice(line).context(PayloadParseSnafu {
        stage: "parse-pull-line",
    })?;

    if let Some(error) = line.error.filter(|error| !error.trim().is_empty()) {
        return Ok(PullEvent::Error(error));
    }

    let status = line.status.unwrap_or_default();
    if status == SUCCESS_STATUS {
        return Ok(PullEvent::Done);
    }

    Ok(PullEvent::Progress(PullProgress {
        status,
        digest: line.digest,
        total: line.total,
        completed: line.completed,
    }))
}

/// Reassembles newline-delimited records from arbitrarily split body chunks.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Appends `chunk` and returns every line it completed, without the newline.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(newline) = self.pending.iter().position(|byte| *byte == b'\n') {
            let mut line = self.pending.drain(..=newline).collect::<Vec<_>>();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if !line.iter().all(u8::is_ascii_whitespace) {
                lines.push(line);
            }
        }
        lines
    }

    /// The trailing record of a body that did not end with a newline.
    pub fn finish(self) -> Option<Vec<u8>> {
        (!self.pending.iter().all(u8::is_ascii_whitespace)).then_some(self.pending)
    }
}
